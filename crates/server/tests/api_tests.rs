//! Integration tests for HTTP API endpoints.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{ADMIN_TOKEN, READ_TOKEN, Reply, TestServer, sha1_hex, sha256_hex};
use serde_json::{Value, json};
use std::net::TcpListener;
use tower::ServiceExt;
use uuid::Uuid;

/// Helper to make JSON requests.
async fn json_request(
    router: &axum::Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    auth_token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);

    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }

    let body = match body {
        Some(v) => {
            builder = builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();

    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let json: Value = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };

    (status, json)
}

/// Fetch an artifact; returns status, headers and raw body.
async fn get_artifact(
    router: &axum::Router,
    uri: &str,
    auth_token: Option<&str>,
    if_none_match: Option<&str>,
) -> (StatusCode, axum::http::HeaderMap, bytes::Bytes) {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = auth_token {
        builder = builder.header("Authorization", format!("Bearer {}", token));
    }
    if let Some(etag) = if_none_match {
        builder = builder.header(header::IF_NONE_MATCH, etag);
    }
    let response = router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, headers, body)
}

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn id_of(body: &Value, field: &str) -> String {
    body[field]
        .as_str()
        .unwrap_or_else(|| panic!("missing {field} in {body}"))
        .to_string()
}

async fn create_registry(server: &TestServer, group_id: Uuid, name: &str, kind: &str) -> String {
    let (status, body) = json_request(
        &server.router,
        "POST",
        &format!("/v1/groups/{group_id}/registries"),
        Some(json!({ "name": name, "kind": kind })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    id_of(&body, "registry_id")
}

async fn create_upstream(server: &TestServer, registry_id: &str, name: &str, url: &str) -> Value {
    let (status, body) = json_request(
        &server.router,
        "POST",
        &format!("/v1/registries/{registry_id}/upstreams"),
        Some(json!({
            "name": name,
            "url": url,
            "default_rule_action": "allow",
        })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    // Health endpoint is intentionally unauthenticated.
    let (status, body) = json_request(&server.router, "GET", "/v1/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.get("status").and_then(|v| v.as_str()), Some("ok"));
    assert_eq!(
        body.get("storage_backend").and_then(|v| v.as_str()),
        Some("filesystem")
    );
}

#[tokio::test]
async fn test_admin_requires_token() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let uri = format!("/v1/groups/{group_id}/registries");

    let (status, body) = json_request(&server.router, "GET", &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = json_request(&server.router, "GET", &uri, None, Some("wrong-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = json_request(
        &server.router,
        "POST",
        &uri,
        Some(json!({ "name": "maven-proxy", "kind": "maven" })),
        Some(READ_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, body) = json_request(&server.router, "GET", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_registry_crud() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let registry_id = create_registry(&server, group_id, "maven-proxy", "maven").await;

    let (status, body) = json_request(
        &server.router,
        "POST",
        &format!("/v1/groups/{group_id}/registries"),
        Some(json!({ "name": "maven-proxy", "kind": "maven" })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "{body}");

    let (status, body) = json_request(
        &server.router,
        "POST",
        &format!("/v1/groups/{group_id}/registries"),
        Some(json!({ "name": "pypi", "kind": "pypi" })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");

    let uri = format!("/v1/registries/{registry_id}");
    let (status, body) = json_request(
        &server.router,
        "PATCH",
        &uri,
        Some(json!({ "enabled": false })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);
    assert_eq!(body["kind"], "maven");

    let (status, body) = json_request(&server.router, "GET", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "maven-proxy");

    // Read tokens fetch artifacts but do not see the admin surface.
    let (status, _) = json_request(&server.router, "GET", &uri, None, Some(READ_TOKEN)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = json_request(&server.router, "DELETE", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = json_request(&server.router, "GET", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_upstream_validation() {
    let server = TestServer::new().await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "npm-proxy", "npm").await;
    let uri = format!("/v1/registries/{registry_id}/upstreams");

    for body in [
        json!({ "name": "x", "url": "ftp://mirror.example", "default_rule_action": "allow" }),
        json!({ "name": "x", "url": "https://mirror.example/?q=1", "default_rule_action": "allow" }),
        json!({ "name": "x", "url": "https://mirror.example" }),
        json!({ "name": "x", "url": "https://mirror.example", "default_rule_action": "maybe" }),
        json!({ "name": "x", "url": "https://mirror.example", "default_rule_action": "allow", "cache_validity_hours": -1 }),
        json!({ "name": "x", "url": "https://mirror.example", "default_rule_action": "allow", "credential_ref": "unknown" }),
    ] {
        let (status, response) =
            json_request(&server.router, "POST", &uri, Some(body.clone()), Some(ADMIN_TOKEN)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body} -> {response}");
    }

    let (_, list) = json_request(&server.router, "GET", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn test_upstream_ordering_endpoints() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let registry_id = create_registry(&server, group_id, "maven-proxy", "maven").await;

    let a = create_upstream(&server, &registry_id, "a", "https://a.example").await;
    let b = create_upstream(&server, &registry_id, "b", "https://b.example").await;
    let c = create_upstream(&server, &registry_id, "c", "https://c.example").await;
    assert_eq!(a["position"], 1);
    assert_eq!(c["position"], 3);

    let (status, list) = json_request(
        &server.router,
        "PUT",
        &format!(
            "/v1/registries/{registry_id}/upstreams/{}/position",
            id_of(&c, "upstream_id")
        ),
        Some(json!({ "position": 1 })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{list}");
    let names: Vec<_> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|u| (u["position"].as_i64().unwrap(), u["name"].as_str().unwrap()))
        .collect();
    assert_eq!(names, vec![(1, "c"), (2, "a"), (3, "b")]);

    let (status, _) = json_request(
        &server.router,
        "PUT",
        &format!(
            "/v1/registries/{registry_id}/upstreams/{}/position",
            id_of(&b, "upstream_id")
        ),
        Some(json!({ "position": 0 })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Share `a` with a second registry, then detach it from the first.
    let other_id = create_registry(&server, group_id, "maven-release", "maven").await;
    let (status, attached) = json_request(
        &server.router,
        "POST",
        &format!("/v1/registries/{other_id}/upstreams"),
        Some(json!({ "upstream_id": id_of(&a, "upstream_id") })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{attached}");
    assert_eq!(attached["position"], 1);

    let (status, _) = json_request(
        &server.router,
        "DELETE",
        &format!(
            "/v1/registries/{registry_id}/upstreams/{}",
            id_of(&a, "upstream_id")
        ),
        None,
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, list) = json_request(
        &server.router,
        "GET",
        &format!("/v1/registries/{registry_id}/upstreams"),
        None,
        Some(ADMIN_TOKEN),
    )
    .await;
    let positions: Vec<_> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|u| u["position"].as_i64().unwrap())
        .collect();
    assert_eq!(positions, vec![1, 2]);

    // An npm registry cannot take a maven upstream.
    let npm_id = create_registry(&server, group_id, "npm-proxy", "npm").await;
    let (status, _) = json_request(
        &server.router,
        "POST",
        &format!("/v1/registries/{npm_id}/upstreams"),
        Some(json!({ "upstream_id": id_of(&a, "upstream_id") })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_upstream_update_and_delete() {
    let server = TestServer::new().await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "npm-proxy", "npm").await;
    let upstream = create_upstream(&server, &registry_id, "npmjs", "https://registry.example").await;
    let upstream_id = id_of(&upstream, "upstream_id");
    assert_eq!(upstream["cache_validity_hours"], 24);

    let uri = format!("/v1/upstreams/{upstream_id}");
    let (status, body) = json_request(
        &server.router,
        "PATCH",
        &uri,
        Some(json!({ "cache_validity_hours": 0, "description": "public npm" })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["cache_validity_hours"], 0);
    assert_eq!(body["description"], "public npm");

    let (status, stats) =
        json_request(&server.router, "DELETE", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["registries_detached"], 1);
    assert_eq!(stats["entries_deleted"], 0);

    let (status, _) = json_request(&server.router, "GET", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rule_crud() {
    let server = TestServer::new().await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "maven-proxy", "maven").await;
    let upstream = create_upstream(&server, &registry_id, "central", "https://repo.example").await;
    let rules_uri = format!("/v1/upstreams/{}/rules", id_of(&upstream, "upstream_id"));

    let (status, first) = json_request(
        &server.router,
        "POST",
        &rules_uri,
        Some(json!({ "pattern": "com.internal.*", "action": "deny" })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{first}");
    assert_eq!(first["pattern_type"], "wildcard");
    assert_eq!(first["target"], "group");
    assert_eq!(first["position"], 1);

    let (status, second) = json_request(
        &server.router,
        "POST",
        &rules_uri,
        Some(json!({
            "pattern": "^1\\.[0-9]+$",
            "pattern_type": "regex",
            "action": "allow",
            "target": "version",
            "position": 1,
        })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{second}");
    assert_eq!(second["position"], 1);

    let (status, _) = json_request(
        &server.router,
        "POST",
        &rules_uri,
        Some(json!({ "pattern": "([", "pattern_type": "regex", "action": "deny" })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, list) = json_request(&server.router, "GET", &rules_uri, None, Some(ADMIN_TOKEN)).await;
    let patterns: Vec<_> = list
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["pattern"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(patterns, vec!["^1\\.[0-9]+$", "com.internal.*"]);

    let rule_uri = format!("/v1/rules/{}", id_of(&first, "rule_id"));
    let (status, updated) = json_request(
        &server.router,
        "PATCH",
        &rule_uri,
        Some(json!({ "action": "allow", "position": 1 })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{updated}");
    assert_eq!(updated["action"], "allow");
    assert_eq!(updated["position"], 1);

    let (status, _) =
        json_request(&server.router, "DELETE", &rule_uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = json_request(&server.router, "GET", &rule_uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cleanup_policy_endpoints() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let uri = format!("/v1/groups/{group_id}/cleanup_policy");

    let (status, _) = json_request(&server.router, "GET", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = json_request(
        &server.router,
        "PUT",
        &uri,
        Some(json!({ "cadence_days": 3 })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, policy) = json_request(
        &server.router,
        "PUT",
        &uri,
        Some(json!({ "cadence_days": 14, "keep_n_days_after_download": 7 })),
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{policy}");
    assert_eq!(policy["enabled"], true);
    assert_eq!(policy["status"], "idle");
    assert_eq!(policy["notify_on_failure"], true);

    let (status, outcome) = json_request(
        &server.router,
        "POST",
        &format!("{uri}/run"),
        None,
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{outcome}");
    assert_eq!(outcome["outcome"], "completed");
    assert_eq!(outcome["summary"]["deleted_entries"], 0);

    let (_, policy) = json_request(&server.router, "GET", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(policy["status"], "completed");

    // A run that is still going blocks a second trigger.
    server
        .metadata()
        .try_begin_cleanup_run(group_id, time::OffsetDateTime::now_utc())
        .await
        .unwrap();
    let (status, _) = json_request(
        &server.router,
        "POST",
        &format!("{uri}/run"),
        None,
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = json_request(&server.router, "DELETE", &uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = json_request(
        &server.router,
        "POST",
        &format!("{uri}/run"),
        None,
        Some(ADMIN_TOKEN),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_artifact_fetch_and_conditional_get() {
    let server = TestServer::new().await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "maven-proxy", "maven").await;
    let upstream = create_upstream(
        &server,
        &registry_id,
        "central",
        "https://repo.example/maven2",
    )
    .await;

    let path = "org/acme/lib/1.0/lib-1.0.jar";
    let data = b"jar contents";
    server.upstream().script(
        &format!("https://repo.example/maven2/{path}"),
        vec![Reply::body_with_sha1(&data[..], &sha1_hex(data))],
    );

    let uri = format!("/v1/virtual_registries/maven/{registry_id}/{path}");
    let (status, headers, body) = get_artifact(&server.router, &uri, Some(READ_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], data);
    assert_eq!(headers["x-cache"], "miss");
    assert_eq!(headers["x-checksum-sha1"], sha1_hex(data).as_str());
    assert_eq!(headers[header::CONTENT_LENGTH], data.len().to_string().as_str());
    let etag = headers[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(etag, format!("\"{}\"", sha256_hex(data)));

    let (status, headers, body) = get_artifact(&server.router, &uri, Some(READ_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-cache"], "hit");
    assert_eq!(&body[..], data);

    let (status, headers, body) =
        get_artifact(&server.router, &uri, Some(READ_TOKEN), Some(&etag)).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert!(body.is_empty());
    assert_eq!(headers[header::ETAG], etag.as_str());
    assert_eq!(server.upstream().total_calls(), 1);

    // The entry shows up in the admin listing and can be purged.
    let entries_uri = format!(
        "/v1/upstreams/{}/cache_entries",
        id_of(&upstream, "upstream_id")
    );
    let (status, entries) =
        json_request(&server.router, "GET", &entries_uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["relative_path"], path);

    for _ in 0..2 {
        let (status, _) = json_request(
            &server.router,
            "DELETE",
            &format!("{entries_uri}?path={path}"),
            None,
            Some(ADMIN_TOKEN),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (_, entries) =
        json_request(&server.router, "GET", &entries_uri, None, Some(ADMIN_TOKEN)).await;
    assert_eq!(entries, json!([]));
}

#[tokio::test]
async fn test_artifact_not_found_is_uniform() {
    let server = TestServer::new().await;
    let group_id = Uuid::new_v4();
    let empty_id = create_registry(&server, group_id, "empty", "npm").await;
    let with_upstream = create_registry(&server, group_id, "with-upstream", "npm").await;
    create_upstream(&server, &with_upstream, "npmjs", "https://registry.example").await;
    let disabled_id = create_registry(&server, group_id, "disabled", "npm").await;
    json_request(
        &server.router,
        "PATCH",
        &format!("/v1/registries/{disabled_id}"),
        Some(json!({ "enabled": false })),
        Some(ADMIN_TOKEN),
    )
    .await;

    let uris = [
        format!("/v1/virtual_registries/pypi/{empty_id}/left-pad"),
        "/v1/virtual_registries/npm/not-a-uuid/left-pad".to_string(),
        format!("/v1/virtual_registries/npm/{}/left-pad", Uuid::new_v4()),
        format!("/v1/virtual_registries/maven/{empty_id}/left-pad"),
        format!("/v1/virtual_registries/npm/{disabled_id}/left-pad"),
        format!("/v1/virtual_registries/npm/{empty_id}/left-pad"),
        format!("/v1/virtual_registries/npm/{with_upstream}/left-pad"),
    ];

    let mut bodies = Vec::new();
    for uri in &uris {
        let (status, _, body) = get_artifact(&server.router, uri, Some(READ_TOKEN), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        bodies.push(body);
    }
    assert!(bodies.windows(2).all(|w| w[0] == w[1]), "{bodies:?}");
}

#[tokio::test]
async fn test_artifact_requires_auth_unless_anonymous_read() {
    let server = TestServer::new().await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "npm-proxy", "npm").await;
    let uri = format!("/v1/virtual_registries/npm/{registry_id}/left-pad");

    let (status, _, _) = get_artifact(&server.router, &uri, None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let open = TestServer::with_config(|config| config.auth.allow_anonymous_read = true).await;
    let registry_id = create_registry(&open, Uuid::new_v4(), "npm-proxy", "npm").await;
    create_upstream(&open, &registry_id, "npmjs", "https://registry.example").await;
    open.upstream()
        .script("https://registry.example/left-pad", vec![Reply::body("{}")]);
    let uri = format!("/v1/virtual_registries/npm/{registry_id}/left-pad");
    let (status, headers, _) = get_artifact(&open.router, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
}

#[tokio::test]
async fn test_artifact_path_traversal_rejected() {
    let server = TestServer::new().await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "npm-proxy", "npm").await;
    let uri = format!("/v1/virtual_registries/npm/{registry_id}/a/../../etc/passwd");
    let (status, _, _) = get_artifact(&server.router, &uri, Some(READ_TOKEN), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_upstream_failure_maps_to_bad_gateway() {
    let server = TestServer::new().await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "npm-proxy", "npm").await;
    create_upstream(&server, &registry_id, "npmjs", "https://registry.example").await;
    server
        .upstream()
        .script("https://registry.example/left-pad", vec![Reply::Status(503)]);

    let uri = format!("/v1/virtual_registries/npm/{registry_id}/left-pad");
    let (status, _, body) = get_artifact(&server.router, &uri, Some(READ_TOKEN), None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], "upstream_error");
}

#[tokio::test]
async fn test_end_to_end_over_http() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let mock = httpmock::MockServer::start_async().await;
    let path = "org/acme/lib/2.0/lib-2.0.pom";
    let pom = "<project/>";
    let fetched = mock
        .mock_async(|when, then| {
            when.method(httpmock::Method::GET).path(format!("/maven2/{path}"));
            then.status(200)
                .header("content-type", "application/xml")
                .header("etag", "\"pom-v1\"")
                .header("x-checksum-sha1", sha1_hex(pom.as_bytes()))
                .body(pom);
        })
        .await;

    let server = TestServer::with_http_client(|_| {}).await;
    let registry_id = create_registry(&server, Uuid::new_v4(), "maven-proxy", "maven").await;
    create_upstream(
        &server,
        &registry_id,
        "mock",
        &format!("{}/maven2", mock.base_url()),
    )
    .await;

    let uri = format!("/v1/virtual_registries/maven/{registry_id}/{path}");
    let (status, headers, body) = get_artifact(&server.router, &uri, Some(READ_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], pom.as_bytes());
    assert_eq!(headers[header::CONTENT_TYPE], "application/xml");
    assert_eq!(headers[header::ETAG], "\"pom-v1\"");

    let (status, _, _) = get_artifact(&server.router, &uri, Some(READ_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    fetched.assert_hits_async(1).await;
}
