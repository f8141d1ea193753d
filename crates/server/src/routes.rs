//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        // Registries
        .route(
            "/v1/groups/{group_id}/registries",
            post(handlers::create_registry).get(handlers::list_registries),
        )
        .route(
            "/v1/registries/{registry_id}",
            get(handlers::get_registry)
                .patch(handlers::update_registry)
                .delete(handlers::delete_registry),
        )
        // Upstream ordering within a registry
        .route(
            "/v1/registries/{registry_id}/upstreams",
            post(handlers::attach_upstream).get(handlers::list_registry_upstreams),
        )
        .route(
            "/v1/registries/{registry_id}/upstreams/{upstream_id}",
            axum::routing::delete(handlers::detach_upstream),
        )
        .route(
            "/v1/registries/{registry_id}/upstreams/{upstream_id}/position",
            put(handlers::move_upstream),
        )
        // Upstreams
        .route(
            "/v1/upstreams/{upstream_id}",
            get(handlers::get_upstream)
                .patch(handlers::update_upstream)
                .delete(handlers::delete_upstream),
        )
        .route(
            "/v1/upstreams/{upstream_id}/rules",
            post(handlers::create_rule).get(handlers::list_rules),
        )
        .route(
            "/v1/upstreams/{upstream_id}/cache_entries",
            get(handlers::list_cache_entries).delete(handlers::delete_cache_entry),
        )
        // Rules
        .route(
            "/v1/rules/{rule_id}",
            get(handlers::get_rule)
                .patch(handlers::update_rule)
                .delete(handlers::delete_rule),
        )
        // Cleanup
        .route(
            "/v1/groups/{group_id}/cleanup_policy",
            get(handlers::get_cleanup_policy)
                .put(handlers::put_cleanup_policy)
                .delete(handlers::delete_cleanup_policy),
        )
        .route(
            "/v1/groups/{group_id}/cleanup_policy/run",
            post(handlers::run_cleanup),
        );

    let artifact_routes = Router::new()
        // Health check (intentionally unauthenticated for load balancer probes)
        .route("/v1/health", get(handlers::health_check))
        .route(
            "/v1/virtual_registries/{kind}/{registry_id}/{*path}",
            get(handlers::get_artifact),
        );

    let mut router = Router::new().merge(admin_routes).merge(artifact_routes);

    // When enabled, restrict /metrics to the scraper at the network level.
    if state.config.server.metrics_enabled {
        let metrics_routes = Router::new().route("/metrics", get(metrics_handler));
        router = router.merge(metrics_routes);
    }

    // Order of execution: TraceLayer -> Auth -> Handler
    router
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
