//! Upstream selection: which of a registry's upstreams may serve a path.

use vreg_core::rule::{self, Evaluation};
use vreg_core::{Coordinate, Rule, RuleAction};
use vreg_metadata::MetadataStore;
use vreg_metadata::models::{RegistryRow, UpstreamRow};
use vreg_metadata::MetadataResult;

/// An upstream with the rules that decide whether it may serve a request.
#[derive(Debug, Clone)]
pub struct UpstreamWithRules {
    pub upstream: UpstreamRow,
    pub rules: Vec<Rule>,
}

/// Keep the upstreams whose rules allow `coordinate`, preserving order.
///
/// An upstream whose stored default action cannot be parsed is excluded.
pub fn filter_upstreams(
    upstreams: Vec<UpstreamWithRules>,
    coordinate: &Coordinate,
) -> Vec<UpstreamRow> {
    upstreams
        .into_iter()
        .filter(|candidate| {
            let default_action = match candidate.upstream.default_rule_action() {
                Ok(action) => action,
                Err(e) => {
                    tracing::warn!(
                        upstream_id = %candidate.upstream.upstream_id,
                        error = %e,
                        "upstream has an invalid default rule action, skipping"
                    );
                    return false;
                }
            };
            let evaluation = rule::evaluate(&candidate.rules, default_action, coordinate);
            log_evaluation(&candidate.upstream, &evaluation);
            evaluation.is_allowed()
        })
        .map(|candidate| candidate.upstream)
        .collect()
}

fn log_evaluation(upstream: &UpstreamRow, evaluation: &Evaluation) {
    for (rule_id, reason) in &evaluation.invalid_rules {
        tracing::warn!(
            upstream_id = %upstream.upstream_id,
            rule_id = %rule_id,
            reason = %reason,
            "ignoring rule with invalid pattern"
        );
    }
    if evaluation.action == RuleAction::Deny {
        tracing::debug!(
            upstream_id = %upstream.upstream_id,
            matched_rule = ?evaluation.matched_rule,
            "upstream excluded by rules"
        );
    }
}

/// Load a registry's upstreams in position order and filter them for `coordinate`.
pub async fn select_candidates(
    metadata: &dyn MetadataStore,
    registry: &RegistryRow,
    coordinate: &Coordinate,
) -> MetadataResult<Vec<UpstreamRow>> {
    let positioned = metadata.list_registry_upstreams(registry.registry_id).await?;

    let mut upstreams = Vec::with_capacity(positioned.len());
    for entry in positioned {
        let rows = metadata.list_rules(entry.upstream.upstream_id).await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            match row.to_rule() {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!(
                    rule_id = %row.rule_id,
                    error = %e,
                    "skipping unreadable rule"
                ),
            }
        }
        upstreams.push(UpstreamWithRules {
            upstream: entry.upstream,
            rules,
        });
    }

    Ok(filter_upstreams(upstreams, coordinate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use uuid::Uuid;
    use vreg_core::{PatternType, RegistryKind, TargetCoordinate};

    fn upstream(name: &str, default_action: &str) -> UpstreamRow {
        let now = OffsetDateTime::now_utc();
        UpstreamRow {
            upstream_id: Uuid::new_v4(),
            group_id: Uuid::nil(),
            name: name.to_string(),
            description: None,
            kind: "maven".to_string(),
            url: format!("https://{name}.example.com/maven2"),
            credential_ref: None,
            cache_validity_hours: 24,
            default_rule_action: default_action.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    fn rule(position: u32, pattern: &str, action: RuleAction) -> Rule {
        Rule {
            id: Uuid::new_v4(),
            position,
            pattern: pattern.to_string(),
            pattern_type: PatternType::Wildcard,
            action,
            target: TargetCoordinate::Group,
        }
    }

    fn coordinate(path: &str) -> Coordinate {
        Coordinate::parse(RegistryKind::Maven, path)
    }

    #[test]
    fn test_deny_rule_excludes_only_that_upstream() {
        let a = upstream("a", "allow");
        let b = upstream("b", "allow");
        let candidates = vec![
            UpstreamWithRules {
                upstream: a.clone(),
                rules: vec![rule(1, "com.blocked.*", RuleAction::Deny)],
            },
            UpstreamWithRules {
                upstream: b.clone(),
                rules: vec![],
            },
        ];

        let selected = filter_upstreams(
            candidates.clone(),
            &coordinate("com/blocked/lib/1.0/lib-1.0.jar"),
        );
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].upstream_id, b.upstream_id);

        let selected = filter_upstreams(candidates, &coordinate("com/other/lib/1.0/lib-1.0.jar"));
        let ids: Vec<Uuid> = selected.iter().map(|u| u.upstream_id).collect();
        assert_eq!(ids, vec![a.upstream_id, b.upstream_id]);
    }

    #[test]
    fn test_default_deny_with_allow_rule() {
        let internal = upstream("internal", "deny");
        let candidates = vec![UpstreamWithRules {
            upstream: internal.clone(),
            rules: vec![rule(1, "com.acme.*", RuleAction::Allow)],
        }];

        assert_eq!(
            filter_upstreams(candidates.clone(), &coordinate("com/acme/x/1/x-1.jar")).len(),
            1
        );
        assert!(filter_upstreams(candidates, &coordinate("org/other/x/1/x-1.jar")).is_empty());
    }

    #[test]
    fn test_invalid_default_action_fails_closed() {
        let broken = upstream("broken", "maybe");
        let candidates = vec![UpstreamWithRules {
            upstream: broken,
            rules: vec![],
        }];
        assert!(filter_upstreams(candidates, &coordinate("a/b/1/b-1.jar")).is_empty());
    }

    /// Small deterministic generator so the property check needs no extra crates.
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self
                .0
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            self.0 >> 33
        }

        fn pick<'a>(&mut self, items: &'a [&'a str]) -> &'a str {
            items[(self.next() as usize) % items.len()]
        }
    }

    #[test]
    fn test_selection_is_ordered_subsequence_of_attached() {
        let groups = ["com.acme", "com.blocked", "org.apache", "io.netty"];
        let patterns = ["com.*", "com.blocked.*", "org.apache", "*", "io.*", "net.*"];
        let mut rng = Lcg(0x5eed);

        for _ in 0..200 {
            let count = 1 + (rng.next() as usize % 6);
            let candidates: Vec<UpstreamWithRules> = (0..count)
                .map(|i| {
                    let default = if rng.next() % 2 == 0 { "allow" } else { "deny" };
                    let rules = (0..(rng.next() % 4))
                        .map(|p| {
                            let action = if rng.next() % 2 == 0 {
                                RuleAction::Allow
                            } else {
                                RuleAction::Deny
                            };
                            rule(p as u32 + 1, rng.pick(&patterns), action)
                        })
                        .collect();
                    UpstreamWithRules {
                        upstream: upstream(&format!("u{i}"), default),
                        rules,
                    }
                })
                .collect();

            let group = rng.pick(&groups).replace('.', "/");
            let coord = coordinate(&format!("{group}/lib/1.0/lib-1.0.jar"));
            let attached: Vec<Uuid> = candidates.iter().map(|c| c.upstream.upstream_id).collect();
            let expected: Vec<Uuid> = candidates
                .iter()
                .filter(|c| {
                    let action = c.upstream.default_rule_action().unwrap();
                    rule::evaluate(&c.rules, action, &coord).is_allowed()
                })
                .map(|c| c.upstream.upstream_id)
                .collect();

            let selected: Vec<Uuid> = filter_upstreams(candidates, &coord)
                .iter()
                .map(|u| u.upstream_id)
                .collect();

            assert_eq!(selected, expected);
            let mut cursor = attached.iter();
            for id in &selected {
                assert!(cursor.any(|a| a == id), "selection must preserve order");
            }
        }
    }
}
