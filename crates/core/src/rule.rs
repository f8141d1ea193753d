//! Upstream rules: first-match-wins allow/deny filtering by coordinate.

use crate::coordinate::Coordinate;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Compiled regexes larger than this are rejected.
const MAX_REGEX_SIZE: usize = 1 << 20;

/// Maximum pattern length accepted from administrators.
pub const MAX_PATTERN_LEN: usize = 255;

/// Whether a matching rule admits or excludes the upstream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

impl RuleAction {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            other => Err(crate::Error::InvalidRule(format!(
                "unknown rule action: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule's pattern is interpreted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// `*` matches any run of characters, `?` matches a single character.
    /// A trailing `.*` also matches the bare prefix.
    #[default]
    Wildcard,
    /// Regular expression, unanchored unless the pattern anchors itself.
    Regex,
}

impl PatternType {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "wildcard" => Ok(Self::Wildcard),
            "regex" => Ok(Self::Regex),
            other => Err(crate::Error::InvalidRule(format!(
                "unknown pattern type: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wildcard => "wildcard",
            Self::Regex => "regex",
        }
    }
}

/// Component of the artifact coordinate a rule is evaluated against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetCoordinate {
    #[default]
    Group,
    Artifact,
    Version,
    Path,
}

impl TargetCoordinate {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "group" => Ok(Self::Group),
            "artifact" => Ok(Self::Artifact),
            "version" => Ok(Self::Version),
            "path" => Ok(Self::Path),
            other => Err(crate::Error::InvalidRule(format!(
                "unknown target coordinate: {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Artifact => "artifact",
            Self::Version => "version",
            Self::Path => "path",
        }
    }
}

/// A rule attached to an upstream, in evaluation order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub id: Uuid,
    pub position: u32,
    pub pattern: String,
    pub pattern_type: PatternType,
    pub action: RuleAction,
    pub target: TargetCoordinate,
}

/// Compile a pattern into a regex.
pub fn compile_pattern(pattern: &str, pattern_type: PatternType) -> crate::Result<Regex> {
    if pattern.is_empty() || pattern.len() > MAX_PATTERN_LEN {
        return Err(crate::Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: format!("length must be between 1 and {MAX_PATTERN_LEN}"),
        });
    }

    let source = match pattern_type {
        PatternType::Wildcard => wildcard_to_regex(pattern),
        PatternType::Regex => pattern.to_string(),
    };

    RegexBuilder::new(&source)
        .size_limit(MAX_REGEX_SIZE)
        .build()
        .map_err(|e| crate::Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

fn wildcard_to_regex(pattern: &str) -> String {
    fn translate(out: &mut String, s: &str) {
        for c in s.chars() {
            match c {
                '*' => out.push_str(".*"),
                '?' => out.push('.'),
                other => out.push_str(&regex::escape(other.encode_utf8(&mut [0u8; 4]))),
            }
        }
    }

    let mut out = String::from("^");
    match pattern.strip_suffix(".*") {
        Some(prefix) if !prefix.is_empty() => {
            translate(&mut out, prefix);
            out.push_str(r"(\..*)?");
        }
        _ => translate(&mut out, pattern),
    }
    out.push('$');
    out
}

/// Outcome of evaluating an upstream's rules for one coordinate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Evaluation {
    /// Effective action for the upstream.
    pub action: RuleAction,
    /// Rule that decided the action, `None` when the default applied.
    pub matched_rule: Option<Uuid>,
    /// Rules skipped because their pattern failed to compile.
    pub invalid_rules: Vec<(Uuid, String)>,
}

impl Evaluation {
    pub fn is_allowed(&self) -> bool {
        self.action == RuleAction::Allow
    }
}

/// Evaluate rules in position order; the first match wins.
///
/// Rules whose pattern does not compile are treated as non-matching and are
/// reported in [`Evaluation::invalid_rules`]. When nothing matches, the
/// upstream's explicit `default_action` applies.
pub fn evaluate(rules: &[Rule], default_action: RuleAction, coordinate: &Coordinate) -> Evaluation {
    let mut ordered: Vec<&Rule> = rules.iter().collect();
    ordered.sort_by_key(|r| r.position);

    let mut invalid_rules = Vec::new();
    for rule in ordered {
        let regex = match compile_pattern(&rule.pattern, rule.pattern_type) {
            Ok(regex) => regex,
            Err(e) => {
                invalid_rules.push((rule.id, e.to_string()));
                continue;
            }
        };
        let Some(subject) = coordinate.component(rule.target) else {
            continue;
        };
        if regex.is_match(subject) {
            return Evaluation {
                action: rule.action,
                matched_rule: Some(rule.id),
                invalid_rules,
            };
        }
    }

    Evaluation {
        action: default_action,
        matched_rule: None,
        invalid_rules,
    }
}
