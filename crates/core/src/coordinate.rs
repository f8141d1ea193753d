//! Artifact coordinates derived from relative request paths.
//!
//! Rules target a component of the coordinate (group, artifact, version) or the
//! raw path. Each registry kind lays its paths out differently, so parsing is
//! kind-specific. Components that cannot be determined are left as `None`, and
//! rules targeting a missing component never match.

use crate::registry::RegistryKind;
use crate::rule::TargetCoordinate;

/// Parsed coordinate of a requested artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Coordinate {
    pub group: Option<String>,
    pub artifact: Option<String>,
    pub version: Option<String>,
    pub path: String,
}

impl Coordinate {
    /// Parse a normalized relative path for the given registry kind.
    pub fn parse(kind: RegistryKind, path: &str) -> Self {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let (group, artifact, version) = match kind {
            RegistryKind::Maven => parse_maven(&segments),
            RegistryKind::Npm => parse_npm(&segments),
            RegistryKind::Container => parse_container(&segments),
        };
        Self {
            group,
            artifact,
            version,
            path: path.to_string(),
        }
    }

    /// Get the component a rule targets.
    pub fn component(&self, target: TargetCoordinate) -> Option<&str> {
        match target {
            TargetCoordinate::Group => self.group.as_deref(),
            TargetCoordinate::Artifact => self.artifact.as_deref(),
            TargetCoordinate::Version => self.version.as_deref(),
            TargetCoordinate::Path => Some(self.path.as_str()),
        }
    }
}

type Parts = (Option<String>, Option<String>, Option<String>);

fn parse_maven(segments: &[&str]) -> Parts {
    let n = segments.len();
    let Some(file) = segments.last() else {
        return (None, None, None);
    };

    if file.starts_with("maven-metadata.xml") {
        // Artifact-level metadata lives next to the version directories, snapshot
        // metadata lives inside a `-SNAPSHOT` version directory.
        if n >= 4 && segments[n - 2].ends_with("-SNAPSHOT") {
            return (
                Some(segments[..n - 3].join(".")),
                Some(segments[n - 3].to_string()),
                Some(segments[n - 2].to_string()),
            );
        }
        return match n {
            0 | 1 => (None, None, None),
            2 => (None, Some(segments[0].to_string()), None),
            _ => (
                Some(segments[..n - 2].join(".")),
                Some(segments[n - 2].to_string()),
                None,
            ),
        };
    }

    match n {
        0..=2 => (None, None, None),
        3 => (
            None,
            Some(segments[0].to_string()),
            Some(segments[1].to_string()),
        ),
        _ => (
            Some(segments[..n - 3].join(".")),
            Some(segments[n - 3].to_string()),
            Some(segments[n - 2].to_string()),
        ),
    }
}

fn parse_npm(segments: &[&str]) -> Parts {
    let (scope, rest) = match segments.first() {
        Some(first) if first.starts_with('@') => (
            Some(first.trim_start_matches('@').to_string()),
            &segments[1..],
        ),
        Some(_) => (None, segments),
        None => return (None, None, None),
    };

    let Some(name) = rest.first() else {
        return (scope, None, None);
    };

    // Tarballs: <name>/-/<name>-<version>.tgz
    let version = match rest {
        [_, "-", tarball] => tarball
            .strip_prefix(&format!("{name}-"))
            .and_then(|v| v.strip_suffix(".tgz"))
            .map(str::to_string),
        _ => None,
    };

    (scope, Some(name.to_string()), version)
}

fn parse_container(segments: &[&str]) -> Parts {
    let marker = segments
        .iter()
        .rposition(|s| *s == "manifests" || *s == "blobs");

    let Some(marker) = marker else {
        return (None, None, None);
    };

    // Tolerate a leading `v2/` API prefix.
    let image = match &segments[..marker] {
        ["v2", rest @ ..] => rest,
        rest => rest,
    };
    let reference = segments.get(marker + 1).map(|s| s.to_string());

    match image {
        [] => (None, None, reference),
        [name] => (None, Some(name.to_string()), reference),
        [namespace @ .., name] => (
            Some(namespace.join("/")),
            Some(name.to_string()),
            reference,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_maven_artifact_file() {
        let c = Coordinate::parse(RegistryKind::Maven, "com/blocked/lib/1.0/lib-1.0.jar");
        assert_eq!(c.group.as_deref(), Some("com.blocked"));
        assert_eq!(c.artifact.as_deref(), Some("lib"));
        assert_eq!(c.version.as_deref(), Some("1.0"));
    }

    #[test]
    fn test_maven_metadata_file() {
        let c = Coordinate::parse(
            RegistryKind::Maven,
            "org/apache/commons/commons-lang3/maven-metadata.xml",
        );
        assert_eq!(c.group.as_deref(), Some("org.apache.commons"));
        assert_eq!(c.artifact.as_deref(), Some("commons-lang3"));
        assert_eq!(c.version, None);
    }

    #[test]
    fn test_maven_snapshot_metadata() {
        let c = Coordinate::parse(
            RegistryKind::Maven,
            "com/acme/tool/2.1-SNAPSHOT/maven-metadata.xml.sha1",
        );
        assert_eq!(c.group.as_deref(), Some("com.acme"));
        assert_eq!(c.artifact.as_deref(), Some("tool"));
        assert_eq!(c.version.as_deref(), Some("2.1-SNAPSHOT"));
    }

    #[test]
    fn test_maven_short_path_has_no_group() {
        let c = Coordinate::parse(RegistryKind::Maven, "lib/1.0/lib.jar");
        assert_eq!(c.group, None);
        assert_eq!(c.artifact.as_deref(), Some("lib"));
        assert_eq!(c.component(TargetCoordinate::Path), Some("lib/1.0/lib.jar"));
    }

    #[test]
    fn test_npm_scoped_tarball() {
        let c = Coordinate::parse(RegistryKind::Npm, "@babel/core/-/core-7.24.0.tgz");
        assert_eq!(c.group.as_deref(), Some("babel"));
        assert_eq!(c.artifact.as_deref(), Some("core"));
        assert_eq!(c.version.as_deref(), Some("7.24.0"));
    }

    #[test]
    fn test_npm_unscoped_metadata() {
        let c = Coordinate::parse(RegistryKind::Npm, "lodash");
        assert_eq!(c.group, None);
        assert_eq!(c.artifact.as_deref(), Some("lodash"));
        assert_eq!(c.version, None);
    }

    #[test]
    fn test_container_manifest() {
        let c = Coordinate::parse(RegistryKind::Container, "library/alpine/manifests/3.19");
        assert_eq!(c.group.as_deref(), Some("library"));
        assert_eq!(c.artifact.as_deref(), Some("alpine"));
        assert_eq!(c.version.as_deref(), Some("3.19"));
    }

    #[test]
    fn test_container_blob_with_v2_prefix() {
        let c = Coordinate::parse(
            RegistryKind::Container,
            "v2/acme/team/app/blobs/sha256:abcd",
        );
        assert_eq!(c.group.as_deref(), Some("acme/team"));
        assert_eq!(c.artifact.as_deref(), Some("app"));
        assert_eq!(c.version.as_deref(), Some("sha256:abcd"));
    }
}
