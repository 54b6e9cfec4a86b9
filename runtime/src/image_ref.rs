//! OCI image reference parsing and pool machine-name derivation.

use crate::error::{ErrorKind, Result, RuntimeError};

/// An image reference split into its registry/repository/tag/digest parts.
///
/// `registry = None` means the implicit `docker.io` registry; it is kept
/// absent (rather than filled in) so [`ImageReference::to_string`] round
/// trips references that never named a registry explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(RuntimeError::new(
                ErrorKind::InvalidArgument,
                "empty image reference",
            ));
        }

        let (remainder, digest) = match reference.split_once('@') {
            Some((left, digest)) => (left, Some(digest.to_string())),
            None => (reference, None),
        };
        if remainder.is_empty() {
            return Err(RuntimeError::new(
                ErrorKind::InvalidArgument,
                format!("missing repository in reference {reference:?}"),
            ));
        }

        let (registry, repository_path) = match remainder.split_once('/') {
            Some((candidate, rest)) if looks_like_registry(candidate) => {
                (Some(candidate.to_string()), rest.to_string())
            }
            _ => (None, remainder.to_string()),
        };
        if repository_path.is_empty() {
            return Err(RuntimeError::new(
                ErrorKind::InvalidArgument,
                format!("missing repository in reference {reference:?}"),
            ));
        }

        let (repository, tag) = split_tag(&repository_path);

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The registry to pull from, filling in the implicit default.
    pub fn effective_registry(&self) -> &str {
        self.registry.as_deref().unwrap_or("docker.io")
    }

    /// The tag/digest suffix used for a `docker://` source URL, e.g.
    /// `:1.19` or `@sha256:...`.
    pub fn source_suffix(&self) -> String {
        match &self.digest {
            Some(digest) => format!("@{digest}"),
            None => format!(":{}", self.tag.as_deref().unwrap_or("latest")),
        }
    }

    /// Deterministic machine image pool name for this reference.
    pub fn pool_machine_name(&self) -> String {
        let mut name = sanitize(&self.repository);
        let tag = self.tag.as_deref().unwrap_or("latest");
        if tag != "latest" {
            name.push('-');
            name.push_str(&sanitize(tag));
        }
        name.truncate(64);
        name
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{registry}/")?;
        }
        write!(f, "{}", self.repository)?;
        match &self.digest {
            Some(digest) => write!(f, "@{digest}"),
            None => write!(f, ":{}", self.tag.as_deref().unwrap_or("latest")),
        }
    }
}

/// A reference's first path segment is a registry host if it contains a
/// `.` or `:` (`example.com`, `localhost:5000`) or is literally `localhost`.
fn looks_like_registry(candidate: &str) -> bool {
    candidate == "localhost" || candidate.contains('.') || candidate.contains(':')
}

/// Split the trailing `:tag` off a repository path's last segment, if any.
fn split_tag(repository_path: &str) -> (String, Option<String>) {
    let last_slash = repository_path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (head, last_segment) = repository_path.split_at(last_slash);
    match last_segment.rsplit_once(':') {
        Some((name, tag)) => (format!("{head}{name}"), Some(tag.to_string())),
        None => (repository_path.to_string(), None),
    }
}

/// Lowercase, mapping `/ _ . -` to `-` and dropping anything else
/// non-alphanumeric.
fn sanitize(s: &str) -> String {
    s.chars()
        .filter_map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if matches!(c, '/' | '_' | '.' | '-') {
                Some('-')
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(reference: &str, expected: &str) {
        let parsed = ImageReference::parse(reference).unwrap();
        assert_eq!(parsed.to_string(), expected, "parsing {reference:?}");
    }

    #[test]
    fn bare_name_gets_implicit_latest_tag() {
        roundtrip("nginx", "nginx:latest");
    }

    #[test]
    fn explicit_tag_round_trips() {
        roundtrip("nginx:1.19", "nginx:1.19");
    }

    #[test]
    fn explicit_registry_round_trips() {
        roundtrip("docker.io/library/nginx:1.19", "docker.io/library/nginx:1.19");
    }

    #[test]
    fn host_port_registry_is_not_mistaken_for_a_tag() {
        let parsed = ImageReference::parse("localhost:5000/myimage").unwrap();
        assert_eq!(parsed.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(parsed.repository, "myimage");
        assert_eq!(parsed.tag.as_deref(), Some("latest"));
        assert_eq!(parsed.to_string(), "localhost:5000/myimage:latest");
    }

    #[test]
    fn digest_takes_precedence_and_suppresses_implicit_tag() {
        roundtrip(
            "myregistry.example.com/foo/bar@sha256:abcd",
            "myregistry.example.com/foo/bar@sha256:abcd",
        );
    }

    #[test]
    fn no_explicit_registry_implies_docker_io() {
        let parsed = ImageReference::parse("library/nginx:1.19").unwrap();
        assert_eq!(parsed.registry, None);
        assert_eq!(parsed.effective_registry(), "docker.io");
    }

    #[test]
    fn rejects_empty_reference() {
        assert!(ImageReference::parse("").is_err());
    }

    #[test]
    fn pool_machine_name_is_deterministic_and_charset_constrained() {
        let a = ImageReference::parse("nginx:1.19").unwrap();
        let b = ImageReference::parse("nginx:1.19").unwrap();
        assert_eq!(a.pool_machine_name(), b.pool_machine_name());
        assert_eq!(a.pool_machine_name(), "nginx-1-19");

        let name = a.pool_machine_name();
        assert!(name.len() <= 64);
        assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn pool_machine_name_omits_tag_suffix_for_latest() {
        let reference = ImageReference::parse("docker.io/library/hello:latest").unwrap();
        assert_eq!(reference.pool_machine_name(), "library-hello");
    }

    #[test]
    fn pool_machine_name_truncates_to_64_chars() {
        let long_repo = "a".repeat(100);
        let reference = ImageReference {
            registry: None,
            repository: long_repo,
            tag: None,
            digest: None,
        };
        assert_eq!(reference.pool_machine_name().len(), 64);
    }
}
