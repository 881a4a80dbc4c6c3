//! Parsing and formatting of image references.
//!
//! A reference names an image as humans write it:
//!     [registry/]repository[:tag][@digest]
//! After normalization exactly one of tag/digest is present; the default tag
//! `latest` is inferred when neither is given. `parse` and `Display` are
//! inverses: `parse(format(r)) == r` for every valid reference.

use std::fmt::{Display, Formatter, Result as FmtResult};

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{Result, Status};

/// Tag applied when a reference carries neither tag nor digest.
const DEFAULT_TAG: &str = "latest";

/// Parsed, normalized image reference.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

lazy_static! {
    // Repository: lowercase path components separated by slashes, each
    // component alphanumerics with inner separators (., _, __, -).
    static ref REPOSITORY_RE: Regex = Regex::new(
        r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$",
    )
    .unwrap();
    // Tag: up to 128 word characters, dots and dashes, not starting with
    // a separator.
    static ref TAG_RE: Regex = Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").unwrap();
    // Digest: the only supported algorithm is sha256.
    static ref DIGEST_RE: Regex = Regex::new(r"^sha256:[0-9a-f]+$").unwrap();
}

impl ImageReference {
    /// Parse and normalize a reference string.
    ///
    /// A leading component is treated as a registry host iff it contains a
    /// dot or a colon, or is exactly `localhost`, which is the disambiguation
    /// rule registries and runtimes use. When a digest is present any tag is
    /// dropped; the digest pins the content.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Status::invalid_argument("bad-reference"));
        }

        let (rest, digest) = match raw.split_once('@') {
            Some((rest, digest)) => {
                if !DIGEST_RE.is_match(digest) {
                    return Err(Status::invalid_argument("bad-reference"));
                }
                (rest, Some(String::from(digest)))
            }
            None => (raw, None),
        };

        let (rest, registry) = match rest.split_once('/') {
            Some((first, _)) if is_registry_host(first) => {
                let remainder = &rest[first.len() + 1..];
                (remainder, Some(String::from(first)))
            }
            _ => (rest, None),
        };

        // A colon after the last slash separates the tag. Colons earlier in
        // the string belong to a registry port and were consumed above.
        let (repository, tag) = match rest.rsplit_once(':') {
            Some((repository, tag)) if !tag.contains('/') => {
                if !TAG_RE.is_match(tag) {
                    return Err(Status::invalid_argument("bad-reference"));
                }
                (repository, Some(String::from(tag)))
            }
            _ => (rest, None),
        };

        if !REPOSITORY_RE.is_match(repository) {
            return Err(Status::invalid_argument("bad-reference"));
        }

        // Normalize: a digest pins the content, so the tag is dropped;
        // otherwise a missing tag defaults to `latest`.
        let tag = if digest.is_some() {
            None
        } else {
            tag.or_else(|| Some(String::from(DEFAULT_TAG)))
        };

        Ok(ImageReference {
            registry,
            repository: String::from(repository),
            tag,
            digest,
        })
    }

    /// The canonical string form, suitable as a store index key.
    pub fn normalized(&self) -> String {
        self.to_string()
    }
}

impl Display for ImageReference {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> FmtResult {
        if let Some(registry) = &self.registry {
            write!(formatter, "{registry}/")?;
        }
        formatter.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(formatter, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(formatter, "@{digest}")?;
        }
        Ok(())
    }
}

/// True iff the first path component of a reference names a registry host.
fn is_registry_host(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_name_defaults_to_latest() {
        let reference = ImageReference::parse("nginx").unwrap();

        assert_eq!(reference.registry, None);
        assert_eq!(reference.repository, "nginx");
        assert_eq!(reference.tag.as_deref(), Some("latest"));
        assert_eq!(reference.digest, None);
    }

    #[test]
    fn parse_name_with_tag() {
        let reference = ImageReference::parse("nginx:1.21").unwrap();

        assert_eq!(reference.registry, None);
        assert_eq!(reference.repository, "nginx");
        assert_eq!(reference.tag.as_deref(), Some("1.21"));
        assert_eq!(reference.digest, None);
    }

    #[test]
    fn parse_registry_and_nested_repository() {
        let reference = ImageReference::parse("gcr.io/my-project/my-image:v1.0.0").unwrap();

        assert_eq!(reference.registry.as_deref(), Some("gcr.io"));
        assert_eq!(reference.repository, "my-project/my-image");
        assert_eq!(reference.tag.as_deref(), Some("v1.0.0"));
        assert_eq!(reference.digest, None);
    }

    #[test]
    fn parse_digest_drops_tag() {
        let digest = format!("sha256:{}", "ab".repeat(32));
        let reference = ImageReference::parse(&format!("nginx@{digest}")).unwrap();

        assert_eq!(reference.repository, "nginx");
        assert_eq!(reference.tag, None);
        assert_eq!(reference.digest.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn parse_registry_with_port() {
        let reference = ImageReference::parse("registry.local:5000/team/app:2.3").unwrap();

        assert_eq!(reference.registry.as_deref(), Some("registry.local:5000"));
        assert_eq!(reference.repository, "team/app");
        assert_eq!(reference.tag.as_deref(), Some("2.3"));
    }

    #[test]
    fn parse_localhost_registry() {
        let reference = ImageReference::parse("localhost/app").unwrap();

        assert_eq!(reference.registry.as_deref(), Some("localhost"));
        assert_eq!(reference.repository, "app");
    }

    #[test]
    fn round_trip() {
        let pinned = format!("nginx@sha256:{}", "cd".repeat(32));
        let inputs = vec![
            "nginx:latest",
            "nginx:1.21",
            "gcr.io/my-project/my-image:v1.0.0",
            "registry.local:5000/team/app:2.3",
            pinned.as_str(),
        ];

        for input in inputs {
            let reference = ImageReference::parse(input).unwrap();

            assert_eq!(ImageReference::parse(&reference.to_string()).unwrap(), reference);
            assert_eq!(reference.to_string(), input);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        let inputs = vec![
            "",
            "UPPERCASE",
            "name:",
            "name:tag:tag",
            "name@sha512:abcd",
            "name@sha256:XYZ",
            "/leading/slash",
        ];

        for input in inputs {
            let result = ImageReference::parse(input);

            assert!(result.is_err(), "expected rejection of {input:?}");
            assert_eq!(result.unwrap_err().message(), "bad-reference");
        }
    }
}
