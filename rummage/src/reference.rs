//! Image reference parsing.
//!
//! Turns strings like `nginx`, `ghcr.io/org/app:v1` or
//! `localhost:5000/app@sha256:...` into their registry, repository and
//! tag/digest parts.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Registry used when the reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when the reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

const DOCKER_HUB_API: &str = "https://registry-1.docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, optionally with port (`docker.io`, `localhost:5000`).
    pub registry: String,
    /// Repository path (`library/nginx`).
    pub repository: String,
    pub tag: Option<String>,
    /// Content digest (`sha256:...`).
    pub digest: Option<String>,
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.is_empty() {
            return Err(Error::reference(reference, "empty reference"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(Error::reference(reference, "contains whitespace"));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                validate_digest(reference, digest)?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A colon only separates a tag when it comes after the last slash,
        // otherwise it belongs to a registry port.
        let last_slash = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let colon = last_slash + colon;
                (&name_tag[..colon], Some(&name_tag[colon + 1..]))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = tag {
            validate_tag(reference, tag)?;
        }

        let (registry, repository) = split_registry(name);
        validate_repository(reference, &repository)?;

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (None, Some(_)) => None,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The identifier to ask the registry for: digest wins over tag.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Base URL of the registry's HTTP API.
    pub fn registry_url(&self) -> String {
        match self.registry.as_str() {
            "docker.io" | "index.docker.io" | "registry-1.docker.io" => DOCKER_HUB_API.to_string(),
            host if is_local(host) => format!("http://{host}"),
            host => format!("https://{host}"),
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn is_local(host: &str) -> bool {
    let hostname = host.split(':').next().unwrap_or(host);
    hostname == "localhost" || hostname == "127.0.0.1" || hostname == "[::1]"
}

fn split_registry(name: &str) -> (String, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), rest.to_string());
        }
        return (DEFAULT_REGISTRY.to_string(), name.to_string());
    }
    (DEFAULT_REGISTRY.to_string(), format!("library/{name}"))
}

fn validate_repository(reference: &str, repository: &str) -> Result<()> {
    if repository.is_empty() {
        return Err(Error::reference(reference, "empty repository"));
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(Error::reference(reference, "empty path component"));
        }
        let valid = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        let edges_ok = component
            .chars()
            .next()
            .zip(component.chars().last())
            .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
        if !valid || !edges_ok {
            return Err(Error::reference(
                reference,
                format!("invalid repository component '{component}'"),
            ));
        }
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::reference(reference, format!("invalid tag '{tag}'")))
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(Error::reference(
            reference,
            "digest must look like algorithm:hex",
        ));
    };
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'));
    let hex_ok = hex.len() >= 32 && hex.chars().all(|c| c.is_ascii_hexdigit());
    if algorithm_ok && hex_ok {
        Ok(())
    } else {
        Err(Error::reference(reference, format!("invalid digest '{digest}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_parse_short_name() {
        let r = ImageReference::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag.as_deref(), Some("latest"));
        assert_eq!(r.registry_url(), "https://registry-1.docker.io");
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("localhost:5000/team/app:1.2").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("1.2"));
        assert_eq!(r.registry_url(), "http://localhost:5000");
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse(&format!("ghcr.io/org/app@{DIGEST}")).unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.tag, None);
        assert_eq!(r.identifier(), DIGEST);
        assert_eq!(r.to_string(), format!("ghcr.io/org/app@{DIGEST}"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "Nginx", "nginx:", "a//b", "app@sha256:xyz", "app:bad tag", "-app"] {
            assert!(
                matches!(ImageReference::parse(bad), Err(Error::Reference { .. })),
                "{bad} should be rejected"
            );
        }
    }
}
