//! Credential lookup for registries.
//!
//! A [`Keychain`] maps a registry host to credentials. The default chain
//! consults the Docker CLI's `config.json`, then the `REGISTRY_USERNAME` /
//! `REGISTRY_PASSWORD` environment variables, and finally falls back to
//! anonymous access.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Anonymous,
    Basic { username: String, password: String },
    /// A registry token used as-is for bearer auth.
    Bearer(String),
}

impl Credential {
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }
}

pub trait Keychain: Send + Sync {
    /// Credentials for `registry`, or `None` when this keychain has nothing.
    fn resolve(&self, registry: &str) -> Option<Credential>;

    fn resolve_or_anonymous(&self, registry: &str) -> Credential {
        self.resolve(registry).unwrap_or_else(|| {
            tracing::debug!(registry, "no credentials found, using anonymous access");
            Credential::Anonymous
        })
    }
}

/// Tries each keychain in order.
pub struct DefaultKeychain {
    chain: Vec<Box<dyn Keychain>>,
}

impl DefaultKeychain {
    pub fn new(chain: Vec<Box<dyn Keychain>>) -> Self {
        Self { chain }
    }
}

impl Default for DefaultKeychain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(DockerConfigKeychain::from_env()),
            Box::new(EnvKeychain),
        ])
    }
}

impl Keychain for DefaultKeychain {
    fn resolve(&self, registry: &str) -> Option<Credential> {
        self.chain.iter().find_map(|keychain| keychain.resolve(registry))
    }
}

/// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
pub struct EnvKeychain;

impl Keychain for EnvKeychain {
    fn resolve(&self, _registry: &str) -> Option<Credential> {
        let username = env::var("REGISTRY_USERNAME").ok()?;
        let password = env::var("REGISTRY_PASSWORD").ok()?;
        Some(Credential::basic(username, password))
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
    #[serde(rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
    registrytoken: Option<String>,
}

/// The `auths` section of the Docker CLI configuration.
pub struct DockerConfigKeychain {
    path: PathBuf,
}

impl DockerConfigKeychain {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`.
    pub fn from_env() -> Self {
        let dir = env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))
            .unwrap_or_else(|| PathBuf::from(".docker"));
        Self::new(dir.join("config.json"))
    }

    fn load(&self) -> Option<DockerConfigFile> {
        let data = std::fs::read(&self.path).ok()?;
        match serde_json::from_slice(&data) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "ignoring unreadable docker config");
                None
            }
        }
    }
}

impl Keychain for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Option<Credential> {
        let config = self.load()?;
        if let Some(store) = &config.creds_store {
            tracing::debug!(store, "credential helpers are not consulted");
        }

        let wanted = normalize_registry(registry);
        let entry = config
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(key) == wanted)
            .map(|(_, entry)| entry)?;

        if let Some(token) = &entry.registrytoken {
            return Some(Credential::Bearer(token.clone()));
        }
        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Some(Credential::basic(username, password));
        }
        let decoded = STANDARD.decode(entry.auth.as_deref()?.trim()).ok()?;
        let decoded = String::from_utf8(decoded).ok()?;
        let (username, password) = decoded.split_once(':')?;
        Some(Credential::basic(username, password))
    }
}

/// Reduce `https://index.docker.io/v1/`, `docker.io` and friends to one key.
fn normalize_registry(registry: &str) -> String {
    let host = registry
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host).to_lowercase();
    match host.as_str() {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<Credential>);

    impl Keychain for Fixed {
        fn resolve(&self, _registry: &str) -> Option<Credential> {
            self.0.clone()
        }
    }

    #[test]
    fn test_docker_config_auth_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let auth = STANDARD.encode("alice:s3cret");
        std::fs::write(
            &path,
            format!(r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{auth}"}},"ghcr.io":{{"username":"bob","password":"pw"}}}}}}"#),
        )
        .unwrap();

        let keychain = DockerConfigKeychain::new(path);
        assert_eq!(
            keychain.resolve("docker.io"),
            Some(Credential::basic("alice", "s3cret"))
        );
        assert_eq!(keychain.resolve("ghcr.io"), Some(Credential::basic("bob", "pw")));
        assert_eq!(keychain.resolve("quay.io"), None);
    }

    #[test]
    fn test_missing_docker_config_is_none() {
        let keychain = DockerConfigKeychain::new(PathBuf::from("/nonexistent/config.json"));
        assert_eq!(keychain.resolve("docker.io"), None);
    }

    #[test]
    fn test_chain_order_and_fallback() {
        let chain = DefaultKeychain::new(vec![
            Box::new(Fixed(None)),
            Box::new(Fixed(Some(Credential::Bearer("t".into())))),
            Box::new(Fixed(Some(Credential::basic("u", "p")))),
        ]);
        assert_eq!(chain.resolve_or_anonymous("x"), Credential::Bearer("t".into()));

        let empty = DefaultKeychain::new(vec![Box::new(Fixed(None))]);
        assert_eq!(empty.resolve_or_anonymous("x"), Credential::Anonymous);
    }
}
