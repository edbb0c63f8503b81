//! Registry credentials read from `kubernetes.io/dockerconfigjson` secrets

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

use kubebuild_common::{Error, Result};

/// Key holding the docker config inside a dockerconfigjson secret
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// Username/password pair for one registry
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    /// Registry username
    pub username: String,
    /// Registry password or token
    pub password: String,
}

impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Credentials keyed by registry host
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryAuth {
    /// Registry host to credential
    pub registries: BTreeMap<String, RegistryCredential>,
}

#[derive(Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Deserialize)]
struct DockerAuthEntry {
    username: Option<String>,
    password: Option<String>,
    auth: Option<String>,
}

impl RegistryAuth {
    /// Parse a docker `config.json` document.
    ///
    /// Entries may carry an explicit username/password or a base64 `auth`
    /// field of the form `user:password`; explicit fields win.
    pub fn from_docker_config(data: &[u8]) -> Result<Self> {
        let config: DockerConfig = serde_json::from_slice(data)
            .map_err(|e| Error::serialization(format!("invalid docker config: {}", e)))?;

        let mut registries = BTreeMap::new();
        for (host, entry) in config.auths {
            let credential = match (entry.username, entry.password, entry.auth) {
                (Some(username), Some(password), _) => RegistryCredential { username, password },
                (_, _, Some(auth)) => decode_auth(&host, &auth)?,
                _ => continue,
            };
            registries.insert(host, credential);
        }
        Ok(Self { registries })
    }

    /// Credential for a registry host, accepting `https://` prefixed keys
    pub fn credentials_for(&self, host: &str) -> Option<&RegistryCredential> {
        self.registries.get(host).or_else(|| {
            self.registries
                .iter()
                .find(|(key, _)| {
                    key.trim_start_matches("https://")
                        .trim_start_matches("http://")
                        .trim_end_matches('/')
                        == host
                })
                .map(|(_, cred)| cred)
        })
    }
}

fn decode_auth(host: &str, auth: &str) -> Result<RegistryCredential> {
    let decoded = STANDARD
        .decode(auth.trim())
        .map_err(|e| Error::serialization(format!("invalid auth for {}: {}", host, e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| Error::serialization(format!("invalid auth for {}: {}", host, e)))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| Error::serialization(format!("invalid auth for {}: missing ':'", host)))?;
    Ok(RegistryCredential {
        username: username.to_string(),
        password: password.to_string(),
    })
}
