//! Registry credentials out of docker config secrets.

use std::collections::BTreeMap;

use base64::Engine as _;
use keel_core::{normalize_registry, Credential};
use serde::Deserialize;

pub const DOCKER_CONFIG_JSON_KEY: &str = ".dockerconfigjson";
pub const DOCKER_CFG_KEY: &str = ".dockercfg";

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: BTreeMap<String, AuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Parse the data of a docker config secret. Entries without usable
/// credentials are skipped; the result is ordered by registry.
pub fn parse_secret_data(data: &BTreeMap<String, Vec<u8>>) -> Result<Vec<Credential>, String> {
    let auths = if let Some(raw) = data.get(DOCKER_CONFIG_JSON_KEY) {
        serde_json::from_slice::<DockerConfig>(raw).map_err(|e| format!("{}: {}", DOCKER_CONFIG_JSON_KEY, e))?.auths
    } else if let Some(raw) = data.get(DOCKER_CFG_KEY) {
        serde_json::from_slice::<BTreeMap<String, AuthEntry>>(raw).map_err(|e| format!("{}: {}", DOCKER_CFG_KEY, e))?
    } else {
        return Err(format!("secret has neither {} nor {}", DOCKER_CONFIG_JSON_KEY, DOCKER_CFG_KEY));
    };

    let mut out: Vec<Credential> = Vec::with_capacity(auths.len());
    for (key, entry) in auths {
        let registry = normalize_registry(&key);
        let pair = match (&entry.username, &entry.password) {
            (Some(u), Some(p)) if !u.is_empty() => Some((u.clone(), p.clone())),
            _ => entry.auth.as_deref().and_then(decode_auth),
        };
        if let Some((username, password)) = pair {
            out.push(Credential::new(registry, username, password));
        }
    }
    out.sort_by(|a, b| a.registry.cmp(&b.registry));
    Ok(out)
}

fn decode_auth(encoded: &str) -> Option<(String, String)> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let (u, p) = text.split_once(':')?;
    Some((u.to_string(), p.to_string()))
}
