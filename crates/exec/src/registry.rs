//! Registry-to-registry copy for the mirror workers.

use std::io::Write;
use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use keel_core::Credential;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::classify_failure;
use crate::process::{run, stderr_of};
use crate::ExecError;

#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Copy `source` to `destination`; `auth` applies to the source registry.
    async fn copy(&self, source: &str, destination: &str, auth: Option<&Credential>) -> Result<(), ExecError>;
    /// Tags of `registry/repository`; a repository that does not exist yet has none.
    async fn list_tags(&self, registry: &str, repository: &str, auth: Option<&Credential>) -> Result<Vec<String>, ExecError>;
}

/// Settings for the registry the mirror writes to.
#[derive(Debug, Clone, Default)]
pub struct Destination {
    pub registry: String,
    pub credential: Option<Credential>,
    pub tls_verify: bool,
}

/// Registry client driving `skopeo`.
pub struct SkopeoRegistry {
    binary: String,
    destination: Destination,
    cancel: CancellationToken,
}

impl SkopeoRegistry {
    pub fn new(binary: impl Into<String>, destination: Destination, cancel: CancellationToken) -> Self {
        Self { binary: binary.into(), destination, cancel }
    }

    fn is_destination(&self, registry: &str) -> bool { keel_core::normalize_registry(registry) == self.destination.registry }

    pub(crate) fn copy_args(&self, source: &str, destination: &str, src_auth: Option<&Path>, dest_auth: Option<&Path>) -> Vec<String> {
        let mut args = vec!["copy".to_string()];
        if let Some(p) = src_auth {
            args.push("--src-authfile".into());
            args.push(p.display().to_string());
        }
        if let Some(p) = dest_auth {
            args.push("--dest-authfile".into());
            args.push(p.display().to_string());
        }
        if !self.destination.tls_verify {
            args.push("--dest-tls-verify=false".into());
        }
        args.push(format!("docker://{}", source));
        args.push(format!("docker://{}", destination));
        args
    }
}

/// Docker config document holding one credential.
pub(crate) fn auth_document(cred: &Credential) -> serde_json::Value {
    let mut auths = serde_json::Map::new();
    auths.insert(cred.registry.clone(), serde_json::json!({ "auth": STANDARD.encode(cred.to_pair()) }));
    serde_json::json!({ "auths": auths })
}

/// Credentials go to skopeo through an owner-only temporary auth file so they
/// never appear on the command line. The file is removed on drop.
fn write_authfile(cred: Option<&Credential>, image: &str) -> Result<Option<NamedTempFile>, ExecError> {
    let Some(cred) = cred else { return Ok(None) };
    let fail = |e: std::io::Error| ExecError::Failed { op: "authfile", image: image.to_string(), message: e.to_string() };
    let mut file = tempfile::Builder::new().prefix("keel-auth-").suffix(".json").tempfile().map_err(fail)?;
    file.write_all(auth_document(cred).to_string().as_bytes()).map_err(fail)?;
    file.flush().map_err(fail)?;
    Ok(Some(file))
}

#[derive(Debug, Deserialize)]
struct TagList {
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
}

#[async_trait]
impl RegistryClient for SkopeoRegistry {
    async fn copy(&self, source: &str, destination: &str, auth: Option<&Credential>) -> Result<(), ExecError> {
        let src_file = write_authfile(auth, source)?;
        let dest_file = write_authfile(self.destination.credential.as_ref(), destination)?;
        let args = self.copy_args(
            source,
            destination,
            src_file.as_ref().map(|f| f.path()),
            dest_file.as_ref().map(|f| f.path()),
        );
        let out = run(&self.binary, &args, &format!("copy {} -> {}", source, destination), &self.cancel).await?;
        if !out.status.success() {
            return Err(classify_failure("copy", source, &stderr_of(&out)));
        }
        info!(source, destination, "image mirrored");
        Ok(())
    }

    async fn list_tags(&self, registry: &str, repository: &str, auth: Option<&Credential>) -> Result<Vec<String>, ExecError> {
        let target = format!("{}/{}", registry, repository);
        let mut args = vec!["list-tags".to_string()];
        let auth = auth.or_else(|| if self.is_destination(registry) { self.destination.credential.as_ref() } else { None });
        let auth_file = write_authfile(auth, &target)?;
        if let Some(f) = &auth_file {
            args.push("--authfile".into());
            args.push(f.path().display().to_string());
        }
        if self.is_destination(registry) && !self.destination.tls_verify {
            args.push("--tls-verify=false".into());
        }
        args.push(format!("docker://{}", target));
        let out = run(&self.binary, &args, &format!("list-tags {}", target), &self.cancel).await?;
        if !out.status.success() {
            let stderr = stderr_of(&out);
            let lower = stderr.to_ascii_lowercase();
            if lower.contains("name unknown") || lower.contains("repository name not known") || lower.contains("not found") {
                return Ok(Vec::new());
            }
            return Err(classify_failure("list-tags", &target, &stderr));
        }
        parse_tag_list(&out.stdout, &target)
    }
}

fn parse_tag_list(raw: &[u8], target: &str) -> Result<Vec<String>, ExecError> {
    let list: TagList = serde_json::from_slice(raw)
        .map_err(|e| ExecError::Failed { op: "list-tags", image: target.to_string(), message: format!("decoding tags: {}", e) })?;
    Ok(list.tags)
}
