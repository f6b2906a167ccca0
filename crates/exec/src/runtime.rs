//! Container runtime access (the machine's local image store).

use async_trait::async_trait;
use keel_core::{Credential, IdentityHash, ImageRef};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::classify_failure;
use crate::process::{run, stderr_of};
use crate::ExecError;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeImage {
    pub id: String,
    #[serde(default)]
    pub repo_tags: Vec<String>,
}

impl RuntimeImage {
    /// Whether any of this image's tags hashes to `target`.
    pub fn has(&self, target: &IdentityHash) -> bool {
        self.repo_tags.iter().filter_map(|t| ImageRef::parse(t).ok()).any(|r| &r.identity() == target)
    }
}

#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Pull `image`, returning the runtime's image id.
    async fn pull_image(&self, image: &str, auth: Option<&Credential>) -> Result<String, ExecError>;
    async fn remove_image(&self, image: &str) -> Result<(), ExecError>;
    async fn list_images(&self) -> Result<Vec<RuntimeImage>, ExecError>;
}

/// Runtime client driving `crictl` against the node's CRI socket.
///
/// `crictl pull` only accepts credentials as arguments (`--creds`), so an
/// authenticated pull exposes them in the node's process table while it runs.
pub struct CrictlRuntime {
    binary: String,
    endpoint: Option<String>,
    cancel: CancellationToken,
}

impl CrictlRuntime {
    pub fn new(binary: impl Into<String>, endpoint: Option<String>, cancel: CancellationToken) -> Self {
        Self { binary: binary.into(), endpoint, cancel }
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(ep) = &self.endpoint {
            out.extend(["--runtime-endpoint".to_string(), ep.clone(), "--image-endpoint".to_string(), ep.clone()]);
        }
        out.extend(rest.iter().map(|s| s.to_string()));
        out
    }
}

#[derive(Debug, Deserialize)]
struct ImageList {
    #[serde(default)]
    images: Vec<RuntimeImage>,
}

#[async_trait]
impl RuntimeClient for CrictlRuntime {
    async fn pull_image(&self, image: &str, auth: Option<&Credential>) -> Result<String, ExecError> {
        let mut args = self.args(&["pull"]);
        if let Some(c) = auth {
            args.push("--creds".into());
            args.push(c.to_pair());
        }
        args.push(image.to_string());
        let out = run(&self.binary, &args, &format!("pull {}", image), &self.cancel).await?;
        if !out.status.success() {
            return Err(classify_failure("pull", image, &stderr_of(&out)));
        }
        let stdout = String::from_utf8_lossy(&out.stdout);
        let id = stdout.split_whitespace().last().unwrap_or("").to_string();
        info!(image, id = %id, "image pulled");
        Ok(id)
    }

    async fn remove_image(&self, image: &str) -> Result<(), ExecError> {
        let args = self.args(&["rmi", image]);
        let out = run(&self.binary, &args, &format!("rmi {}", image), &self.cancel).await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = stderr_of(&out);
        // Already gone counts as removed.
        if stderr.to_ascii_lowercase().contains("not found") || stderr.to_ascii_lowercase().contains("no such image") {
            return Ok(());
        }
        Err(classify_failure("remove", image, &stderr))
    }

    async fn list_images(&self) -> Result<Vec<RuntimeImage>, ExecError> {
        let args = self.args(&["images", "-o", "json"]);
        let out = run(&self.binary, &args, "images", &self.cancel).await?;
        if !out.status.success() {
            return Err(classify_failure("list", "*", &stderr_of(&out)));
        }
        parse_image_list(&out.stdout)
    }
}

pub(crate) fn parse_image_list(raw: &[u8]) -> Result<Vec<RuntimeImage>, ExecError> {
    let list: ImageList = serde_json::from_slice(raw)
        .map_err(|e| ExecError::Failed { op: "list", image: "*".into(), message: format!("decoding image list: {}", e) })?;
    Ok(list.images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_crictl_json() {
        let raw = br#"{"images":[{"id":"sha256:aa","repoTags":["docker.io/library/nginx:1.25"],"repoDigests":[],"size":"1"},{"id":"sha256:bb","repoTags":[]}]}"#;
        let imgs = parse_image_list(raw).unwrap();
        assert_eq!(imgs.len(), 2);
        let target = ImageRef::parse("nginx:1.25").unwrap().identity();
        assert!(imgs[0].has(&target));
        assert!(!imgs[1].has(&target));
    }

    #[test]
    fn endpoint_flags_precede_subcommand() {
        let rt = CrictlRuntime::new("crictl", Some("unix:///run/containerd/containerd.sock".into()), CancellationToken::new());
        let args = rt.args(&["images"]);
        assert_eq!(args[0], "--runtime-endpoint");
        assert_eq!(args.last().map(String::as_str), Some("images"));
    }
}
