use std::time::Duration;

use keel_core::ImageRef;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{ExecError, RuntimeClient};

/// Polling settings for waiting until the runtime reflects a pull or removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self { Self { interval: Duration::from_secs(2), timeout: Duration::from_secs(120) } }
}

/// Poll the runtime until `image` is (or is no longer) present. A failed
/// listing is logged and polled again; only the timeout or cancellation ends
/// the wait early.
pub async fn wait_for_presence<R>(runtime: &R, image: &str, present: bool, cfg: WaitConfig) -> Result<(), ExecError>
where
    R: RuntimeClient + ?Sized,
{
    let target = ImageRef::parse(image)?.identity();
    let start = Instant::now();
    loop {
        match runtime.list_images().await {
            Ok(images) => {
                if images.iter().any(|i| i.has(&target)) == present {
                    debug!(image, present, waited_ms = start.elapsed().as_millis() as u64, "runtime settled");
                    return Ok(());
                }
            }
            Err(ExecError::Cancelled) => return Err(ExecError::Cancelled),
            Err(e) => warn!(image, error = %e, "listing runtime images failed; polling again"),
        }
        if start.elapsed() >= cfg.timeout {
            return Err(ExecError::Timeout { image: image.to_string(), present, waited: start.elapsed() });
        }
        tokio::time::sleep(cfg.interval).await;
    }
}
