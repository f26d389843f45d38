//! Pull strategy: fixed-interval REST polling.

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::frame::{parse_status_snapshot, sample_from_poll, samples_from_bulk, InboundEvent};
use super::reconnect::{friendly_error_message, ConnectionStatus, ReconnectConfig};
use super::Link;
use crate::backend::Backend;
use crate::config::TransportConfig;
use crate::error::Result;
use crate::protocol::DeviceId;

pub(crate) async fn run(
    link: Link,
    backend: Arc<dyn Backend>,
    config: TransportConfig,
    mut cancel: oneshot::Receiver<()>,
) {
    let policy = ReconnectConfig::for_pull(&config);
    let interval = config.poll_interval();
    let mut retries: u32 = 0;

    // Polling has no handshake; the loop is live as soon as it starts.
    if !link.set_status(ConnectionStatus::Connected) {
        return;
    }

    loop {
        let tick = tokio::select! {
            _ = &mut cancel => return,
            result = poll_once(&link, backend.as_ref()) => result,
        };

        let delay = match tick {
            Ok(true) => {
                if retries > 0 {
                    debug!(retries, "Polling recovered");
                    retries = 0;
                }
                if !link.set_status(ConnectionStatus::Connected) {
                    return;
                }
                interval
            }
            Ok(false) => return,
            Err(e) => {
                retries += 1;
                let raw = e.to_string();
                warn!(
                    error = %raw,
                    hint = %friendly_error_message(&raw),
                    retries,
                    "Poll tick failed"
                );
                if !policy.should_retry(retries) {
                    warn!(attempts = retries, "Max polling retries reached");
                    link.set_status(ConnectionStatus::Error);
                    return;
                }
                policy.backoff_delay(retries)
            }
        };

        trace!(delay_ms = delay.as_millis() as u64, "Next poll");
        tokio::select! {
            _ = &mut cancel => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

/// One tick. `Ok(false)` means the manager no longer wants events.
async fn poll_once(link: &Link, backend: &dyn Backend) -> Result<bool> {
    let body = backend.device_status().await?;
    match parse_status_snapshot(&body) {
        Ok(snapshot) => {
            if !link.publish(&InboundEvent::DeviceStatusUpdate(snapshot)) {
                return Ok(false);
            }
        }
        Err(reason) => warn!(%reason, "Ignoring malformed status response"),
    }

    let per_device = join_all(
        DeviceId::ALL
            .iter()
            .map(|&device| async move { (device, backend.device_data(device).await) }),
    )
    .await;

    let mut answered = false;
    for (device, result) in per_device {
        match result {
            Ok(Some(body)) => {
                answered = true;
                let event = InboundEvent::DeviceData(sample_from_poll(device, &body));
                if !link.publish(&event) {
                    return Ok(false);
                }
            }
            Ok(None) => trace!(%device, "No data endpoint for device"),
            Err(e) => debug!(%device, error = %e, "Device data request failed"),
        }
    }

    if !answered {
        match backend.all_device_data().await {
            Ok(body) => {
                for sample in samples_from_bulk(&body) {
                    if !link.publish(&InboundEvent::DeviceData(sample)) {
                        return Ok(false);
                    }
                }
            }
            Err(e) => debug!(error = %e, "Bulk device data request failed"),
        }
    }

    Ok(true)
}
