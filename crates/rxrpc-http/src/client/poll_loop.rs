//! Background polling task for receiving server messages.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use rxrpc_core::TransportError;
use rxrpc_core::retry::RetryPolicy;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{Endpoint, Item};
use crate::CLIENT_ID_HEADER;

#[derive(Debug, thiserror::Error)]
enum PollError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),
}

/// Result of one successful poll.
enum Polled {
    /// Messages were delivered (possibly none).
    Delivered(usize),
    /// The server side completed and has nothing left.
    Gone,
    /// Nobody reads incoming messages anymore.
    Abandoned,
}

/// Poll every `period` until the server is gone, the transport is shut down,
/// or one poll fails more often than `policy` allows.
#[instrument(skip_all, fields(client_id = %endpoint.client_id))]
pub(super) async fn poll_loop(
    http: Client,
    endpoint: Arc<Endpoint>,
    incoming: mpsc::UnboundedSender<Item>,
    period: Duration,
    policy: RetryPolicy,
    shutdown: CancellationToken,
) {
    info!(period_ms = period.as_millis(), "starting poll loop");
    let mut ticks = tokio::time::interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticks.tick() => {}
        }

        let outcome = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            outcome = poll_with_retry(&http, &endpoint, &incoming, policy) => outcome,
        };

        match outcome {
            Ok(Polled::Delivered(count)) => {
                if count > 0 {
                    debug!(count, "poll received messages");
                }
            }
            Ok(Polled::Gone) => {
                info!("server side is gone, closing");
                shutdown.cancel();
                break;
            }
            Ok(Polled::Abandoned) => {
                debug!("incoming stream dropped, stopping");
                break;
            }
            Err(e) => {
                error!(error = %e, "polling failed, giving up");
                let _ = incoming.send(Err(e));
                break;
            }
        }
    }
    info!("poll loop exited");
}

/// One poll, retried with backoff. Every call starts with a fresh budget.
async fn poll_with_retry(
    http: &Client,
    endpoint: &Endpoint,
    incoming: &mpsc::UnboundedSender<Item>,
    policy: RetryPolicy,
) -> Result<Polled, TransportError> {
    let mut retries = 0u32;
    loop {
        match poll_once(http, endpoint, incoming).await {
            Ok(polled) => return Ok(polled),
            Err(e) => {
                let Some(delay) = policy.delay_for(retries) else {
                    return Err(TransportError::PollRetriesExhausted {
                        attempts: retries + 1,
                        message: e.to_string(),
                    });
                };
                retries += 1;
                warn!(
                    error = %e,
                    retry = retries,
                    delay_ms = delay.as_millis(),
                    "poll failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn poll_once(
    http: &Client,
    endpoint: &Endpoint,
    incoming: &mpsc::UnboundedSender<Item>,
) -> Result<Polled, PollError> {
    let response = http
        .post(&endpoint.polling_url)
        .header(CLIENT_ID_HEADER, &endpoint.client_id)
        .send()
        .await?;

    let status = response.status();
    if status == StatusCode::GONE {
        return Ok(Polled::Gone);
    }
    if !status.is_success() {
        return Err(PollError::Status(status));
    }

    let body = response.text().await?;
    let mut count = 0;
    for message in body.split('\n').filter(|m| !m.is_empty()) {
        if incoming.send(Ok(message.to_owned())).is_err() {
            return Ok(Polled::Abandoned);
        }
        count += 1;
    }
    Ok(Polled::Delivered(count))
}
