// =============================================================================
// Websocket connector — generic connection state machine
// =============================================================================
//
// One connector drives one exchange connection:
//
//   Disconnected -> Connecting -> Subscribing -> Streaming
//        ^                                          |
//        +--------------- backoff <---- error ------+
//
// Cancellation (the owner flipping the shutdown watch, or dropping the
// candle receiver) moves the machine to Closed, which is terminal. Reconnects
// use bounded exponential backoff with jitter, reset once Streaming is
// reached again.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::candle::Candle;
use crate::exchange::WsAdapter;
use crate::input::StreamInput;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Reconnect backoff: exponential growth from 1 s to a 30 s cap, with the
/// actual delay jittered into the upper half of the window.
pub(crate) struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { attempt: 0 }
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = BACKOFF_BASE
            .saturating_mul(1u32 << self.attempt.min(5))
            .min(BACKOFF_CAP);
        self.attempt = self.attempt.saturating_add(1);
        let half = exp.as_millis() as u64 / 2;
        let jitter = rand::rng().random_range(0..=half);
        Duration::from_millis(half + jitter)
    }
}

/// Drives one websocket connection and feeds normalized candles into a
/// channel owned by the runner.
pub struct WsConnector {
    adapter: Arc<dyn WsAdapter>,
    input: StreamInput,
}

enum StreamExit {
    /// Transport died; reconnect after backoff.
    Retry,
    /// Cancelled by the owner; terminal.
    Closed,
}

impl WsConnector {
    pub fn new(adapter: Arc<dyn WsAdapter>, input: StreamInput) -> Self {
        Self { adapter, input }
    }

    /// Run until cancelled. Yields candles through `tx`; a dropped receiver
    /// counts as cancellation.
    pub async fn run(
        self,
        tx: mpsc::Sender<Candle>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let source = self.adapter.source();
        let url = self.adapter.ws_url(&self.input);
        let mut backoff = Backoff::new();

        loop {
            if *shutdown.borrow() {
                info!(source, "connector closed");
                return Ok(());
            }

            info!(source, url = %url, "connecting");
            let connected = tokio::select! {
                res = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url)) => res,
                _ = shutdown.changed() => {
                    info!(source, "connector closed during connect");
                    return Ok(());
                }
            };

            let ws = match connected {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    warn!(source, error = %e, "connect failed");
                    if sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(_) => {
                    warn!(source, timeout_s = CONNECT_TIMEOUT.as_secs(), "connect timed out");
                    if sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            let (mut write, mut read) = ws.split();

            // Subscribing: send the exchange's subscription frames. Binance
            // subscribes via the URL, so this may be a no-op.
            let mut subscribed = true;
            for frame in self.adapter.subscribe_frames(&self.input) {
                debug!(source, frame = %frame, "subscribing");
                if let Err(e) = write.send(Message::Text(frame)).await {
                    warn!(source, error = %e, "subscribe send failed");
                    subscribed = false;
                    break;
                }
            }
            if !subscribed {
                if sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                    return Ok(());
                }
                continue;
            }

            // Keepalive: exchanges with an application-level ping get a
            // dedicated task owning the write half. It stops by itself when
            // the connection dies and is aborted on any other exit.
            let mut held_write = None;
            let keepalive: Option<JoinHandle<()>> = match self.adapter.ping_frame() {
                Some(frame) => {
                    let interval = self.adapter.ping_interval();
                    Some(tokio::spawn(async move {
                        let mut tick = tokio::time::interval(interval);
                        tick.tick().await; // consume the immediate tick
                        loop {
                            tick.tick().await;
                            if write.send(Message::Text(frame.clone())).await.is_err() {
                                break;
                            }
                        }
                    }))
                }
                None => {
                    // Transport-level pings are answered underneath us; the
                    // write half just has to stay alive while we read.
                    held_write = Some(write);
                    None
                }
            };

            info!(source, "streaming");
            backoff.reset();

            let recv_timeout = self.adapter.ping_interval() * 2;
            let exit = loop {
                tokio::select! {
                    _ = shutdown.changed() => break StreamExit::Closed,
                    msg = tokio::time::timeout(recv_timeout, read.next()) => match msg {
                        Err(_) => {
                            warn!(source, timeout_s = recv_timeout.as_secs(), "no frame within receive window");
                            break StreamExit::Retry;
                        }
                        Ok(None) => {
                            warn!(source, "stream ended by remote");
                            break StreamExit::Retry;
                        }
                        Ok(Some(Err(e))) => {
                            error!(source, error = %e, "websocket read error");
                            break StreamExit::Retry;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            match serde_json::from_str::<Value>(&text) {
                                Ok(value) => match self.adapter.normalize_ws(&value) {
                                    Ok(Some(candle)) => {
                                        if tx.send(candle).await.is_err() {
                                            break StreamExit::Closed;
                                        }
                                    }
                                    Ok(None) => {}
                                    Err(e) => {
                                        warn!(source, error = %e, "dropping malformed frame");
                                    }
                                },
                                Err(e) => {
                                    warn!(source, error = %e, "dropping undecodable frame");
                                }
                            }
                        }
                        // Transport-level ping/pong/binary frames are
                        // handled underneath us.
                        Ok(Some(Ok(_))) => {}
                    }
                }
            };

            if let Some(handle) = keepalive {
                handle.abort();
            }
            drop(held_write.take());

            match exit {
                StreamExit::Closed => {
                    info!(source, "connector closed");
                    return Ok(());
                }
                StreamExit::Retry => {
                    if sleep_or_shutdown(backoff.next_delay(), &mut shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Sleep for `delay`, returning early with `true` when shutdown fires.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_to_cap() {
        let mut b = Backoff::new();
        let mut previous_upper = Duration::ZERO;
        for _ in 0..8 {
            let d = b.next_delay();
            // Jitter keeps the delay inside (0, cap].
            assert!(d <= BACKOFF_CAP);
            assert!(d >= previous_upper / 4, "delay should trend upward");
            previous_upper = d;
        }
        // Deep into the sequence the delay sits in the capped window.
        let d = b.next_delay();
        assert!(d >= BACKOFF_CAP / 2);
        assert!(d <= BACKOFF_CAP);
    }

    #[test]
    fn backoff_reset_returns_to_base() {
        let mut b = Backoff::new();
        for _ in 0..6 {
            b.next_delay();
        }
        b.reset();
        let d = b.next_delay();
        // First post-reset delay is jittered around the base second.
        assert!(d <= BACKOFF_BASE);
        assert!(d >= BACKOFF_BASE / 2);
    }
}
