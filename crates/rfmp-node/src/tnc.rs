//! KISS-over-TCP TNC link.
//!
//! A long-lived task owns the socket: it connects (with exponential backoff
//! from one second to thirty), then runs the receive and transmit loops on
//! the split halves until either side fails, and reconnects. A fresh
//! [`Deframer`] per connection discards stale bytes up to the next `FEND`.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use rfmp_core::{Store, TxPoll};
use rfmp_proto::UiFrame;
use rfmp_proto::kiss::Deframer;

use crate::NodeShared;

const RECONNECT_MIN: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Pause applied to the RX loop after a store error (avoid an error storm).
const RX_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Connection manager: connect, pump, reconnect until shutdown.
pub(crate) async fn run_link<S: Store>(
    shared: std::sync::Arc<NodeShared<S>>,
    host: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = RECONNECT_MIN;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => {
                tracing::info!(%host, port, "TNC connected");
                backoff = RECONNECT_MIN;
                shared.set_connected(true).await;

                let (read, write) = stream.into_split();
                tokio::select! {
                    result = rx_loop(&shared, read) => {
                        tracing::warn!(?result, "TNC receive side closed");
                    },
                    result = tx_loop(&shared, write) => {
                        tracing::warn!(?result, "TNC transmit side closed");
                    },
                    _ = shutdown.changed() => {
                        shared.set_connected(false).await;
                        return;
                    },
                }
                shared.set_connected(false).await;
            },
            Err(err) => {
                tracing::debug!(%err, "TNC connect failed, retrying in {backoff:?}");
            },
        }

        tokio::select! {
            () = tokio::time::sleep(backoff) => {},
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// Read bytes, deframe, decode AX.25, hand UI frames to the engine.
async fn rx_loop<S: Store>(
    shared: &NodeShared<S>,
    mut read: OwnedReadHalf,
) -> std::io::Result<()> {
    let mut deframer = Deframer::new();
    let mut buf = [0u8; 2048];
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            if let Err(err) = deframer.finish() {
                let mut engine = shared.engine.lock().await;
                engine.note_framing_error(&err);
            }
            return Ok(());
        }

        deframer.extend(&buf[..n]);
        {
            // Any energy on the channel counts as carrier for CSMA.
            let mut engine = shared.engine.lock().await;
            engine.carrier_activity();
        }

        while let Some((_port, payload)) = deframer.next_frame() {
            let ui = {
                let mut engine = shared.engine.lock().await;
                match UiFrame::decode(&payload) {
                    Ok(ui) => ui,
                    Err(err) => {
                        engine.note_framing_error(&err);
                        continue;
                    },
                }
            };
            let handled = {
                let mut engine = shared.engine.lock().await;
                engine.handle_ui_frame(&ui)
            };
            match handled {
                Ok(events) => shared.publish(events),
                Err(err) => {
                    tracing::error!(%err, "ingest failed after retry, pausing receive");
                    tokio::time::sleep(RX_ERROR_PAUSE).await;
                },
            }
        }
    }
}

/// Poll the engine for cleared frames and write them to the socket.
async fn tx_loop<S: Store>(
    shared: &NodeShared<S>,
    mut write: OwnedWriteHalf,
) -> std::io::Result<()> {
    loop {
        let poll = {
            let mut engine = shared.engine.lock().await;
            engine.poll_tx()
        };
        match poll {
            Ok(TxPoll::Idle { retry_in_ms }) => {
                tokio::time::sleep(Duration::from_millis(retry_in_ms.clamp(10, 1_000))).await;
            },
            Ok(TxPoll::Frame { id, kiss_frame }) => match write.write_all(&kiss_frame).await {
                Ok(()) => {
                    let events = {
                        let mut engine = shared.engine.lock().await;
                        engine.tx_sent(id)
                    };
                    match events {
                        Ok(events) => shared.publish(events),
                        Err(err) => tracing::error!(%err, "tx bookkeeping failed"),
                    }
                },
                Err(err) => {
                    let events = {
                        let mut engine = shared.engine.lock().await;
                        engine.tx_failed(id)
                    };
                    if let Ok(events) = events {
                        shared.publish(events);
                    }
                    return Err(err);
                },
            },
            Err(err) => {
                tracing::error!(%err, "tx poll failed");
                tokio::time::sleep(RX_ERROR_PAUSE).await;
            },
        }
    }
}

/// Offline-mode transmit drain: frames clear the queue without touching a
/// wire (tests, store import tooling).
pub(crate) async fn run_offline_drain<S: Store>(
    shared: std::sync::Arc<NodeShared<S>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let poll = {
            let mut engine = shared.engine.lock().await;
            engine.poll_tx()
        };
        let wait = match poll {
            Ok(TxPoll::Frame { id, .. }) => {
                let events = {
                    let mut engine = shared.engine.lock().await;
                    engine.tx_sent(id)
                };
                if let Ok(events) = events {
                    shared.publish(events);
                }
                0
            },
            Ok(TxPoll::Idle { retry_in_ms }) => retry_in_ms.clamp(10, 1_000),
            Err(_) => 100,
        };
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(wait.max(1))) => {},
            _ = shutdown.changed() => return,
        }
    }
}
