//! Reconnecting `WebSocket` transport around a [`Reconciler`].

use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tickstream_types::ClientMessage;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::WatchConfig;
use crate::error::ClientError;
use crate::reconciler::Reconciler;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How often progress is logged while connected.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The server said `bye`.
    Bye(String),
    /// The socket closed without a `bye`.
    Closed,
}

/// Connect once, say `hello`, and feed the reconciler until the
/// connection ends.
///
/// # Errors
///
/// Returns an error if the connection cannot be opened, a frame fails to
/// decode, or the transport fails mid-session.
pub async fn run_session(url: &str, reconciler: &mut Reconciler) -> Result<SessionEnd, ClientError> {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| ClientError::WebSocket(format!("connect to {url} failed: {e}")))?;
    info!(url, resume = reconciler.local_tick(), "Connected");

    let (mut sink, mut stream) = socket.split();
    send(&mut sink, &reconciler.hello()).await?;

    let mut progress = tokio::time::interval(PROGRESS_INTERVAL);
    progress.tick().await;

    loop {
        tokio::select! {
            frame = stream.next() => {
                let Some(frame) = frame else {
                    return Ok(SessionEnd::Closed);
                };
                match frame.map_err(|e| ClientError::WebSocket(e.to_string()))? {
                    Message::Text(text) => {
                        let reaction = reconciler.handle_text(text.as_str())?;
                        for reply in &reaction.replies {
                            send(&mut sink, reply).await?;
                        }
                        if let Some(reason) = reaction.bye {
                            let _ = sink.close().await;
                            return Ok(SessionEnd::Bye(reason));
                        }
                    }
                    Message::Close(_) => return Ok(SessionEnd::Closed),
                    Message::Binary(_) => warn!("Ignoring binary frame"),
                    Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
                }
            }
            _ = progress.tick() => {
                let stats = reconciler.stats();
                info!(
                    local_tick = reconciler.local_tick(),
                    credits = reconciler.credits(),
                    pending = reconciler.pending_len(),
                    snapshots = stats.snapshots_applied,
                    deltas = stats.deltas_applied,
                    discarded = stats.discarded,
                    "Stream progress"
                );
            }
        }
    }
}

/// Run sessions forever, waiting `reconnect_delay` between them and
/// resuming from the last applied tick each time.
pub async fn run(config: &WatchConfig, reconciler: &mut Reconciler) {
    loop {
        match run_session(&config.url, reconciler).await {
            Ok(SessionEnd::Bye(reason)) => info!(reason, "Server said bye"),
            Ok(SessionEnd::Closed) => info!("Connection closed"),
            Err(e) => warn!(error = %e, "Session failed"),
        }
        reconciler.on_disconnect();

        debug!(
            delay_ms = u64::try_from(config.reconnect_delay.as_millis()).unwrap_or(u64::MAX),
            local_tick = reconciler.local_tick(),
            "Reconnecting"
        );
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

async fn send(
    sink: &mut SplitSink<Socket, Message>,
    msg: &ClientMessage,
) -> Result<(), ClientError> {
    let json = msg.to_json()?;
    sink.send(Message::Text(json.into()))
        .await
        .map_err(|e| ClientError::WebSocket(e.to_string()))
}
