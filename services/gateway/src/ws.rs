//! `/ws/events` push channel.
//!
//! Each client gets a `hello` frame on connect, a `ping` every
//! `ws.ping_interval_secs` and one `events` frame per pipeline ingest
//! notice. Client frames are ignored apart from close.

use crate::api::AppState;
use axum::extract::ws::{Message, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use mosb_pipeline::{AnnotatedEvent, IngestNotice};
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame<'a> {
    Hello { ts: String },
    Ping { ts: String },
    Events { events: &'a [AnnotatedEvent] },
}

impl ServerFrame<'_> {
    fn hello() -> Self {
        ServerFrame::Hello {
            ts: Utc::now().to_rfc3339(),
        }
    }

    fn ping() -> Self {
        ServerFrame::Ping {
            ts: Utc::now().to_rfc3339(),
        }
    }
}

pub async fn ws_events(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let (sender, receiver) = socket.split();
        pump(sender, receiver, state.pipeline.subscribe(), state.ping_interval).await;
    })
}

/// Serialize and send one frame. Returns false once the client is gone.
async fn send_frame<S>(sender: &mut S, frame: &ServerFrame<'_>) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to serialize WebSocket frame");
            return true;
        }
    };
    match sender.send(Message::Text(text)).await {
        Ok(()) => true,
        Err(e) => {
            debug!(error = %e, "WebSocket send failed");
            false
        }
    }
}

/// Drive one client connection until it closes or the pipeline goes away.
pub async fn pump<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut notices: broadcast::Receiver<IngestNotice>,
    ping_interval: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    metrics::gauge!("gateway_ws_clients").increment(1.0);
    info!("WebSocket client connected");

    if send_frame(&mut sender, &ServerFrame::hello()).await {
        let mut ping = interval_at(Instant::now() + ping_interval, ping_interval);
        loop {
            tokio::select! {
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive failed");
                        break;
                    }
                },
                _ = ping.tick() => {
                    if !send_frame(&mut sender, &ServerFrame::ping()).await {
                        break;
                    }
                }
                notice = notices.recv() => match notice {
                    Ok(notice) => {
                        let frame = ServerFrame::Events { events: &notice.events };
                        if !send_frame(&mut sender, &frame).await {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "WebSocket client lagged behind ingest notices");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }

    metrics::gauge!("gateway_ws_clients").decrement(1.0);
    info!("WebSocket client disconnected");
}
