use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{IoError, PrismResult};
use crate::model::EngineEvent;
use crate::transport::codec::{Request, Response};
use crate::transport::dispatcher::Dispatcher;

/// Minimum gap between two progress events per subscriber; in-between
/// events coalesce to the latest.
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Heartbeat cadence, to defeat intermediary idle timeouts.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Per-subscriber queue bound. Overflowing progress events are shed;
/// summaries always wait for room.
const SUBSCRIBER_QUEUE: usize = 64;

/// The local HTTP bridge: the same dispatcher as the stdio loop plus the
/// `text/event-stream` progress channel.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/command", post(command))
        .route("/events", get(events))
        .layer(cors)
        .with_state(engine)
}

pub async fn serve_bridge(engine: Arc<Engine>, addr: SocketAddr) -> PrismResult<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(IoError::Io)?;
    info!(%addr, "http bridge listening");
    axum::serve(listener, router(engine))
        .await
        .map_err(IoError::Io)?;
    Ok(())
}

async fn command(State(engine): State<Arc<Engine>>, Json(request): Json<Request>) -> Json<Response> {
    Json(Dispatcher::new(engine).dispatch(request).await)
}

/// Late subscribers receive no history; they can reconstruct state through
/// `get_pipeline_report`.
async fn events(
    State(engine): State<Arc<Engine>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = engine.events().subscribe();
    let (tx, out) = mpsc::channel::<Event>(SUBSCRIBER_QUEUE);
    tokio::spawn(relay(rx, tx));
    Sse::new(ReceiverStream::new(out).map(Ok))
}

/// Per-subscriber pump: coalesces progress to one event per 100 ms, sheds
/// droppable events under queue pressure, and never drops a summary.
async fn relay(mut rx: broadcast::Receiver<EngineEvent>, tx: mpsc::Sender<Event>) {
    let mut heartbeat = interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut flush = interval(COALESCE_WINDOW);
    flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut pending: Option<EngineEvent> = None;
    let mut last_progress = Instant::now() - COALESCE_WINDOW;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                if tx.send(to_sse(&EngineEvent::heartbeat())).await.is_err() {
                    return;
                }
            }

            _ = flush.tick() => {
                if let Some(event) = pending.take() {
                    // Coalesced progress: shed rather than block.
                    let _ = tx.try_send(to_sse(&event));
                    last_progress = Instant::now();
                }
            }

            received = rx.recv() => match received {
                Ok(event) if event.is_droppable() => {
                    if last_progress.elapsed() >= COALESCE_WINDOW {
                        let _ = tx.try_send(to_sse(&event));
                        last_progress = Instant::now();
                        pending = None;
                    } else {
                        // Keep only the latest within the window.
                        pending = Some(event);
                    }
                }
                Ok(event) => {
                    if let Some(stale) = pending.take() {
                        let _ = tx.try_send(to_sse(&stale));
                    }
                    // Summaries and heartbeats wait for queue room.
                    if tx.send(to_sse(&event)).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged; oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    if let Some(event) = pending.take() {
                        let _ = tx.send(to_sse(&event)).await;
                    }
                    return;
                }
            }
        }
    }
}

fn to_sse(event: &EngineEvent) -> Event {
    Event::default()
        .event(event.sse_name())
        .data(event.payload().to_string())
}
