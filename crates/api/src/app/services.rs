//! Service wiring: one in-memory engine plus a realtime broadcast channel.
//!
//! The engine bus is a blocking `std::sync::mpsc` fan-out. A bridge thread
//! forwards every envelope into a lossy `tokio::sync::broadcast` channel that
//! SSE handlers subscribe to.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use tokio::sync::broadcast;
use tokio_stream::{StreamExt, wrappers::BroadcastStream};

use rentflow_events::Subscription;
use rentflow_infra::{EngineConfig, EngineEnvelope, InMemoryRentalEngine};

const REALTIME_CAPACITY: usize = 256;

pub struct AppServices {
    engine: InMemoryRentalEngine,
    realtime_tx: broadcast::Sender<EngineEnvelope>,
}

impl AppServices {
    pub fn engine(&self) -> &InMemoryRentalEngine {
        &self.engine
    }

    pub fn realtime_tx(&self) -> &broadcast::Sender<EngineEnvelope> {
        &self.realtime_tx
    }
}

pub fn build_services(config: EngineConfig) -> AppServices {
    let engine = InMemoryRentalEngine::in_memory(config);
    let (realtime_tx, _realtime_rx) = broadcast::channel::<EngineEnvelope>(REALTIME_CAPACITY);

    spawn_realtime_bridge(engine.subscribe(), realtime_tx.clone());

    AppServices { engine, realtime_tx }
}

/// Forward committed engine envelopes to the realtime channel.
///
/// Exits once the engine (and with it every bus sender) is dropped.
fn spawn_realtime_bridge(sub: Subscription<EngineEnvelope>, tx: broadcast::Sender<EngineEnvelope>) {
    let spawned = std::thread::Builder::new()
        .name("rentflow-realtime".into())
        .spawn(move || {
            while let Ok(env) = sub.recv() {
                // No SSE clients is not an error.
                let _ = tx.send(env);
            }
            tracing::debug!("engine bus closed; realtime bridge stopped");
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to start realtime bridge; /stream will stay silent");
    }
}

/// Build the SSE stream served by `/stream`.
///
/// Each event is named after the envelope's `event_type` and carries the full
/// envelope as JSON. Lagging clients silently skip what they missed.
pub fn engine_sse_stream(
    services: Arc<AppServices>,
) -> Sse<impl tokio_stream::Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = services.realtime_tx().subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|msg| match msg {
        Ok(env) => {
            let data = serde_json::to_string(&env).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(SseEvent::default().event(env.event_type()).data(data)))
        }
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
