//! Typed engine events, fanned out over a broadcast channel.
//!
//! Every payload is human-readable and cost-free — the host UI renders these
//! directly, so no dollar amounts, token counts, or internal exception text
//! may ever appear here.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::jobs::Priority;
use crate::session::StageKind;

/// Default broadcast channel capacity.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Events emitted by the engine as jobs move through their lifecycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Enqueued {
        job_id: Uuid,
        session_id: String,
        priority: Priority,
    },
    Started {
        job_id: Uuid,
        session_id: String,
    },
    Progress {
        job_id: Uuid,
        session_id: String,
        progress: u8,
        message: String,
    },
    Stage {
        job_id: Uuid,
        session_id: String,
        stage: StageKind,
    },
    Completed {
        job_id: Uuid,
        session_id: String,
        duration_secs: f64,
        partial: bool,
        from_cache: bool,
    },
    Failed {
        job_id: Uuid,
        session_id: String,
        message: String,
    },
    Cancelled {
        job_id: Uuid,
        session_id: String,
    },
    Retry {
        job_id: Uuid,
        session_id: String,
        attempt: u32,
        delay_ms: u64,
        message: String,
    },
    BatchUpdate {
        summary: String,
        pending: usize,
        processing: usize,
        completed: usize,
        failed: usize,
    },
}

impl EngineEvent {
    /// The session this event concerns, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Enqueued { session_id, .. }
            | Self::Started { session_id, .. }
            | Self::Progress { session_id, .. }
            | Self::Stage { session_id, .. }
            | Self::Completed { session_id, .. }
            | Self::Failed { session_id, .. }
            | Self::Cancelled { session_id, .. }
            | Self::Retry { session_id, .. } => Some(session_id),
            Self::BatchUpdate { .. } => None,
        }
    }
}

/// Broadcast fan-out for engine events.
///
/// Emission is synchronous and never blocks dispatch: a send with no
/// receivers (or with lagged receivers) is simply dropped.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to engine events. Each listener calls this.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Subscribe as a `Stream`.
    pub fn stream(&self) -> BroadcastStream<EngineEvent> {
        BroadcastStream::new(self.tx.subscribe())
    }

    /// Emit an event. Ok if no receivers are listening.
    pub fn emit(&self, event: EngineEvent) {
        tracing::debug!(event = ?event, "Engine event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        let job_id = Uuid::new_v4();
        bus.emit(EngineEvent::Started {
            job_id,
            session_id: "sess_1".into(),
        });

        match rx.recv().await.unwrap() {
            EngineEvent::Started { job_id: got, .. } => assert_eq!(got, job_id),
            other => panic!("Expected Started, got {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::BatchUpdate {
            summary: "idle".into(),
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
        });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = EngineEvent::Enqueued {
            job_id: Uuid::nil(),
            session_id: "sess_1".into(),
            priority: Priority::High,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "enqueued");
        assert_eq!(json["priority"], "high");
    }
}
