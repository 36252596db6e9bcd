use serde::Serialize;
use tokio::sync::mpsc;
use whisperbox_protocol::form::{Form, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
    /// Terminal until `initialize` is invoked again.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing  => "initializing",
            Self::Ready         => "ready",
            Self::Failed        => "failed",
        };
        f.write_str(s)
    }
}

/// Domain events for the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A form from the network was admitted.
    NewForm { form: Form },
    /// A response to one of our forms was decrypted and admitted.
    NewResponse { form: Form, response: Response },
    StateChanged { state: EngineState },
}

/// Bounded, non-blocking event publisher. A full queue drops the event.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(ev)) => {
                tracing::warn!("Event queue full, dropping {}", event_name(&ev));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("No event consumer attached");
            }
        }
    }
}

fn event_name(event: &EngineEvent) -> &'static str {
    match event {
        EngineEvent::NewForm { .. }      => "new_form",
        EngineEvent::NewResponse { .. }  => "new_response",
        EngineEvent::StateChanged { .. } => "state_changed",
    }
}

/// Drain events into the log when no other consumer is attached.
pub async fn log_events(mut rx: mpsc::Receiver<EngineEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::NewForm { form } => {
                tracing::info!(form = %form.id, creator = %form.creator, "New form: {}", form.title);
            }
            EngineEvent::NewResponse { form, response } => {
                tracing::info!(
                    form = %form.id,
                    respondent = %response.respondent,
                    "New response to {}", form.title,
                );
            }
            EngineEvent::StateChanged { state } => {
                tracing::info!("Engine state: {state}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (sink, mut rx) = EventSink::channel(1);
        sink.emit(EngineEvent::StateChanged { state: EngineState::Initializing });
        sink.emit(EngineEvent::StateChanged { state: EngineState::Ready });

        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::StateChanged { state: EngineState::Initializing })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_queue_is_harmless() {
        let (sink, rx) = EventSink::channel(4);
        drop(rx);
        sink.emit(EngineEvent::StateChanged { state: EngineState::Failed });
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(EngineEvent::StateChanged { state: EngineState::Ready }).unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["state"], "ready");
    }
}
