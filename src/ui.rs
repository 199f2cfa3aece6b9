//! UI state sink
//!
//! Audio and conversation threads never touch the GUI directly; they push
//! [`UiEvent`]s onto a queue that the UI's own event loop drains.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// Sprite animation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisualState {
    /// Resting animation
    Idle,
    /// Speaking animation, shown while a reply plays
    Talking,
}

/// A queued UI update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// Switch the sprite animation
    Visual(VisualState),
    /// Replace the status line
    Status(String),
}

/// Receives state transitions from the audio and conversation threads
///
/// Implementations must be cheap and non-blocking.
pub trait UiSink: Send + Sync {
    /// Switch the sprite animation
    fn set_visual(&self, state: VisualState);

    /// Replace the status line
    fn set_status(&self, text: &str);
}

/// Queues events for a UI event loop, de-duplicating repeated statuses
pub struct ChannelUiSink {
    tx: mpsc::UnboundedSender<UiEvent>,
    last_status: Mutex<String>,
}

impl ChannelUiSink {
    /// Create a sink and the receiver the UI loop should drain
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                last_status: Mutex::new(String::new()),
            },
            rx,
        )
    }

    fn send(&self, event: UiEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("ui receiver dropped");
        }
    }
}

impl UiSink for ChannelUiSink {
    fn set_visual(&self, state: VisualState) {
        self.send(UiEvent::Visual(state));
    }

    fn set_status(&self, text: &str) {
        {
            let mut last = self
                .last_status
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if *last == text {
                return;
            }
            text.clone_into(&mut *last);
        }
        self.send(UiEvent::Status(text.to_string()));
    }
}

/// Drain UI events into the log until every sender is dropped
///
/// Used when running headless without a sprite window.
pub async fn log_ui_events(mut rx: mpsc::UnboundedReceiver<UiEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            UiEvent::Status(text) => tracing::info!(status = %text, "status"),
            UiEvent::Visual(state) => tracing::debug!(?state, "animation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_status_is_sent_once() {
        let (sink, mut rx) = ChannelUiSink::new();
        sink.set_status("Listening");
        sink.set_status("Listening");
        sink.set_visual(VisualState::Talking);
        sink.set_status("Playing...");
        sink.set_status("Listening");

        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        assert_eq!(
            events,
            vec![
                UiEvent::Status("Listening".into()),
                UiEvent::Visual(VisualState::Talking),
                UiEvent::Status("Playing...".into()),
                UiEvent::Status("Listening".into()),
            ]
        );
    }

    #[test]
    fn closed_receiver_is_not_an_error() {
        let (sink, rx) = ChannelUiSink::new();
        drop(rx);
        sink.set_status("Exiting");
        sink.set_visual(VisualState::Idle);
    }
}
