//! Progress reporting for long-running driver operations

use tokio::sync::mpsc;

/// A single progress update emitted while a driver operation runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Stable identifier for the step (e.g. "bootstrap/my-builder")
    pub id: String,
    /// Human-readable step name
    pub name: String,
    /// Whether the step has started
    pub started: bool,
    /// Whether the step has finished (successfully or not)
    pub completed: bool,
    /// Failure description when the step ended with an error
    pub error: Option<String>,
}

/// Write-only sink for progress events.
///
/// A writer built with [`ProgressWriter::discard`] silently drops everything,
/// as does a writer whose receiver has gone away.
#[derive(Clone, Debug, Default)]
pub struct ProgressWriter {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressWriter {
    /// Create a writer and the receiver that observes its events
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A writer that drops all events
    pub fn discard() -> Self {
        Self::default()
    }

    /// Send an event, ignoring a closed or absent receiver
    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    /// Start tracking a named step
    pub fn step(&self, id: impl Into<String>, name: impl Into<String>) -> ProgressStep<'_> {
        let step = ProgressStep {
            writer: self,
            id: id.into(),
            name: name.into(),
        };
        step.emit(false, None);
        step
    }
}

/// Handle for a step started with [`ProgressWriter::step`]
pub struct ProgressStep<'a> {
    writer: &'a ProgressWriter,
    id: String,
    name: String,
}

impl ProgressStep<'_> {
    /// Mark the step as finished, recording the error if there was one
    pub fn finish<T, E: std::fmt::Display>(self, result: &Result<T, E>) {
        let error = result.as_ref().err().map(|e| e.to_string());
        self.emit(true, error);
    }

    fn emit(&self, completed: bool, error: Option<String>) {
        self.writer.send(ProgressEvent {
            id: self.id.clone(),
            name: self.name.clone(),
            started: true,
            completed,
            error,
        });
    }
}
