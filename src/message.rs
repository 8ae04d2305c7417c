//! Messages flowing from supervised tasks to the output bus.
//!
//! Every task writes [`Message`] values onto its own [`Sink`]. Non-control messages
//! carry exactly one line of output; control messages annotate lifecycle changes.

use tokio::sync::mpsc;

/// Capacity of every bus channel. Kept at one so a slow consumer pushes back on producers.
pub const BUS_CAPACITY: usize = 1;

/// Sending half of a task's message channel.
pub type Sink = mpsc::Sender<Message>;

/// What a [`Message`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A line of regular output.
    Log,
    /// A line of error output.
    Error,
    /// The task is being stopped.
    Stopped,
    /// The task is relaunching its process after a change.
    Restarting,
    /// A resource sample (memory) for the task's process.
    Metric,
}

impl Kind {
    /// Control kinds annotate the stream and never go through structured extraction.
    pub fn is_control(self) -> bool {
        matches!(self, Kind::Stopped | Kind::Restarting | Kind::Metric)
    }
}

/// Unit of communication from a task to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Identity of the emitting task.
    pub source: String,
    pub kind: Kind,
    /// One line of text (newline stripped) or a control annotation.
    pub content: String,
}

impl Message {
    pub fn new(source: impl Into<String>, kind: Kind, content: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind,
            content: content.into(),
        }
    }

    pub fn stopped(source: impl Into<String>) -> Self {
        Self::new(source, Kind::Stopped, "stopping")
    }

    pub fn restarting(source: impl Into<String>) -> Self {
        Self::new(source, Kind::Restarting, "restarting")
    }
}

/// Creates one bus channel.
pub fn bus() -> (Sink, mpsc::Receiver<Message>) {
    mpsc::channel(BUS_CAPACITY)
}
