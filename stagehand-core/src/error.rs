use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T> = std::result::Result<T, AnyError>;

pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised while assembling, configuring or driving the stage graph.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no such sink: {0}")]
    NoSuchSink(String),
    #[error("no service installed with role {role} (hint: {hint:?})")]
    NoSuchService { role: String, hint: Option<String> },
    #[error("service {service} has no handler with signature {signature}")]
    NoSuchHandler { service: String, signature: String },
    #[error("stage {0} binds no handlers")]
    NoHandlers(String),
    #[error("stage {stage} binds more than one handler for event type {event}")]
    ConflictingHandlers { stage: String, event: &'static str },
    #[error("sink {name} is bound to both {first} and {second}")]
    ConflictingSink {
        name: String,
        first: String,
        second: String,
    },
    #[error("stage {0} is declared twice")]
    DuplicateStage(String),
    #[error("invalid queue for stage {stage}: {reason}")]
    InvalidQueue { stage: String, reason: String },
    #[error("invalid enqueue predicate for stage {stage}: {reason}")]
    InvalidPredicate { stage: String, reason: String },
    #[error("invalid thread manager: {0}")]
    InvalidThreadManager(String),
    #[error("invalid sink entry {name}: {reason}")]
    InvalidSinkEntry { name: String, reason: String },
    #[error("stage manager is {state}, cannot {action}")]
    Lifecycle {
        state: &'static str,
        action: &'static str,
    },
    #[error("service initialization failed: {0}")]
    Service(#[source] AnyError),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime failures of a single enqueue attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink {sink} is full")]
    Full { sink: String },
    #[error("sink {sink} denied the element")]
    Denied { sink: String },
    #[error("sink {sink} is closed")]
    Closed { sink: String },
    #[error("no such sink: {0}")]
    NoSuchSink(String),
    #[error("event {0} cannot be replicated to several sinks")]
    Unreplicable(&'static str),
}

impl SinkError {
    /// Capacity or admission refusals; the producer may retry later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SinkError::Full { .. } | SinkError::Denied { .. })
    }
}

impl From<SinkError> for Error {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::NoSuchSink(name) => Error::NoSuchSink(name),
            other => Error::Service(other.into()),
        }
    }
}
