use snafu::Snafu;

/// The pipeline's full error taxonomy (spec §7). Record-level errors
/// (`Serialization`, parts of `Validation`) never reach the caller of
/// `Engine::log` — they are counted and logged via `tracing::error!`
/// instead. `Configuration` and `Security` errors are fatal at sink-build
/// time and do propagate to whoever calls `Engine::add_sink`.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("configuration error: {message}"))]
    Configuration { message: String },

    #[snafu(display("transport error talking to {sink}: {message}"))]
    Transport { sink: String, message: String },

    #[snafu(display("serialization error: {message}"))]
    Serialization { message: String },

    #[snafu(display("security error: {message}"))]
    Security { message: String },

    #[snafu(display("validation error: {message}"))]
    Validation { message: String },

    #[snafu(display("internal error: {message}"))]
    Internal { message: String },
}

impl Error {
    pub fn configuration(message: impl Into<String>) -> Self {
        Error::Configuration { message: message.into() }
    }

    pub fn security(message: impl Into<String>) -> Self {
        Error::Security { message: message.into() }
    }

    pub fn transport(sink: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transport { sink: sink.into(), message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// What `Engine::on_error` hands back: which sink failed and why. Carries
/// the sink's name rather than a reference to the sink itself, since the
/// callback may outlive any particular sink instance.
#[derive(Debug, Clone)]
pub struct SinkError {
    pub sink: String,
    pub error: Error,
}

impl std::fmt::Display for SinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sink {}: {}", self.sink, self.error)
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Configuration { message } => Error::Configuration { message: message.clone() },
            Error::Transport { sink, message } => Error::Transport { sink: sink.clone(), message: message.clone() },
            Error::Serialization { message } => Error::Serialization { message: message.clone() },
            Error::Security { message } => Error::Security { message: message.clone() },
            Error::Validation { message } => Error::Validation { message: message.clone() },
            Error::Internal { message } => Error::Internal { message: message.clone() },
        }
    }
}

/// Whether a transport-level failure should be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retriability {
    Retriable,
    NonRetriable,
}

/// Classifies an HTTP status code per the sink common contract (§4.5):
/// throttling/5xx/network issues are retriable, 4xx (except 429) are not.
pub fn classify_status(status: u16) -> Retriability {
    match status {
        429 => Retriability::Retriable,
        500..=599 => Retriability::Retriable,
        400..=499 => Retriability::NonRetriable,
        _ => Retriability::NonRetriable,
    }
}
