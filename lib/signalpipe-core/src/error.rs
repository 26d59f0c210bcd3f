use snafu::Snafu;

/// Errors that can occur while building or draining the core record model.
///
/// These map onto the `Serialization` and `Validation` categories of the
/// pipeline's overall error taxonomy; `Transport`/`Configuration` errors
/// belong to the sinks and are defined in the root crate instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CoreError {
    #[snafu(display("field key must be non-empty"))]
    EmptyFieldKey,

    #[snafu(display("unknown log level: {label}"))]
    UnknownLevel { label: String },

    #[snafu(display("ring buffer write timed out after {waited_ms}ms under block policy"))]
    WriteTimedOut { waited_ms: u64 },
}
