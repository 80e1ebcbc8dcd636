use thiserror::Error;

/// Extraction failures are never fatal to a cycle: the offending call site is
/// skipped and counted, and the rest of the record is still mined.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractError {
    #[error("Malformed extraction call at byte offset {offset}: {reason}")]
    MalformedCall { offset: usize, reason: String },
}
