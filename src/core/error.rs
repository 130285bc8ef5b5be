use thiserror::Error;

use crate::core::rule::Family;

/// Validation failure for a single rule attribute.
///
/// The `message` text is a compatibility surface: manifest front ends and
/// test suites match on it literally, so every message is produced by
/// exactly one constructor below and never formatted ad hoc.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Attribute name as the caller spelled it (e.g. `dst_type`)
    pub attribute: String,
    /// Raw value as received, before normalization
    pub raw: String,
    /// User-facing message
    pub message: String,
}

impl ValidationError {
    pub fn new(
        attribute: impl Into<String>,
        raw: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            attribute: attribute.into(),
            raw: raw.into(),
            message: message.into(),
        }
    }

    /// Value outside the attribute's domain (bad enum token, out-of-range
    /// number, malformed literal).
    pub fn invalid_value(attribute: impl Into<String>, raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let message = format!("Invalid value \"{raw}\".");
        Self::new(attribute, raw, message)
    }

    /// Two equal elements in a list-typed attribute.
    pub fn duplicate_elements(attribute: impl Into<String>, raw: impl Into<String>) -> Self {
        let attribute = attribute.into();
        let message = format!("{attribute} elements must be unique");
        Self::new(attribute, raw, message)
    }

    /// More instances of a match module than the tool version supports.
    pub fn version_gated(
        attribute: impl Into<String>,
        raw: impl Into<String>,
        since: &str,
    ) -> Self {
        let attribute = attribute.into();
        let message = format!(
            "Multiple {attribute} elements are available from iptables version {since} or higher"
        );
        Self::new(attribute, raw, message)
    }

    /// A range endpoint that does not parse as an address of the rule's family.
    pub fn invalid_range_endpoint(
        attribute: impl Into<String>,
        endpoint: &str,
        raw: impl Into<String>,
    ) -> Self {
        let raw = raw.into();
        let message = format!("Invalid IP address \"{endpoint}\" in range \"{raw}\"");
        Self::new(attribute, raw, message)
    }

    /// Attribute used under the wrong protocol family.
    pub fn family_mismatch(
        attribute: impl Into<String>,
        raw: impl Into<String>,
        family: Family,
    ) -> Self {
        let attribute = attribute.into();
        let message = format!("{attribute} is not supported for {family}");
        Self::new(attribute, raw, message)
    }
}

/// Structural failure while reading a save-format dump.
///
/// Unsupported clauses inside an otherwise well-formed rule line are NOT
/// errors; they degrade the line to a foreign rule instead (see
/// [`crate::core::parse`]).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("rule line before any table declaration: {0}")]
    RuleOutsideTable(String),

    #[error("unknown table \"{0}\" in dump")]
    UnknownTable(String),

    #[error("malformed save line: {0}")]
    Malformed(String),
}

/// Top-level error type for iptrc
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attribute validation failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Dump parsing failed
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Failure reported by the privileged tool-invocation layer. The core
    /// never produces or retries these; the message passes through verbatim
    /// for callers that thread both layers into one error type.
    #[error("{0}")]
    Tool(String),
}

pub type Result<T> = std::result::Result<T, Error>;
