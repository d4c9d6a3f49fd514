//! Error types for the connection core.

use thiserror::Error;

/// Errors surfaced by the stream parser and the negotiation engine.
///
/// Every variant is fatal for the current connection attempt: neither the
/// parser nor the engine retries internally. Reconnecting is a policy
/// decision of the caller.
#[derive(Debug, Error)]
pub enum XmppError {
    /// IO error from the outbound writer
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural violation in the incoming XML stream (unbalanced tags,
    /// invalid UTF-8, truncated markup)
    #[error("malformed document: {0}")]
    MalformedDocument(String),

    /// Well-formed XML that violates the expected envelope sequence
    #[error("unexpected element: {0}")]
    UnexpectedElement(String),

    /// A completed structural element could not be materialized
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// Negotiation cannot proceed: nothing in the registry matches the
    /// advertised feature set
    #[error("no activatable stream feature")]
    NoActivatableFeature,

    /// A feature's own sub-protocol failed
    #[error("feature activation failed: {0}")]
    FeatureActivation(String),

    /// Explicit negative outcome of an authentication feature
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Stream-level error outside the parser (writing while closed, bad
    /// stream header version)
    #[error("stream error: {0}")]
    Stream(String),
}

impl XmppError {
    /// Create a new malformed-document error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedDocument(msg.into())
    }

    /// Create a new unexpected-element error.
    pub fn unexpected(msg: impl Into<String>) -> Self {
        Self::UnexpectedElement(msg.into())
    }

    /// Create a new XML parse error.
    pub fn xml_parse(msg: impl Into<String>) -> Self {
        Self::XmlParse(msg.into())
    }

    /// Create a new feature activation error.
    pub fn feature(msg: impl Into<String>) -> Self {
        Self::FeatureActivation(msg.into())
    }

    /// Create a new authorization error.
    pub fn authorization(msg: impl Into<String>) -> Self {
        Self::AuthorizationFailed(msg.into())
    }

    /// Create a new stream error.
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// Whether this error is the user-visible authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, Self::AuthorizationFailed(_))
    }
}
