//! Error types for custody operations

use thiserror::Error;

/// Result type alias for custody operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which protection layer detected an attempted nonce reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseLayer {
    /// The durable local state file already records this request.
    LocalState,
    /// The secret module already holds a commitment for this request.
    SecretModule,
    /// The bulletin board already carries this node's commitment.
    Board,
}

impl std::fmt::Display for ReuseLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReuseLayer::LocalState => write!(f, "local state"),
            ReuseLayer::SecretModule => write!(f, "secret module"),
            ReuseLayer::Board => write!(f, "bulletin board"),
        }
    }
}

/// Errors that can occur while driving custody ceremonies
#[derive(Debug, Error)]
pub enum Error {
    /// A signing nonce would be issued twice for the same request.
    #[error("nonce reuse attempted for request {request_id} (detected by {layer})")]
    NonceReuseAttempted { request_id: String, layer: ReuseLayer },

    /// A secret value was asked for in production mode.
    #[error("secret extraction forbidden in production mode: {0}")]
    SecretExtractionForbidden(String),

    /// A received DKG share does not match its Feldman commitments, or a
    /// complaint blocks finalisation.
    #[error("DKG verification failed: {0}")]
    DkgVerificationFailed(String),

    /// The combined signature failed the group-key check.
    #[error("combined signature failed verification for request {0}")]
    SignatureVerificationFailed(String),

    /// Ceremony parameters or participant sets disagree across nodes.
    #[error("participant mismatch: {0}")]
    ParticipantMismatch(String),

    /// This node approved but is not in the locked signing session.
    #[error("node not in locked session for request {0}")]
    NotInSession(String),

    /// Transport failures that outlived the retry budget.
    #[error("transient transport failure: {0}")]
    TransientTransport(String),

    /// The durable state disagrees with the secret module or the board.
    #[error("durable state corruption: {0}")]
    StateCorruption(String),

    /// Finalise was attempted without a prior approve.
    #[error("this node has not approved request {0}")]
    NotApproved(String),

    /// The monotonic counter reached its maximum; it never wraps.
    #[error("nonce counter exhausted")]
    CounterExhausted,

    /// Invalid local configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A ceremony step was invoked out of order.
    #[error("operation out of order: {0}")]
    OutOfOrder(String),

    /// The signing request is not on the board.
    #[error("signing request not found: {0}")]
    RequestNotFound(String),

    /// A request with this id already exists on the board.
    #[error("request id already in use: {0}")]
    RequestExists(String),

    /// A board blob failed validation.
    #[error("malformed message at {path}: {reason}")]
    MalformedMessage { path: String, reason: String },

    /// A first-write-wins path was taken by another writer.
    #[error("board path occupied: {0}")]
    BoardOccupied(String),

    /// Module authentication failed.
    #[error("secret module authentication failed")]
    BadPin,

    /// A labelled object is missing from the secret module.
    #[error("object not found in secret module: {0}")]
    MissingObject(String),

    /// Secret module storage failure.
    #[error("secret module error: {0}")]
    Module(String),

    /// Point or scalar codec failure.
    #[error("invalid curve encoding: {0}")]
    InvalidEncoding(String),

    /// RSA or HMAC primitive failure.
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bulletin::Error> for Error {
    fn from(e: bulletin::Error) -> Self {
        match e {
            bulletin::Error::Occupied(path) => Error::BoardOccupied(path),
            other => Error::TransientTransport(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
