use std::collections::TryReserveError;
use std::io;

/// The DPS error type
///
/// Every variant maps to a stable numeric code through [`DpsError::code`],
/// which is what the side channel records.
#[derive(Debug, thiserror::Error)]
pub enum DpsError {
    /// Backend unreachable or misconfigured
    #[error("connection error: {0}")]
    Connection(String),

    /// No engine registered under the configured backend name
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// A store with this name already exists
    #[error("store exists: {0}")]
    StoreExists(String),

    /// No store with this name
    #[error("store does not exist: {0}")]
    StoreDoesNotExist(String),

    /// No store with this id
    #[error("invalid store id: {0}")]
    InvalidStoreId(String),

    /// A step of store creation failed
    #[error("store creation failed: {0}")]
    StoreCreation(String),

    /// Reading or resetting store metadata failed
    #[error("store metadata error: {0}")]
    StoreInfo(String),

    /// Checking for a store or a key failed
    #[error("existence check failed: {0}")]
    KeyExistenceCheck(String),

    /// Data item read error
    #[error("data item read error: {0}")]
    DataItemRead(String),

    /// Data item write error
    #[error("data item write error: {0}")]
    DataItemWrite(String),

    /// Data item delete error
    #[error("data item delete error: {0}")]
    DataItemDelete(String),

    /// Catalog read error
    #[error("catalog read error: {0}")]
    CatalogRead(String),

    /// Catalog write error
    #[error("catalog write error: {0}")]
    CatalogWrite(String),

    /// A new catalog segment could not be created
    #[error("catalog segment creation error: {0}")]
    CatalogSegmentCreation(String),

    /// Lock could not be acquired within the retry budget
    #[error("lock acquisition error: {0}")]
    LockAcquisition(String),

    /// Lock could not be acquired within the caller's wait time
    #[error("lock timeout: {0}")]
    LockTimeout(String),

    /// Lock metadata could not be read or written
    #[error("lock info error: {0}")]
    LockInfo(String),

    /// No lock with this id
    #[error("invalid lock id: {0}")]
    InvalidLockId(String),

    /// Removing a lock failed
    #[error("lock removal error: {0}")]
    LockRemoval(String),

    /// Buffer allocation failed on read
    #[error("allocation error: {0}")]
    Allocation(#[from] TryReserveError),

    /// Capability signal. The backend lacks TTL or raw commands
    #[error("feature not supported: {0}")]
    FeatureNotSupported(String),

    /// Wrong store/iterator pairing or malformed iteration state
    #[error("store iteration error: {0}")]
    StoreIteration(String),

    /// Raw command rejected or failed
    #[error("data store command error: {0}")]
    Command(String),

    /// Making writes durable failed
    #[error("persist error: {0}")]
    Persist(String),

    /// Malformed reply from the backend
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO Error
    #[error(transparent)]
    Io(#[from] io::Error),

    /// HTTP transport error
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Base64 decode error
    #[error(transparent)]
    Decode(#[from] base64::DecodeError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] toml::de::Error),
}

impl DpsError {
    /// Stable numeric code for this error.
    pub fn code(&self) -> u32 {
        match self {
            DpsError::Command(_) => 99,
            DpsError::Connection(_) | DpsError::Io(_) | DpsError::Http(_) => 102,
            DpsError::UnknownBackend(_) | DpsError::Config(_) => 101,
            DpsError::StoreCreation(_) => 104,
            DpsError::DataItemWrite(_) => 107,
            DpsError::DataItemRead(_) | DpsError::Decode(_) => 108,
            DpsError::StoreExists(_) => 109,
            DpsError::StoreDoesNotExist(_) => 110,
            DpsError::CatalogRead(_) => 111,
            DpsError::CatalogWrite(_) => 112,
            DpsError::DataItemDelete(_) => 113,
            DpsError::StoreInfo(_) => 115,
            DpsError::CatalogSegmentCreation(_) => 119,
            DpsError::Allocation(_) => 125,
            DpsError::StoreIteration(_) => 131,
            DpsError::KeyExistenceCheck(_) => 133,
            DpsError::InvalidStoreId(_) => 143,
            DpsError::FeatureNotSupported(_) => 153,
            DpsError::Protocol(_) | DpsError::Json(_) => 154,
            DpsError::Persist(_) => 155,
            DpsError::LockInfo(_) => 507,
            DpsError::LockAcquisition(_) => 510,
            DpsError::InvalidLockId(_) => 512,
            DpsError::LockTimeout(_) => 513,
            DpsError::LockRemoval(_) => 515,
        }
    }

    /// True for the capability signal, which callers may treat as non-fatal.
    pub fn is_not_supported(&self) -> bool {
        matches!(self, DpsError::FeatureNotSupported(_))
    }
}

/// Result type
pub type Result<T> = std::result::Result<T, DpsError>;

/// Side-channel record of the last error produced by an operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorChannel {
    code: u32,
    message: String,
}

impl ErrorChannel {
    /// Record the outcome of an operation; success clears the channel.
    pub fn record<T>(&mut self, result: &Result<T>) {
        match result {
            Ok(_) => self.reset(),
            Err(e) => self.set(e),
        }
    }

    /// Store the code and message of `err`.
    pub fn set(&mut self, err: &DpsError) {
        self.code = err.code();
        self.message = err.to_string();
    }

    #[allow(missing_docs)]
    pub fn reset(&mut self) {
        self.code = 0;
        self.message.clear();
    }

    #[allow(missing_docs)]
    pub fn has_error(&self) -> bool {
        self.code != 0
    }

    /// Zero when the last operation succeeded.
    pub fn code(&self) -> u32 {
        self.code
    }

    #[allow(missing_docs)]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_tracks_last_outcome() {
        let mut channel = ErrorChannel::default();
        let failed: Result<()> = Err(DpsError::StoreExists("orders".to_string()));
        channel.record(&failed);
        assert!(channel.has_error());
        assert_eq!(channel.code(), 109);
        assert!(channel.message().contains("orders"));

        channel.record(&Ok::<u64, DpsError>(7));
        assert!(!channel.has_error());
        assert_eq!(channel.message(), "");
    }

    #[test]
    fn not_supported_is_a_capability_signal() {
        let err = DpsError::FeatureNotSupported("ttl".to_string());
        assert!(err.is_not_supported());
        assert!(!DpsError::Connection("down".to_string()).is_not_supported());
    }
}
