use std::io;
use thiserror::Error;

/// Failures of the encrypted frame codec.
#[derive(Debug, Clone, Error)]
pub enum CodecError {
    /// Source is shorter than `IV || TAG`
    #[error("malformed blob: {len} bytes is shorter than the 32-byte frame")]
    MalformedBlob { len: u64 },

    /// Tag did not verify. Any plaintext already emitted must be discarded.
    #[error("authentication failure: tag does not match ciphertext")]
    AuthenticationFailure,

    /// Key material could not be prepared
    #[error("key error: {0}")]
    Key(String),
}

impl CodecError {
    pub fn key(msg: impl Into<String>) -> Self {
        Self::Key(msg.into())
    }

    /// Wrap into an `io::Error` so the failure can travel through `AsyncRead`.
    pub fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }

    /// Recover a codec failure that was carried inside an `io::Error`.
    pub fn from_io(err: &io::Error) -> Option<&CodecError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<CodecError>())
    }
}

/// Storage backend failures.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Key resolves outside the configured root
    #[error("storage key escapes the storage root: {0}")]
    PathEscape(String),

    /// Object store or disk call failed
    #[error("storage backend unavailable: {0}")]
    Backend(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// Map an I/O error for `key`, keeping "not found" distinct.
    pub fn from_io(key: &str, err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::NotFound && CodecError::from_io(&err).is_none() {
            Self::NotFound(key.to_string())
        } else {
            Self::Io(err)
        }
    }
}

/// Remote agent boundary failures.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    /// Connection failure, timeout or non-2xx answer
    #[error("agent unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("agent returned an invalid response: {0}")]
    InvalidResponse(String),
}

impl AgentError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Wrap into an `io::Error` for agent bodies read through `AsyncRead`.
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }

    pub fn from_io(err: &io::Error) -> Option<&AgentError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<AgentError>())
    }
}

/// Archive composition failures. Any of these aborts the whole archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read entry {entry}: {source}")]
    EntryRead {
        entry: String,
        #[source]
        source: Box<VaultError>,
    },

    #[error("agent unavailable while reading entry {entry}: {reason}")]
    AgentUnavailable { entry: String, reason: String },

    /// The downstream sink rejected bytes (typically a client disconnect)
    #[error("archive container write failed: {0}")]
    ContainerWrite(String),

    #[error("archive root not found: {0}")]
    UnknownRoot(String),
}

impl ArchiveError {
    pub fn entry_read(entry: impl Into<String>, source: impl Into<VaultError>) -> Self {
        Self::EntryRead {
            entry: entry.into(),
            source: Box::new(source.into()),
        }
    }

    pub fn container(msg: impl ToString) -> Self {
        Self::ContainerWrite(msg.to_string())
    }
}

/// Top-level error for vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error(transparent)]
    Codec(CodecError),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("config error: {0}")]
    Config(String),
}

impl VaultError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True when the remote agent (custom drive) could not be reached. Callers
    /// show a "reconnect the agent" message instead of a generic failure.
    pub fn is_agent_unavailable(&self) -> bool {
        match self {
            Self::Agent(AgentError::Unavailable { .. }) => true,
            Self::Archive(ArchiveError::AgentUnavailable { .. }) => true,
            Self::Archive(ArchiveError::EntryRead { source, .. }) => source.is_agent_unavailable(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Storage(StorageError::NotFound(_)) => true,
            Self::Archive(ArchiveError::EntryRead { source, .. }) => source.is_not_found(),
            _ => false,
        }
    }

    /// Tamper, corruption or truncation detected by the codec.
    pub fn is_integrity_failure(&self) -> bool {
        match self {
            Self::Codec(CodecError::AuthenticationFailure | CodecError::MalformedBlob { .. }) => {
                true
            }
            Self::Archive(ArchiveError::EntryRead { source, .. }) => source.is_integrity_failure(),
            _ => false,
        }
    }
}

impl From<CodecError> for VaultError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        // A codec failure raised by a source stream surfaces through the
        // backend's I/O path; report it as what it is.
        match err {
            StorageError::Io(io_err) => Self::from(io_err),
            other => Self::Storage(other),
        }
    }
}

impl From<io::Error> for VaultError {
    fn from(err: io::Error) -> Self {
        if let Some(codec) = CodecError::from_io(&err) {
            return Self::Codec(codec.clone());
        }
        if let Some(agent) = AgentError::from_io(&err) {
            return Self::Agent(agent.clone());
        }
        Self::Storage(StorageError::Io(err))
    }
}
