use std::fmt;

/// Coarse classification used for exit codes and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad invocation: unknown mode, malformed snapshot name.
    Usage,
    /// A snapshot (or remote path) that was asked for does not exist.
    NotFound,
    /// The catalog contradicts itself: missing parent, cycle, unreadable link.
    ChainCorrupt,
    /// Remote or network failure that may succeed on a later attempt.
    Transient,
    Fatal,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    msg: String,
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Fatal, msg)
    }

    pub fn new<M: Into<String>>(kind: ErrorKind, msg: M) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn usage<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Usage, msg)
    }

    pub fn not_found<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn chain_corrupt<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::ChainCorrupt, msg)
    }

    pub fn transient<M: Into<String>>(msg: M) -> Self {
        Self::new(ErrorKind::Transient, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    /// Prefix the message while keeping the classification.
    pub fn context(self, what: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            msg: format!("{what}: {}", self.msg),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self.kind {
            ErrorKind::Usage | ErrorKind::NotFound | ErrorKind::ChainCorrupt => 2,
            ErrorKind::Transient | ErrorKind::Fatal => 1,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.msg)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
