//! Error types for fallible data-plane operations.
//!
//! Control-plane methods (connect, discovery, advertising, ...) report
//! [`HciStatus`][crate::hci::HciStatus] codes instead and never raise for peer
//! errors; see the crate-level documentation.

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

impl Error {
    /// Creates an error with an explanatory message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// an unknown error occured
    Unknown,
    /// invalid parameters for Bluetooth operation
    InvalidParameters,
    /// invalid or stale Bluetooth handle
    InvalidHandle,
    /// the Bluetooth device isn't connected
    NotConnected,
    /// the Bluetooth device is already connected
    AlreadyConnected,
    /// unexpected end of input
    UnexpectedEof,
    /// malformed value or record layout
    InvalidFormat,
    /// the Bluetooth operation timed out
    Timeout,
    /// the Bluetooth operation is unsupported
    NotSupported,
    /// Bluetooth adapter not available
    AdapterUnavailable,
    /// file I/O failed
    Io,
    /// internal error
    InternalError,
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            message: String::new(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(ErrorKind::Io, err.to_string())
    }
}
