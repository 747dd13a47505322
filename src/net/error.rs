use std::fmt;

/// Error type for all kernel-facing network operations
#[derive(Debug)]
pub enum NetworkError {
    /// Netlink operation failed
    Netlink(rtnetlink::Error),
    /// System I/O error
    Io(std::io::Error),
    /// External tool invocation failed
    Command { cmd: String, stderr: String },
    /// Device or route not found
    NotFound(String),
    /// Device already exists
    AlreadyExists(String),
    /// Namespace operation failed
    Namespace(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkError::Netlink(e) => write!(f, "netlink error: {}", e),
            NetworkError::Io(e) => write!(f, "io error: {}", e),
            NetworkError::Command { cmd, stderr } => {
                write!(f, "command '{}' failed: {}", cmd, stderr)
            }
            NetworkError::NotFound(msg) => write!(f, "not found: {}", msg),
            NetworkError::AlreadyExists(msg) => write!(f, "already exists: {}", msg),
            NetworkError::Namespace(msg) => write!(f, "namespace error: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<rtnetlink::Error> for NetworkError {
    fn from(e: rtnetlink::Error) -> Self {
        NetworkError::Netlink(e)
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e)
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
