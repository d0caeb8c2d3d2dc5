use std::io;

/// Central error type for the ravel engine.
#[derive(Debug)]
pub enum RavelError {
    /// Underlying I/O error from the OS or network.
    Io(io::Error),
    /// Connection table reached its maximum capacity.
    TableFull,
    /// Generic or miscellaneous error.
    Other(String),
}

impl RavelError {
    /// True when the wrapped I/O error is EAGAIN/EWOULDBLOCK.
    pub fn is_would_block(&self) -> bool {
        matches!(self, RavelError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

impl std::fmt::Display for RavelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RavelError::Io(e) => write!(f, "I/O error: {}", e),
            RavelError::TableFull => write!(f, "Connection table is full"),
            RavelError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for RavelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RavelError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RavelError {
    fn from(e: io::Error) -> Self {
        RavelError::Io(e)
    }
}

pub type RavelResult<T> = Result<T, RavelError>;
