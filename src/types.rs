use std::time::Duration;

use thiserror::Error;

/// Errors shared by all three cash-device drivers.
///
/// Transport and framing problems come from the serial substrate, the rest
/// are answers (or non-answers) from the peripheral itself.
#[derive(Debug, Error)]
pub enum Error {
    #[error("serial port: {0}")]
    Transport(#[from] std::io::Error),
    #[error("port not connected")]
    NotConnected,
    #[error("connection lost while waiting for reply")]
    ConnectionLost,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("NAK response")]
    Nak,
    #[error("illegal command")]
    Illegal,
    #[error("bad frame: {0}")]
    Framing(&'static str),
    #[error("device error 0x{code:02x}: {label}")]
    Device { code: u8, label: &'static str },
}

impl Error {
    /// Transport-class errors are the only ones the reconnect loop retries;
    /// everything else is handed to the caller as-is.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Transport(_) | Error::NotConnected | Error::ConnectionLost
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Three-letter ISO country code as it appears on the wire.
pub fn country_str(raw: &[u8; 3]) -> &str {
    std::str::from_utf8(raw).unwrap_or("???")
}
