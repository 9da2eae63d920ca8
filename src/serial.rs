use std::fmt::Write as _;
use std::time::Duration;

use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Delay before a failed port is reopened.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SerialConfig {
    pub path: String,
    pub baudrate: u32,
}

impl SerialConfig {
    pub fn new(path: impl Into<String>, baudrate: u32) -> SerialConfig {
        SerialConfig {
            path: path.into(),
            baudrate,
        }
    }
}

/// Open the port 8N1, no flow control. All three device families use the
/// same line settings and differ only in baud rate.
pub fn open(cfg: &SerialConfig) -> tokio_serial::Result<SerialStream> {
    tokio_serial::new(&cfg.path, cfg.baudrate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()
}

/// Lowercase hex dump for TX/RX traces.
pub fn hex(data: &[u8]) -> String {
    let mut s = String::with_capacity(data.len() * 2);
    for b in data {
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::hex;

    #[test]
    fn hex_dump() {
        assert_eq!(hex(&[0x02, 0x03, 0x06, 0x33, 0xda, 0x81]), "02030633da81");
        assert_eq!(hex(&[]), "");
    }
}
