use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::serial::SerialConfig;

/// `config.toml`: one table per driver, all optional. A missing table means
/// the device is not installed in this kiosk.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    pub cashcode: Option<DeviceConfig>,
    pub cctalk: Option<DeviceConfig>,
    pub lcdm: Option<LcdmConfig>,
    pub socket: Option<SocketConfig>,
    pub sber: Option<SberConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub com: String,
    pub baudrate: Option<u32>,
    pub adr: Option<u8>,
}

impl DeviceConfig {
    pub fn serial(&self, default_baudrate: u32) -> SerialConfig {
        SerialConfig::new(&self.com, self.baudrate.unwrap_or(default_baudrate))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LcdmConfig {
    pub com: String,
    pub baudrate: Option<u32>,
    #[serde(default)]
    pub upper_nominal: u64,
    #[serde(default)]
    pub lower_nominal: u64,
}

impl LcdmConfig {
    pub fn serial(&self, default_baudrate: u32) -> SerialConfig {
        SerialConfig::new(&self.com, self.baudrate.unwrap_or(default_baudrate))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for SocketConfig {
    fn default() -> SocketConfig {
        SocketConfig {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:4801".to_owned()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SberConfig {
    /// Working directory the vendor binary runs in; a temp dir when unset.
    pub install: Option<PathBuf>,
    /// Vendor distribution to copy into the install dir.
    pub dist: Option<PathBuf>,
    pub com: Option<String>,
    #[serde(default)]
    pub demo: bool,
}

pub fn load(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_per_driver_tables() {
        let cfg: Config = toml::from_str(
            r#"
            [cashcode]
            com = "/dev/ttyUSB0"
            adr = 3

            [cctalk]
            com = "/dev/ttyUSB1"
            baudrate = 9600
            adr = 2

            [lcdm]
            com = "/dev/ttyUSB2"
            upper_nominal = 1000
            lower_nominal = 100

            [socket]
            listen = "127.0.0.1:4801"

            [sber]
            demo = true
            "#,
        )
        .unwrap();
        let cc = cfg.cashcode.unwrap();
        // missing baudrate falls back to the protocol default
        assert_eq!(cc.serial(19200).baudrate, 19200);
        assert_eq!(cc.adr, Some(3));
        assert_eq!(cfg.cctalk.unwrap().baudrate, Some(9600));
        let lcdm = cfg.lcdm.unwrap();
        assert_eq!(lcdm.upper_nominal, 1000);
        assert_eq!(cfg.socket.unwrap().listen, "127.0.0.1:4801");
        assert!(cfg.sber.unwrap().demo);
    }

    #[test]
    fn empty_config_is_valid() {
        let cfg: Config = toml::from_str("").unwrap();
        assert!(cfg.cashcode.is_none());
        assert_eq!(SocketConfig::default().listen, "0.0.0.0:4801");
    }
}
