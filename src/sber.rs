use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use encoding_rs::KOI8_R;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::SberConfig;

/// Wire format of the terminal's timestamp field.
const TIME_FORMAT: &str = "%Y%m%d%H%M%S";

const NO_ANSWER: &str = "Нет ответа от терминала";
const NO_RECEIPT: &str = "Нет чека";
const CANCELLED: &str = "Отменено клиентом";

/// Raw result of one `sb_pilot` invocation: the status line split out of the
/// `e` file plus the receipt text from `p`.
#[derive(Debug, Clone, Default)]
pub struct PilotOutput {
    pub status: String,
    pub status_text: String,
    pub answer: Vec<String>,
    pub message: String,
}

impl PilotOutput {
    fn failure(status: &str, text: impl Into<String>) -> PilotOutput {
        PilotOutput {
            status: status.into(),
            status_text: text.into(),
            answer: Vec::new(),
            message: String::new(),
        }
    }

    fn line(&self, i: usize) -> String {
        self.answer
            .get(i)
            .map(|s| s.trim().to_owned())
            .unwrap_or_default()
    }
}

/// A card payment as reported by the terminal.
#[derive(Debug, Clone, Default)]
pub struct Acquiring {
    pub status: String,
    pub status_text: String,
    pub card: String,
    pub auth: String,
    pub check: String,
    pub terminal: String,
    /// ISO-8601, terminal clock; falls back to the host clock when the
    /// terminal omits or garbles the field.
    pub time: String,
    pub link: String,
    pub hash: String,
    pub merchant: String,
    pub amount: f64,
    pub answer: Vec<String>,
    pub message: String,
}

impl Acquiring {
    fn from_output(out: PilotOutput, amount: f64) -> Acquiring {
        let time = NaiveDateTime::parse_from_str(&out.line(8), TIME_FORMAT)
            .unwrap_or_else(|_| Local::now().naive_local())
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string();
        let message = if out.status == "2000" {
            CANCELLED.to_string()
        } else {
            out.message.clone()
        };
        Acquiring {
            card: out.line(1),
            auth: out.line(3),
            check: out.line(4),
            terminal: out.line(7),
            time,
            link: out.line(9),
            hash: out.line(10),
            merchant: out.line(13),
            amount: if out.status == "0" { amount } else { 0.0 },
            status: out.status,
            status_text: out.status_text,
            answer: out.answer,
            message,
        }
    }
}

/// Driver for the vendor acquiring binary. `sb_pilot` talks to the payment
/// terminal itself; this side only runs it in its install directory and
/// reads back the `e` (status lines) and `p` (receipt) files it leaves
/// behind, both KOI8-R.
pub struct Pilot {
    install: PathBuf,
}

impl Pilot {
    pub fn new(cfg: &SberConfig) -> std::io::Result<Pilot> {
        let install = cfg
            .install
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("sb_pilot"));
        std::fs::create_dir_all(&install)?;
        if let Some(dist) = &cfg.dist {
            let source = if cfg.demo {
                dist.join("demo")
            } else {
                dist.join("sb_pilot")
            };
            copy_tree(&source, &install)?;
        }
        for bin in ["sb_pilot", "upnixmn.out", "posScheduler"] {
            set_executable(&install.join(bin));
        }
        // the vendor binary expects its COM device under a fixed name
        if let Some(com) = &cfg.com {
            link_device(com, &install.join("ttyS99"));
        }
        info!(install = %install.display(), "sb_pilot ready");
        Ok(Pilot { install })
    }

    /// Run `./sb_pilot <args...>` and collect its file-based answer.
    /// Failures never raise: they come back as negative status codes the
    /// same way the terminal reports its own.
    pub async fn run(&self, args: &[&str]) -> PilotOutput {
        for stale in ["e", "p"] {
            let _ = std::fs::remove_file(self.install.join(stale));
        }
        let result = Command::new("./sb_pilot")
            .args(args)
            .current_dir(&self.install)
            .output()
            .await;
        let output = match result {
            Ok(out) => out,
            Err(e) => {
                warn!(error = %e, "sb_pilot failed to start");
                return PilotOutput::failure("-1", e.to_string());
            }
        };
        if !output.status.success() {
            warn!(status = %output.status, "sb_pilot exited abnormally");
            return PilotOutput::failure("-1", format!("sb_pilot: {}", output.status));
        }
        let Some(text) = read_koi8(&self.install.join("e")) else {
            return PilotOutput::failure("-2", NO_ANSWER);
        };
        let answer: Vec<String> = text.lines().map(str::to_owned).collect();
        let message = read_koi8(&self.install.join("p")).unwrap_or_else(|| NO_RECEIPT.to_string());
        let (status, status_text) = match answer.first() {
            Some(line) => match line.trim().split_once(',') {
                Some((s, t)) => (s.to_owned(), t.to_owned()),
                None => (line.trim().to_owned(), String::new()),
            },
            None => ("-2".to_owned(), NO_ANSWER.to_owned()),
        };
        debug!(%status, "sb_pilot answered");
        PilotOutput {
            status,
            status_text,
            answer,
            message,
        }
    }

    /// End-of-day reconciliation (code 7).
    pub async fn exec_sync(&self) -> PilotOutput {
        self.run(&["7"]).await
    }

    /// Card payment (code 1). The terminal takes minor units scaled by the
    /// `SBERFRAC` environment variable, 100 by default.
    pub async fn exec_acquiring(&self, amount: f64) -> Acquiring {
        let frac: i64 = std::env::var("SBERFRAC")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100);
        let minor = (amount * frac as f64).round() as i64;
        let out = self.run(&["1", &minor.to_string()]).await;
        Acquiring::from_output(out, amount)
    }
}

fn read_koi8(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    let (text, _, _) = KOI8_R.decode(&bytes);
    Some(text.into_owned())
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    if !src.is_dir() {
        warn!(dist = %src.display(), "sb_pilot distribution directory missing");
        return Ok(());
    }
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &to)?;
        } else {
            std::fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o555));
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) {}

#[cfg(unix)]
fn link_device(com: &str, at: &Path) {
    let _ = std::os::unix::fs::symlink(com, at);
}

#[cfg(not(unix))]
fn link_device(_com: &str, _at: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(lines: &[&str]) -> PilotOutput {
        let answer: Vec<String> = lines.iter().map(|s| s.to_string()).collect();
        let (status, status_text) = answer[0].split_once(',').unwrap();
        PilotOutput {
            status: status.to_owned(),
            status_text: status_text.to_owned(),
            answer,
            message: "чек".to_owned(),
        }
    }

    #[test]
    fn acquiring_field_mapping() {
        let out = output(&[
            "0,Одобрено",
            " 4276********1234 ",
            "x",
            "123456",
            "0007",
            "x",
            "x",
            "00123456",
            "20240301120000",
            "https://example",
            "abcdef",
            "x",
            "x",
            "Merchant LLC",
        ]);
        let a = Acquiring::from_output(out, 150.0);
        assert_eq!(a.status, "0");
        assert_eq!(a.card, "4276********1234");
        assert_eq!(a.auth, "123456");
        assert_eq!(a.check, "0007");
        assert_eq!(a.terminal, "00123456");
        assert_eq!(a.time, "2024-03-01T12:00:00");
        assert_eq!(a.merchant, "Merchant LLC");
        assert_eq!(a.amount, 150.0);
    }

    #[test]
    fn rejected_payment_zeroes_amount() {
        let out = output(&["57,Отказ"]);
        let a = Acquiring::from_output(out, 150.0);
        assert_eq!(a.status, "57");
        assert_eq!(a.amount, 0.0);
        assert_eq!(a.card, "");
    }

    #[test]
    fn cancelled_payment_replaces_receipt() {
        let out = output(&["2000,Отмена"]);
        let a = Acquiring::from_output(out, 10.0);
        assert_eq!(a.message, CANCELLED);
    }

    #[test]
    fn garbled_timestamp_falls_back_to_host_clock() {
        let mut out = output(&["0,OK"]);
        out.answer.resize(9, String::new());
        out.answer[8] = "not-a-date".to_owned();
        let a = Acquiring::from_output(out, 1.0);
        // ISO shape, current year
        assert_eq!(a.time.len(), 19);
        assert_eq!(&a.time[4..5], "-");
    }

    #[test]
    fn koi8_status_file_decodes() {
        let dir = std::env::temp_dir().join(format!("atm_ctrl_koi8_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("e");
        // "Нет" in KOI8-R
        std::fs::write(&path, [0xee, 0xc5, 0xd4]).unwrap();
        assert_eq!(read_koi8(&path).unwrap(), "Нет");
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_binary_reports_status_minus_one() {
        let dir = std::env::temp_dir().join(format!("atm_ctrl_pilot_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let pilot = Pilot { install: dir };
        let out = pilot.run(&["7"]).await;
        assert_eq!(out.status, "-1");
    }
}
