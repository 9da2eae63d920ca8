use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::serial::{self, hex, SerialConfig, RECONNECT_DELAY};
use crate::types::{Error, Result};

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
/// Fixed unit id on the link.
pub const ID: u8 = 0x50;

pub const PURGE: u8 = 0x44;
pub const UPPER_DISPENSE: u8 = 0x45;
pub const STATUS: u8 = 0x46;
pub const ROM_VERSION: u8 = 0x47;
pub const LOWER_DISPENSE: u8 = 0x55;
pub const UPPER_AND_LOWER_DISPENSE: u8 = 0x56;
pub const TEST_UPPER_DISPENSE: u8 = 0x76;
pub const TEST_LOWER_DISPENSE: u8 = 0x77;

const LINK_TIMEOUT: Duration = Duration::from_secs(2);
const DATA_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-command note cap; larger requests are chunked by the planner.
const MAX_NOTES_PER_COMMAND: u64 = 50;

pub fn error_label(code: u8) -> &'static str {
    match code {
        0x30 => "Good",
        0x31 => "Normal stop",
        0x32 => "Pickup error",
        0x33 => "JAM at CHK1,2 Sensor",
        0x34 => "Overflow bill",
        0x35 => "JAM at EXIT Sensor or EJT Sensor",
        0x36 => "JAM at DIV Sensor",
        0x37 => "Undefined command",
        0x38 => "Upper Bill-End",
        0x3a => "Counting Error(between CHK3,4 Sensor and DIV Sensor)",
        0x3b => "Note request error",
        0x3c => "Counting Error(between DIV Sensor and EJT Sensor)",
        0x3d => "Counting Error(between EJT Sensor and EXIT Sensor)",
        0x3f => "Reject Tray is not recognized",
        0x40 => "Lower Bill-End",
        0x41 => "Motor Stop",
        0x42 => "JAM at Div Sensor",
        0x43 => "Timeout (From DIV Sensor to EJT Sensor)",
        0x44 => "Over Reject",
        0x45 => "Upper Cassette is not recognized",
        0x46 => "Lower Cassette is not recognized",
        0x47 => "Dispensing timeout",
        0x48 => "JAM at EJT Sensor",
        0x49 => "Diverter solenoid or SOL Sensor error",
        0x4a => "SOL Sensor error",
        0x4c => "JAM at CHK3,4 Sensor",
        0x4e => "Purge error(Jam at Div Sensor)",
        _ => "Unknown",
    }
}

/// `EOT | ID | STX | CMD | data | ETX | BCC`, BCC xoring every prior byte.
fn frame(cmd: u8, data: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(data.len() + 6);
    f.extend_from_slice(&[EOT, ID, STX, cmd]);
    f.extend_from_slice(data);
    f.push(ETX);
    let bcc = f.iter().fold(0u8, |a, &b| a ^ b);
    f.push(bcc);
    f
}

/// Sensor flag word from a STATUS reply, 16 bits little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sensors {
    pub chk1: bool,
    pub chk2: bool,
    pub div1: bool,
    pub div2: bool,
    pub ejt: bool,
    pub exit: bool,
    pub nearend0: bool,
    pub always1: bool,
    pub sol: bool,
    pub cassette0: bool,
    pub cassette1: bool,
    pub chk3: bool,
    pub chk4: bool,
    pub nearend1: bool,
    pub reject: bool,
}

impl Sensors {
    fn parse(bits: u16) -> Sensors {
        Sensors {
            chk1: bits & 1 != 0,
            chk2: bits & 2 != 0,
            div1: bits & 4 != 0,
            div2: bits & 8 != 0,
            ejt: bits & 16 != 0,
            exit: bits & 32 != 0,
            nearend0: bits & 64 != 0,
            always1: bits & 128 != 0,
            sol: bits & 256 != 0,
            cassette0: bits & 512 != 0,
            cassette1: bits & 1024 != 0,
            chk3: bits & 2048 != 0,
            chk4: bits & 4096 != 0,
            nearend1: bits & 8192 != 0,
            reject: bits & 16384 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusReply {
    pub error: u8,
    pub label: &'static str,
    pub ok: bool,
    pub sensors: Sensors,
}

#[derive(Debug, Clone, Copy)]
pub struct DispenseReply {
    /// Notes sensed at the check sensor.
    pub check: u16,
    /// Notes actually delivered through the exit.
    pub exit: u16,
    pub error: u8,
    pub label: &'static str,
    pub nearend: bool,
    pub enough: bool,
    pub reject: u16,
    pub ok: bool,
}

#[derive(Debug, Clone)]
pub enum LcdmReply {
    Status(StatusReply),
    Dispense(DispenseReply),
    Raw(Vec<u8>),
}

/// Outcome of a dispense plan across both cassettes.
#[derive(Debug, Clone)]
pub struct DispenseOutcome {
    pub out: u64,
    pub ok: bool,
    pub errors: Vec<(i32, String)>,
}

fn ascii2(b: &[u8]) -> Result<u16> {
    std::str::from_utf8(b)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::Framing("non-decimal count field"))
}

fn parse_reply(cmd: u8, data: &[u8]) -> Result<LcdmReply> {
    match cmd {
        STATUS => {
            if data.len() < 4 {
                return Err(Error::Framing("short status reply"));
            }
            let code = data[1];
            Ok(LcdmReply::Status(StatusReply {
                error: code,
                label: error_label(code),
                ok: matches!(code, 0x30 | 0x31),
                sensors: Sensors::parse(u16::from_le_bytes([data[2], data[3]])),
            }))
        }
        UPPER_DISPENSE | LOWER_DISPENSE | TEST_UPPER_DISPENSE | TEST_LOWER_DISPENSE => {
            if data.len() < 8 {
                return Err(Error::Framing("short dispense reply"));
            }
            let code = data[5];
            Ok(LcdmReply::Dispense(DispenseReply {
                check: ascii2(&data[0..2])?,
                exit: ascii2(&data[2..4])?,
                error: code,
                label: error_label(code),
                nearend: data[6] == 0x31,
                enough: data[6] == 0x30,
                reject: ascii2(&data[6..8]).unwrap_or(0),
                ok: matches!(code, 0x30 | 0x31),
            }))
        }
        _ => Ok(LcdmReply::Raw(data.to_vec())),
    }
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared {
    writer: AsyncMutex<Option<Writer>>,
    /// Armed while a command waits for its link-level ACK/NAK byte.
    link: StdMutex<Option<oneshot::Sender<bool>>>,
    pending: StdMutex<HashMap<u8, oneshot::Sender<Result<LcdmReply>>>>,
    /// Strict two-phase FIFO: the next command waits for both phases.
    lock: AsyncMutex<()>,
    connected: watch::Sender<bool>,
}

impl Shared {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let w = guard.as_mut().ok_or(Error::NotConnected)?;
        w.write_all(data).await?;
        w.flush().await?;
        Ok(())
    }

    fn clear_slots(&self, cmd: u8) {
        self.link.lock().unwrap().take();
        self.pending.lock().unwrap().remove(&cmd);
    }
}

/// LCDM-2000 two-cassette bill dispenser.
pub struct Lcdm {
    cfg: SerialConfig,
    upper_nominal: u64,
    lower_nominal: u64,
    counters: StdMutex<(u64, u64)>,
    shared: Arc<Shared>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Lcdm {
    pub fn new(cfg: SerialConfig, upper_nominal: u64, lower_nominal: u64) -> Lcdm {
        let (connected, _) = watch::channel(false);
        Lcdm {
            cfg,
            upper_nominal,
            lower_nominal,
            counters: StdMutex::new((0, 0)),
            shared: Arc::new(Shared {
                writer: AsyncMutex::new(None),
                link: StdMutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                lock: AsyncMutex::new(()),
                connected,
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn open(&self) {
        let mut task = self.task.lock().unwrap();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let shared = self.shared.clone();
        let cfg = self.cfg.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                match serial::open(&cfg) {
                    Ok(port) => {
                        info!(port = %cfg.path, "lcdm port open");
                        let (r, w) = tokio::io::split(port);
                        session(shared.clone(), r, Box::new(w)).await;
                    }
                    Err(e) => error!(port = %cfg.path, error = %e, "lcdm open failed"),
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }));
    }

    pub async fn close(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
        self.shared.connected.send_replace(false);
        *self.shared.writer.lock().await = None;
        fail_pending(&self.shared);
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.connected();
        while !*rx.borrow() {
            rx.changed().await.map_err(|_| Error::ConnectionLost)?;
        }
        Ok(())
    }

    /// Record the note counts loaded into the cassettes. Bookkeeping only,
    /// the device itself does not report fill levels.
    pub fn load(&self, upper_count: u64, lower_count: u64) {
        *self.counters.lock().unwrap() = (upper_count, lower_count);
    }

    pub fn counters(&self) -> (u64, u64) {
        *self.counters.lock().unwrap()
    }

    /// Two-phase exchange: link ACK within 2 s, then the data reply within
    /// 60 s (mechanics take their time).
    pub async fn command(&self, cmd: u8, param: &[u8]) -> Result<LcdmReply> {
        if !*self.shared.connected.borrow() {
            return Err(Error::NotConnected);
        }
        let _guard = self.shared.lock.lock().await;

        let (ack_tx, ack_rx) = oneshot::channel();
        let (res_tx, res_rx) = oneshot::channel();
        *self.shared.link.lock().unwrap() = Some(ack_tx);
        {
            let mut pending = self.shared.pending.lock().unwrap();
            // a cancelled caller may leave a dead slot behind; a live one
            // cannot exist while the command lock is held
            debug_assert!(pending.get(&cmd).map_or(true, |tx| tx.is_closed()));
            pending.insert(cmd, res_tx);
        }

        let raw = frame(cmd, param);
        debug!(tx = %hex(&raw), "lcdm");
        if let Err(e) = self.shared.write(&raw).await {
            self.shared.clear_slots(cmd);
            return Err(e);
        }
        match tokio::time::timeout(LINK_TIMEOUT, ack_rx).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                self.shared.clear_slots(cmd);
                return Err(Error::Nak);
            }
            Ok(Err(_)) => {
                self.shared.clear_slots(cmd);
                return Err(Error::ConnectionLost);
            }
            Err(_) => {
                self.shared.clear_slots(cmd);
                return Err(Error::Timeout(LINK_TIMEOUT));
            }
        }
        match tokio::time::timeout(DATA_TIMEOUT, res_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                self.shared.pending.lock().unwrap().remove(&cmd);
                Err(Error::Timeout(DATA_TIMEOUT))
            }
        }
    }

    /// Count parameter goes on the wire as ASCII decimal, width 2,
    /// zero-padded; three digits never fit.
    pub async fn command_count(&self, cmd: u8, count: u8) -> Result<LcdmReply> {
        if count >= 100 {
            return Err(Error::Framing("note count must be below 100"));
        }
        let param = [b'0' + count / 10, b'0' + count % 10];
        self.command(cmd, &param).await
    }

    pub async fn status(&self) -> Result<StatusReply> {
        match self.command(STATUS, &[]).await? {
            LcdmReply::Status(st) => Ok(st),
            _ => Err(Error::Framing("unexpected status reply")),
        }
    }

    pub async fn purge(&self) -> Result<LcdmReply> {
        self.command(PURGE, &[]).await
    }

    pub async fn rom_version(&self) -> Result<LcdmReply> {
        self.command(ROM_VERSION, &[]).await
    }

    pub async fn upper_dispense(&self, count: u8) -> Result<DispenseReply> {
        self.dispense_cmd(UPPER_DISPENSE, count).await
    }

    pub async fn lower_dispense(&self, count: u8) -> Result<DispenseReply> {
        self.dispense_cmd(LOWER_DISPENSE, count).await
    }

    pub async fn test_upper(&self, count: u8) -> Result<DispenseReply> {
        self.dispense_cmd(TEST_UPPER_DISPENSE, count).await
    }

    pub async fn test_lower(&self, count: u8) -> Result<DispenseReply> {
        self.dispense_cmd(TEST_LOWER_DISPENSE, count).await
    }

    async fn dispense_cmd(&self, cmd: u8, count: u8) -> Result<DispenseReply> {
        match self.command_count(cmd, count).await? {
            LcdmReply::Dispense(d) => {
                let mut counters = self.counters.lock().unwrap();
                let slot = if cmd == UPPER_DISPENSE {
                    &mut counters.0
                } else {
                    &mut counters.1
                };
                *slot = slot.saturating_sub(u64::from(d.exit));
                Ok(d)
            }
            _ => Err(Error::Framing("unexpected dispense reply")),
        }
    }

    /// Pay out `amount` using both cassettes, largest nominal first. The
    /// device may emit fewer notes than asked; the reply's exit count drives
    /// the remaining amount. Bill-end codes on one cassette fall through to
    /// the other, anything else stops the plan.
    pub async fn dispense(&self, amount: u64) -> DispenseOutcome {
        let mut amount = amount;
        let mut out = 0u64;
        let mut errors: Vec<(i32, String)> = Vec::new();

        let mut cassettes = [
            (self.upper_nominal, UPPER_DISPENSE),
            (self.lower_nominal, LOWER_DISPENSE),
        ];
        cassettes.sort_by(|a, b| b.0.cmp(&a.0));

        for (nominal, cmd) in cassettes {
            if nominal == 0 {
                continue;
            }
            let mut count = amount / nominal;
            let mut last_error: i32 = 0;
            while count > 0 {
                let to_out = if count > 60 {
                    MAX_NOTES_PER_COMMAND as u8
                } else {
                    count as u8
                };
                match self.dispense_cmd(cmd, to_out).await {
                    Ok(res) => {
                        let exited = u64::from(res.exit);
                        count = count.saturating_sub(exited);
                        out += nominal * exited;
                        amount = amount.saturating_sub(nominal * exited);
                        last_error = i32::from(res.error);
                        if !res.ok {
                            errors.push((last_error, res.label.to_string()));
                            break;
                        }
                        if exited == 0 {
                            // an empty success would spin forever
                            break;
                        }
                    }
                    Err(e) => {
                        last_error = if e.is_transport() { -1 } else { -2 };
                        errors.push((last_error, e.to_string()));
                        break;
                    }
                }
            }
            // bill-end on this cassette is fine, move on to the other one
            if !matches!(last_error, 0 | 0x30 | 0x31 | 0x38 | 0x40) {
                break;
            }
        }
        DispenseOutcome {
            out,
            ok: amount == 0,
            errors,
        }
    }
}

async fn session(shared: Arc<Shared>, reader: impl AsyncRead + Unpin, writer: Writer) {
    *shared.writer.lock().await = Some(writer);
    shared.connected.send_replace(true);
    if let Err(e) = read_loop(&shared, reader).await {
        warn!(error = %e, "lcdm reader stopped");
    }
    shared.connected.send_replace(false);
    *shared.writer.lock().await = None;
    fail_pending(&shared);
}

fn fail_pending(shared: &Shared) {
    if let Some(tx) = shared.link.lock().unwrap().take() {
        let _ = tx.send(false);
    }
    let pending: Vec<_> = {
        let mut map = shared.pending.lock().unwrap();
        map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in pending {
        let _ = tx.send(Err(Error::ConnectionLost));
    }
}

fn resolve_link(shared: &Shared, ok: bool) {
    match shared.link.lock().unwrap().take() {
        Some(tx) => {
            let _ = tx.send(ok);
        }
        None => debug!(ok, "lcdm stray link byte"),
    }
}

async fn read_loop(shared: &Shared, r: impl AsyncRead + Unpin) -> Result<()> {
    let mut r = BufReader::new(r);
    let mut byte = [0u8; 1];
    loop {
        r.read_exact(&mut byte).await?;
        match byte[0] {
            ACK => resolve_link(shared, true),
            NAK => resolve_link(shared, false),
            SOH => {
                let mut head = [0u8; 3]; // ID, STX, CMD
                r.read_exact(&mut head).await?;
                let mut data = Vec::new();
                r.read_until(ETX, &mut data).await?;
                if data.last() != Some(&ETX) {
                    return Err(Error::Framing("frame truncated before ETX"));
                }
                let mut bcc = [0u8; 1];
                r.read_exact(&mut bcc).await?;
                let mut x = SOH ^ head[0] ^ head[1] ^ head[2];
                for &d in &data {
                    x ^= d;
                }
                if bcc[0] != x {
                    debug!("lcdm bcc mismatch, asking for retransmit");
                    shared.write(&[NAK]).await?;
                    continue;
                }
                debug!(cmd = head[2], rx = %hex(&data), "lcdm");
                shared.write(&[ACK]).await?;
                data.pop(); // ETX
                on_reply(shared, head[2], &data);
            }
            other => debug!(byte = other, "lcdm noise byte"),
        }
    }
}

fn on_reply(shared: &Shared, cmd: u8, data: &[u8]) {
    let Some(tx) = shared.pending.lock().unwrap().remove(&cmd) else {
        debug!(cmd, "lcdm unsolicited reply dropped");
        return;
    };
    let _ = tx.send(parse_reply(cmd, data));
}
