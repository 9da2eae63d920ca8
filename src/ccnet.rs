use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crc::{Crc, CRC_16_KERMIT};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::serial::{self, hex, SerialConfig, RECONNECT_DELAY};
use crate::types::{Error, Result};

// CCNET command set
pub const RESET: u8 = 0x30;
pub const STATUS: u8 = 0x31;
pub const SET_SECURITY: u8 = 0x32;
pub const POLL: u8 = 0x33;
pub const SET_BILL_TABLE: u8 = 0x34;
pub const STACK: u8 = 0x35;
pub const RETURN: u8 = 0x36;
pub const IDENTIFICATION: u8 = 0x37;
pub const HOLD: u8 = 0x38;
pub const GET_BILL_TABLE: u8 = 0x41;
// coin-channel variants of the same protocol
pub const COIN_RESET: u8 = 0x08;
pub const COIN_POLL: u8 = 0x0b;
pub const SET_COIN_TYPES: u8 = 0x0c;
pub const GET_COIN_TABLE: u8 = 0x10;

pub const ACK: u8 = 0x00;
pub const NAK: u8 = 0xff;
pub const ILLEGAL: u8 = 0x30;
pub const SYNC: u8 = 0x02;

/// Default peripheral addresses on the CCNET line.
pub const VALIDATOR: u8 = 0x03;
pub const COIN: u8 = 0x02;

pub const STATE_POWER_UP: u8 = 0x10;
pub const STATE_INITIALIZE: u8 = 0x13;
pub const STATE_IDLING: u8 = 0x14;
pub const STATE_HOLDING: u8 = 0x1a;
pub const STATE_ESCROW: u8 = 0x80;
pub const STATE_STACKED: u8 = 0x81;
pub const STATE_RETURNED: u8 = 0x82;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause before each transmission; the validator needs a quiet line.
const SETTLE_DELAY: Duration = Duration::from_millis(100);
const RESET_POLL_DELAY: Duration = Duration::from_secs(1);

/// Slots in a bill table reply.
const BILL_TYPES: usize = 24;

pub fn state_label(code: u8) -> &'static str {
    match code {
        0x10 => "Power Up",
        0x11 => "Power Up with Bill in Validator",
        0x12 => "Power Up with Bill in Stacker",
        0x13 => "Initialize",
        0x14 => "Idling",
        0x15 => "Accepting",
        0x17 => "Stacking",
        0x18 => "Returning",
        0x19 => "Unit Disabled",
        0x1a => "Holding",
        0x1b => "Device Busy",
        0x1c => "Rejecting",
        0x41 => "Drop Cassette Full",
        0x42 => "Drop Cassette out of position",
        0x43 => "Validator Jammed",
        0x44 => "Drop Cassette Jammed",
        0x45 => "Cheated",
        0x46 => "Pause",
        0x47 => "Failed",
        0x80 => "Escrow position",
        0x81 => "Bill stacked",
        0x82 => "Bill returned",
        _ => "Unknown",
    }
}

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_KERMIT);

/// CRC over the frame so far, appended little-endian (poly 0x8408 reflected,
/// zero init).
fn crc16(data: &[u8]) -> [u8; 2] {
    CRC.checksum(data).to_le_bytes()
}

/// `SYNC | ADR | LEN | CMD | param | CRC16`, LEN counting the whole frame.
fn frame(cmd: u8, param: &[u8], adr: u8) -> Vec<u8> {
    let len = param.len() + 6;
    let mut data = Vec::with_capacity(len);
    data.extend_from_slice(&[SYNC, adr, len as u8, cmd]);
    data.extend_from_slice(param);
    let crc = crc16(&data);
    data.extend_from_slice(&crc);
    data
}

/// One bill-table slot as it appears on the wire: denomination is
/// `base * 10^exp`, exponent byte two's-complement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bill {
    pub base: u8,
    pub country: [u8; 3],
    pub exp: i8,
}

impl Bill {
    fn decode(raw: &[u8]) -> Bill {
        Bill {
            base: raw[0],
            country: [raw[1], raw[2], raw[3]],
            exp: raw[4] as i8,
        }
    }

    pub fn encode(&self) -> [u8; 5] {
        [
            self.base,
            self.country[0],
            self.country[1],
            self.country[2],
            self.exp as u8,
        ]
    }

    pub fn value(&self) -> f64 {
        f64::from(self.base) * 10f64.powi(i32::from(self.exp))
    }

    pub fn country(&self) -> &str {
        crate::types::country_str(&self.country)
    }

    /// Unused table slots come back zero-filled.
    pub fn is_empty(&self) -> bool {
        self.base == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollStatus {
    pub state: u8,
    pub param: u8,
    pub credit: Option<Bill>,
}

#[derive(Debug, Clone)]
pub enum Reply {
    Ack,
    Poll(PollStatus),
    Status {
        bill_types: [u8; 3],
        security: [u8; 3],
    },
    BillTable(Vec<Bill>),
    Raw(Vec<u8>),
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Slot = (u8, oneshot::Sender<Result<Reply>>);

struct Shared {
    writer: AsyncMutex<Option<Writer>>,
    /// At most one outstanding request per peripheral address.
    pending: StdMutex<HashMap<u8, Slot>>,
    /// Per-address locks serializing callers so a live slot is never replaced.
    lanes: StdMutex<HashMap<u8, Arc<AsyncMutex<()>>>>,
    /// Last polled (state, parameter) per address.
    state: StdMutex<HashMap<u8, (u8, u8)>>,
    nominals: StdMutex<HashMap<u8, Vec<Bill>>>,
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
}

/// CCNET bill validator (and coin changer) on one serial line.
pub struct Ccnet {
    cfg: SerialConfig,
    adr: u8,
    shared: Arc<Shared>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl Ccnet {
    pub fn new(cfg: SerialConfig, adr: u8) -> Ccnet {
        let (connected, _) = watch::channel(false);
        Ccnet {
            cfg,
            adr,
            shared: Arc::new(Shared {
                writer: AsyncMutex::new(None),
                pending: StdMutex::new(HashMap::new()),
                lanes: StdMutex::new(HashMap::new()),
                state: StdMutex::new(HashMap::new()),
                nominals: StdMutex::new(HashMap::new()),
                connected,
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn address(&self) -> u8 {
        self.adr
    }

    /// Spawn the supervisor owning the port: open, run the reader until an
    /// I/O fault, then reopen after a delay. Repeated calls are no-ops while
    /// a supervisor is alive, so concurrent opens coalesce.
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
                        info!(port = %cfg.path, "ccnet port open");
                        let (r, w) = tokio::io::split(port);
                        session(shared.clone(), r, Box::new(w)).await;
                    }
                    Err(e) => error!(port = %cfg.path, error = %e, "ccnet open failed"),
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

    pub fn last_state(&self, adr: u8) -> Option<(u8, u8)> {
        self.shared.state.lock().unwrap().get(&adr).copied()
    }

    pub fn nominals(&self, adr: u8) -> Option<Vec<Bill>> {
        self.shared.nominals.lock().unwrap().get(&adr).cloned()
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        tokio::time::sleep(SETTLE_DELAY).await;
        debug!(tx = %hex(data), "ccnet");
        self.shared.write(data).await
    }

    /// Send a command and wait for the matching reply on this address.
    pub async fn command(&self, cmd: u8, param: &[u8], adr: u8) -> Result<Reply> {
        if !*self.shared.connected.borrow() {
            return Err(Error::NotConnected);
        }
        let lane = {
            let mut lanes = self.shared.lanes.lock().unwrap();
            lanes
                .entry(adr)
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let _guard = lane.lock().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            // a cancelled caller may leave a dead slot behind; a live one
            // cannot exist while the lane lock is held
            debug_assert!(pending.get(&adr).map_or(true, |(_, tx)| tx.is_closed()));
            pending.insert(adr, (cmd, tx));
        }

        if let Err(e) = self.send(&frame(cmd, param, adr)).await {
            self.shared.pending.lock().unwrap().remove(&adr);
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                // late arrivals find no slot and are dropped
                self.shared.pending.lock().unwrap().remove(&adr);
                Err(Error::Timeout(REQUEST_TIMEOUT))
            }
        }
    }

    /// Fire-and-forget command; RESET acknowledgements are not awaited.
    pub async fn command_void(&self, cmd: u8, param: &[u8], adr: u8) -> Result<()> {
        if !*self.shared.connected.borrow() {
            return Err(Error::NotConnected);
        }
        self.send(&frame(cmd, param, adr)).await
    }

    pub async fn enable(&self, adr: u8) -> Result<Reply> {
        if adr == COIN {
            self.command(SET_COIN_TYPES, &[0xff; 6], adr).await
        } else {
            self.command(SET_BILL_TABLE, &[0xff; 6], adr).await
        }
    }

    pub async fn enable_coin(&self, adr: u8) -> Result<Reply> {
        self.command(SET_COIN_TYPES, &[0xff; 6], adr).await
    }

    pub async fn disable(&self, adr: u8) -> Result<Reply> {
        if adr == COIN {
            self.command(SET_COIN_TYPES, &[0x00; 6], adr).await
        } else {
            self.command(SET_BILL_TABLE, &[0x00; 6], adr).await
        }
    }

    pub async fn poll(&self, adr: u8) -> Result<PollStatus> {
        let cmd = if adr == COIN { COIN_POLL } else { POLL };
        match self.command(cmd, &[], adr).await? {
            Reply::Poll(st) => Ok(st),
            _ => Err(Error::Framing("unexpected poll reply")),
        }
    }

    /// Reset the unit, wait for it to leave the power-up band, then fetch
    /// the denomination table.
    pub async fn reset(&self, adr: u8) -> Result<Vec<Bill>> {
        // state is unknown until the first poll answers
        self.shared.state.lock().unwrap().insert(adr, (0x00, 0));
        let cmd = if adr == COIN { COIN_RESET } else { RESET };
        self.command_void(cmd, &[], adr).await?;
        loop {
            let state = self.last_state(adr).map(|(s, _)| s).unwrap_or(0x00);
            if !matches!(state, 0x00 | STATE_POWER_UP..=STATE_INITIALIZE) {
                break;
            }
            tokio::time::sleep(RESET_POLL_DELAY).await;
            self.poll(adr).await?;
        }
        let cmd = if adr == COIN {
            GET_COIN_TABLE
        } else {
            GET_BILL_TABLE
        };
        match self.command(cmd, &[], adr).await? {
            Reply::BillTable(table) => Ok(table),
            _ => Err(Error::Framing("unexpected bill table reply")),
        }
    }

    pub async fn status(&self, adr: u8) -> Result<Reply> {
        self.command(STATUS, &[], adr).await
    }

    pub async fn identification(&self, adr: u8) -> Result<Reply> {
        self.command(IDENTIFICATION, &[], adr).await
    }

    pub async fn set_security(&self, levels: &[u8; 3], adr: u8) -> Result<Reply> {
        self.command(SET_SECURITY, levels, adr).await
    }

    pub async fn return_bill(&self, adr: u8) -> Result<Reply> {
        self.command(RETURN, &[], adr).await
    }

    pub async fn hold(&self, adr: u8) -> Result<Reply> {
        self.command(HOLD, &[], adr).await
    }

    /// Poll until the state byte is one of `states`. Fault states the unit
    /// cannot leave on its own abort the wait instead of spinning on it.
    pub async fn wait_state(&self, states: &[u8], adr: u8) -> Result<PollStatus> {
        loop {
            let st = self.poll(adr).await?;
            if states.contains(&st.state) {
                return Ok(st);
            }
            if matches!(st.state, 0x41..=0x45 | 0x47) {
                return Err(Error::Device {
                    code: st.state,
                    label: state_label(st.state),
                });
            }
        }
    }

    /// Accept one bill: wait for escrow, commit it to the cashbox, report
    /// the credited nominal.
    pub async fn stack_one(&self, adr: u8) -> Result<PollStatus> {
        let mut resp = self
            .wait_state(&[STATE_ESCROW, STATE_HOLDING, STATE_STACKED], adr)
            .await?;
        if resp.credit.is_some() && matches!(resp.state, STATE_ESCROW | STATE_HOLDING) {
            self.command(STACK, &[], adr).await?;
            resp = self.wait_state(&[STATE_STACKED], adr).await?;
        }
        Ok(resp)
    }
}

/// One port lifetime: publish the writer, pump the reader until it fails,
/// then tear down and fail whatever was in flight.
async fn session(shared: Arc<Shared>, reader: impl AsyncRead + Unpin, writer: Writer) {
    *shared.writer.lock().await = Some(writer);
    shared.connected.send_replace(true);
    if let Err(e) = read_loop(&shared, reader).await {
        warn!(error = %e, "ccnet reader stopped");
    }
    shared.connected.send_replace(false);
    *shared.writer.lock().await = None;
    fail_pending(&shared);
}

fn fail_pending(shared: &Shared) {
    let pending: Vec<Slot> = {
        let mut map = shared.pending.lock().unwrap();
        map.drain().map(|(_, slot)| slot).collect()
    };
    for (_, tx) in pending {
        let _ = tx.send(Err(Error::ConnectionLost));
    }
}

async fn read_loop(shared: &Shared, mut r: impl AsyncRead + Unpin) -> Result<()> {
    let mut sync = [0u8; 1];
    loop {
        r.read_exact(&mut sync).await?;
        if sync[0] != SYNC {
            debug!(byte = sync[0], "ccnet noise byte");
            continue;
        }
        let mut head = [0u8; 2];
        r.read_exact(&mut head).await?;
        let (adr, len) = (head[0], usize::from(head[1]));
        if len < 6 {
            // LEN 0 announces the extended-length format, which no device
            // on this line speaks
            warn!(len, "ccnet frame with unsupported length");
            continue;
        }
        let mut rest = vec![0u8; len - 3];
        r.read_exact(&mut rest).await?;
        let mut raw = Vec::with_capacity(len);
        raw.push(SYNC);
        raw.extend_from_slice(&head);
        raw.extend_from_slice(&rest);
        let crc = crc16(&raw[..len - 2]);
        if raw[len - 2..] != crc {
            // no negative acknowledge on the wire, the peer repolls
            debug!(rx = %hex(&raw), "ccnet crc mismatch, frame dropped");
            continue;
        }
        debug!(rx = %hex(&raw), "ccnet");
        on_reply(shared, adr, &raw).await?;
    }
}

async fn on_reply(shared: &Shared, adr: u8, raw: &[u8]) -> Result<()> {
    let data = &raw[3..raw.len() - 2];

    let single = if data.len() == 1 { Some(data[0]) } else { None };
    if !matches!(single, Some(ACK) | Some(NAK) | Some(ILLEGAL)) {
        // data frame: confirm reception so the peer does not retransmit
        let mut ack = vec![SYNC, adr, 6, 0x00];
        let crc = crc16(&ack);
        ack.extend_from_slice(&crc);
        debug!(tx = %hex(&ack), "ccnet host ack");
        shared.write(&ack).await?;
    }

    let slot = shared.pending.lock().unwrap().remove(&adr);
    let Some((cmd, tx)) = slot else {
        debug!(adr, "ccnet unsolicited frame dropped");
        return Ok(());
    };

    let result = match single {
        Some(ACK) => Ok(Reply::Ack),
        Some(NAK) => Err(Error::Nak),
        Some(ILLEGAL) => Err(Error::Illegal),
        _ => parse_reply(shared, adr, cmd, data),
    };
    // the caller may have timed out and dropped its receiver
    let _ = tx.send(result);
    Ok(())
}

fn parse_reply(shared: &Shared, adr: u8, cmd: u8, data: &[u8]) -> Result<Reply> {
    match cmd {
        POLL | COIN_POLL => {
            let state = data.first().copied().unwrap_or(0x00);
            let param = data.get(1).copied().unwrap_or(0x00);
            shared.state.lock().unwrap().insert(adr, (state, param));
            let credit = if matches!(state, STATE_ESCROW | STATE_RETURNED | STATE_STACKED) {
                shared
                    .nominals
                    .lock()
                    .unwrap()
                    .get(&adr)
                    .and_then(|t| t.get(usize::from(param)))
                    .copied()
            } else {
                None
            };
            Ok(Reply::Poll(PollStatus {
                state,
                param,
                credit,
            }))
        }
        STATUS => {
            if data.len() < 6 {
                return Err(Error::Framing("short status reply"));
            }
            Ok(Reply::Status {
                bill_types: [data[0], data[1], data[2]],
                security: [data[3], data[4], data[5]],
            })
        }
        GET_BILL_TABLE | GET_COIN_TABLE => {
            let table = parse_bill_table(data)?;
            shared
                .nominals
                .lock()
                .unwrap()
                .insert(adr, table.clone());
            Ok(Reply::BillTable(table))
        }
        _ => Ok(Reply::Raw(data.to_vec())),
    }
}

fn parse_bill_table(data: &[u8]) -> Result<Vec<Bill>> {
    if data.len() < BILL_TYPES * 5 {
        return Err(Error::Framing("short bill table"));
    }
    Ok((0..BILL_TYPES)
        .map(|i| Bill::decode(&data[i * 5..i * 5 + 5]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn driver() -> Ccnet {
        Ccnet::new(SerialConfig::new("/dev/null", 19200), VALIDATOR)
    }

    /// Wire the driver to an in-memory pipe; returns the device side.
    async fn attach(cc: &Ccnet) -> DuplexStream {
        let (host, dev) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(host);
        let shared = cc.shared.clone();
        tokio::spawn(async move { session(shared, r, Box::new(w)).await });
        cc.wait_connected().await.unwrap();
        dev
    }

    async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Vec<u8> {
        let mut head = [0u8; 3];
        r.read_exact(&mut head).await.unwrap();
        assert_eq!(head[0], SYNC);
        let len = usize::from(head[2]);
        let mut rest = vec![0u8; len - 3];
        r.read_exact(&mut rest).await.unwrap();
        let mut raw = head.to_vec();
        raw.extend_from_slice(&rest);
        raw
    }

    fn dev_reply(adr: u8, data: &[u8]) -> Vec<u8> {
        let len = data.len() + 5;
        let mut raw = vec![SYNC, adr, len as u8];
        raw.extend_from_slice(data);
        let crc = crc16(&raw);
        raw.extend_from_slice(&crc);
        raw
    }

    fn bill(base: u8, exp: i8) -> Bill {
        Bill {
            base,
            country: *b"RUS",
            exp,
        }
    }

    /// Reference bit-by-bit implementation of the validator's CRC.
    fn reference_crc(data: &[u8]) -> [u8; 2] {
        let mut crc: u16 = 0;
        for &b in data {
            crc ^= u16::from(b);
            for _ in 0..8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0x8408;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc.to_le_bytes()
    }

    #[test]
    fn crc_matches_reference() {
        for sample in [
            &[0x02u8, 0x03, 0x06, 0x33][..],
            &[0x02, 0x03, 0x0c, 0x34, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
            &[],
            &[0x00],
        ] {
            assert_eq!(crc16(sample), reference_crc(sample));
        }
    }

    #[test]
    fn parameterless_frame_is_len_6() {
        let f = frame(POLL, &[], VALIDATOR);
        assert_eq!(f.len(), 6);
        assert_eq!(&f[..4], &[SYNC, VALIDATOR, 0x06, POLL]);
        assert_eq!(&f[4..], &crc16(&f[..4]));
    }

    #[test]
    fn bill_decode_round_trip() {
        let raw = [0x05, b'R', b'U', b'S', 0x03];
        let b = Bill::decode(&raw);
        assert_eq!(b.value(), 5000.0);
        assert_eq!(b.country(), "RUS");
        assert_eq!(b.encode(), raw);

        // exponent byte above 127 is negative
        let raw = [0x01, b'E', b'U', b'R', 0x81];
        let b = Bill::decode(&raw);
        assert_eq!(b.exp, -127);
        assert_eq!(b.encode(), raw);

        let raw = [0x0a, b'R', b'U', b'S', 0xfe];
        let b = Bill::decode(&raw);
        assert_eq!(b.exp, -2);
        assert_eq!(b.value(), 0.1);
    }

    #[test]
    fn short_bill_table_rejected() {
        assert!(matches!(
            parse_bill_table(&[0u8; 60]),
            Err(Error::Framing(_))
        ));
    }

    #[tokio::test]
    async fn enable_round_trip() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let f = read_frame(&mut dev).await;
            assert_eq!(
                &f[..10],
                &[SYNC, VALIDATOR, 0x0c, SET_BILL_TABLE, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]
            );
            assert_eq!(&f[10..], &crc16(&f[..10]));
            dev.write_all(&dev_reply(VALIDATOR, &[ACK])).await.unwrap();
        };
        let (res, ()) = tokio::join!(cc.enable(VALIDATOR), dev_task);
        assert!(matches!(res, Ok(Reply::Ack)));
    }

    #[tokio::test]
    async fn coin_address_selects_coin_opcode() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let f = read_frame(&mut dev).await;
            assert_eq!(f[3], SET_COIN_TYPES);
            dev.write_all(&dev_reply(COIN, &[ACK])).await.unwrap();
        };
        let (res, ()) = tokio::join!(cc.enable(COIN), dev_task);
        assert!(matches!(res, Ok(Reply::Ack)));
    }

    #[tokio::test]
    async fn nak_is_terminal() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let _ = read_frame(&mut dev).await;
            dev.write_all(&dev_reply(VALIDATOR, &[NAK])).await.unwrap();
        };
        let (res, ()) = tokio::join!(cc.disable(VALIDATOR), dev_task);
        assert!(matches!(res, Err(Error::Nak)));
    }

    #[tokio::test]
    async fn bill_accept_lifecycle() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let mut table = vec![bill(0, 0); BILL_TYPES];
        table[3] = bill(10, 2); // 1000 RUS
        cc.shared
            .nominals
            .lock()
            .unwrap()
            .insert(VALIDATOR, table);

        let dev_task = async {
            // poll answers escrow on slot 3
            let f = read_frame(&mut dev).await;
            assert_eq!(f[3], POLL);
            dev.write_all(&dev_reply(VALIDATOR, &[STATE_ESCROW, 0x03]))
                .await
                .unwrap();
            let ack = read_frame(&mut dev).await;
            assert_eq!(ack[3], 0x00);
            // the host commits the bill
            let f = read_frame(&mut dev).await;
            assert_eq!(f[3], STACK);
            dev.write_all(&dev_reply(VALIDATOR, &[ACK])).await.unwrap();
            // next poll reports stacked
            let f = read_frame(&mut dev).await;
            assert_eq!(f[3], POLL);
            dev.write_all(&dev_reply(VALIDATOR, &[STATE_STACKED, 0x03]))
                .await
                .unwrap();
            let ack = read_frame(&mut dev).await;
            assert_eq!(ack[3], 0x00);
        };
        let (res, ()) = tokio::join!(cc.stack_one(VALIDATOR), dev_task);
        let st = res.unwrap();
        assert_eq!(st.state, STATE_STACKED);
        assert_eq!(st.credit.unwrap().value(), 1000.0);
    }

    #[tokio::test(start_paused = true)]
    async fn crc_mismatch_drops_frame() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let _ = read_frame(&mut dev).await;
            let mut bad = dev_reply(VALIDATOR, &[STATE_IDLING, 0x00]);
            let n = bad.len();
            bad[n - 1] ^= 0xff;
            dev.write_all(&bad).await.unwrap();
        };
        let (res, ()) = tokio::join!(cc.poll(VALIDATOR), dev_task);
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_polls_then_fetches_table() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let f = read_frame(&mut dev).await;
            assert_eq!(f[3], RESET);
            // first poll still initializing, second idling
            for state in [STATE_INITIALIZE, STATE_IDLING] {
                let f = read_frame(&mut dev).await;
                assert_eq!(f[3], POLL);
                dev.write_all(&dev_reply(VALIDATOR, &[state, 0x00]))
                    .await
                    .unwrap();
                let _ack = read_frame(&mut dev).await;
            }
            let f = read_frame(&mut dev).await;
            assert_eq!(f[3], GET_BILL_TABLE);
            let mut data = vec![0u8; BILL_TYPES * 5];
            data[..5].copy_from_slice(&bill(10, 2).encode());
            dev.write_all(&dev_reply(VALIDATOR, &data)).await.unwrap();
            let _ack = read_frame(&mut dev).await;
        };
        let (res, ()) = tokio::join!(cc.reset(VALIDATOR), dev_task);
        let table = res.unwrap();
        assert_eq!(table.len(), BILL_TYPES);
        assert_eq!(table[0].value(), 1000.0);
        assert!(table[1].is_empty());
        assert_eq!(cc.nominals(VALIDATOR).unwrap()[0], bill(10, 2));
    }

    #[tokio::test]
    async fn jammed_unit_aborts_wait() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let _ = read_frame(&mut dev).await;
            dev.write_all(&dev_reply(VALIDATOR, &[0x43, 0x00]))
                .await
                .unwrap();
            let _ack = read_frame(&mut dev).await;
        };
        let (res, ()) = tokio::join!(cc.stack_one(VALIDATOR), dev_task);
        assert!(matches!(res, Err(Error::Device { code: 0x43, .. })));
    }

    #[tokio::test]
    async fn transport_loss_fails_pending() {
        let cc = driver();
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let _ = read_frame(&mut dev).await;
            drop(dev);
        };
        let (res, ()) = tokio::join!(cc.poll(VALIDATOR), dev_task);
        assert!(matches!(res, Err(Error::ConnectionLost)));
        assert!(!*cc.connected().borrow());

        // a fresh session serves new requests
        let mut dev = attach(&cc).await;
        let dev_task = async {
            let f = read_frame(&mut dev).await;
            assert_eq!(f[3], POLL);
            dev.write_all(&dev_reply(VALIDATOR, &[STATE_IDLING, 0x00]))
                .await
                .unwrap();
            let _ack = read_frame(&mut dev).await;
        };
        let (res, ()) = tokio::join!(cc.poll(VALIDATOR), dev_task);
        assert_eq!(res.unwrap().state, STATE_IDLING);
    }
}
