use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crc::{Crc, CRC_16_XMODEM};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::serial::{self, hex, SerialConfig, RECONNECT_DELAY};
use crate::types::{Error, Result};

/// ccTalk header opcodes. The hosts on this bus only ever issue a dozen of
/// these, but the catalogue is the protocol's vocabulary.
#[allow(dead_code)]
pub mod header {
    pub const RESET_DEVICE: u8 = 1;
    pub const REQUEST_COMMS_REVISION: u8 = 4;
    pub const SET_ROUTING: u8 = 20;
    pub const GET_ROUTING: u8 = 21;
    pub const PAYOUT_AMOUNT: u8 = 22;
    pub const FLOAT_AMOUNT: u8 = 23;
    pub const EMPTY: u8 = 24;
    pub const GET_MINIMUM_PAYOUT: u8 = 25;
    pub const GET_DENOMINATION_AMOUNT: u8 = 26;
    pub const SET_DENOMINATION_AMOUNT: u8 = 27;
    pub const GET_DEVICE_SETUP: u8 = 28;
    pub const REQUEST_STATUS: u8 = 29;
    pub const SET_PAYOUT_OPTIONS: u8 = 30;
    pub const GET_PAYOUT_OPTIONS: u8 = 31;
    pub const PAYOUT_BY_DENOMINATION: u8 = 32;
    pub const FLOAT_BY_DENOMINATION: u8 = 33;
    pub const RUN_UNIT_CALIBRATION: u8 = 34;
    pub const SET_BEZEL_MODE: u8 = 35;
    pub const SET_ROUTE_C: u8 = 37;
    pub const GET_ROUTING_C: u8 = 38;
    pub const PAYOUT_AMOUNT_C: u8 = 39;
    pub const FLOAT_AMOUNT_C: u8 = 40;
    pub const GET_MINIMUM_PAYOUT_C: u8 = 41;
    pub const GET_DENOMINATION_AMOUNT_C: u8 = 42;
    pub const SET_DENOMINATION_AMOUNT_C: u8 = 43;
    pub const PAYOUT_BY_DENOMINATION_C: u8 = 44;
    pub const FLOAT_BY_DENOMINATION_C: u8 = 45;
    pub const GET_DEVICE_SETUP_C: u8 = 46;
    pub const REQUEST_STATUS_C: u8 = 47;
    pub const SET_PERIPHERAL_DEVICE_MASTER_INHIBIT: u8 = 48;
    pub const GET_PERIPHERAL_DEVICE_MASTER_INHIBIT: u8 = 49;
    pub const SET_INHIBIT_PERIPHERAL_DEVICE_VALUE: u8 = 50;
    pub const SMART_EMPTY: u8 = 51;
    pub const GET_CASHBOX_OPERATION_DATA: u8 = 52;
    pub const GET_INHIBIT_PERIPHERAL_DEVICE_VALUE: u8 = 53;
    pub const REQUEST_ENCRYPTED_STATUS: u8 = 109;
    pub const SWITCH_DES_KEY: u8 = 110;
    pub const REQUEST_ENCRYPTION_SUPPORT: u8 = 111;
    pub const READ_BARCODE_DATA: u8 = 129;
    pub const STORE_ENCRYPTION_CODE: u8 = 136;
    pub const SWITCH_ENCRYPTION_CODE: u8 = 137;
    pub const REQUEST_CURRENCY_REVISION: u8 = 145;
    pub const REQUEST_BILL_OPERATING_MODE: u8 = 152;
    pub const MODIFY_BILL_OPERATING_MODE: u8 = 153;
    pub const ROUTE_BILL: u8 = 154;
    pub const REQUEST_BILL_POSITION: u8 = 155;
    pub const REQUEST_COUNTRY_SCALING_FACTOR: u8 = 156;
    pub const REQUEST_BILL_ID: u8 = 157;
    pub const READ_BUFFERED_BILL_EVENTS: u8 = 159;
    pub const REQUEST_CIPHER_KEY: u8 = 160;
    pub const PUMP_RNG: u8 = 161;
    pub const REQUEST_ADDRESS_MODE: u8 = 169;
    pub const REQUEST_BUILD_CODE: u8 = 192;
    pub const REQUEST_LAST_MOD_DATE: u8 = 195;
    pub const REQUEST_DATA_STORAGE_CAPABILITY: u8 = 216;
    pub const GET_MASTER_INHIBIT_STATUS: u8 = 227;
    pub const SET_MASTER_INHIBIT_STATUS: u8 = 228;
    pub const READ_BUFFERED_CREDIT: u8 = 229;
    pub const REQUEST_NOTE_CHANNEL_INHIBITS: u8 = 230;
    pub const SET_NOTE_INHIBIT_CHANNELS: u8 = 231;
    pub const REQUEST_SOFTWARE_REVISION: u8 = 241;
    pub const REQUEST_SERIAL_NUMBER: u8 = 242;
    pub const REQUEST_PRODUCT_CODE: u8 = 244;
    pub const REQUEST_EQUIPMENT_CATEGORY_ID: u8 = 245;
    pub const REQUEST_MANUFACTURER_ID: u8 = 246;
    pub const REQUEST_POLLING_PRIORITY: u8 = 249;
    pub const ADDRESS_RANDOM: u8 = 250;
    pub const ADDRESS_CHANGE: u8 = 251;
    pub const ADDRESS_CLASH: u8 = 252;
    pub const ADDRESS_POLL: u8 = 253;
    pub const SIMPLE_POLL: u8 = 254;
}

/// Identification opcodes queried during `init`.
const IDENT_HEADERS: [u8; 5] = [
    header::REQUEST_MANUFACTURER_ID,
    header::REQUEST_EQUIPMENT_CATEGORY_ID,
    header::REQUEST_PRODUCT_CODE,
    header::REQUEST_SERIAL_NUMBER,
    header::REQUEST_SOFTWARE_REVISION,
];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const CREDIT_POLL_DELAY: Duration = Duration::from_millis(500);

/// A coin or note denomination in hundredths, signed (payouts are negative
/// in `Dispensed` records).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denomination {
    pub value: i64,
    pub country: [u8; 3],
    /// Event code the record arrived under, 0 for setup data.
    pub code: u8,
}

impl Denomination {
    pub fn amount(&self) -> f64 {
        self.value as f64 / 100.0
    }

    pub fn country(&self) -> &str {
        crate::types::country_str(&self.country)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusEvent {
    pub code: u8,
    pub label: &'static str,
}

/// One buffered credit event (header 229).
#[derive(Debug, Clone, Copy)]
pub struct CreditEvent {
    pub slot: u8,
    pub route: u8,
    pub denom: Option<Denomination>,
}

#[derive(Debug, Default, Clone)]
pub struct CcReply {
    pub adr: u8,
    pub cmd: u8,
    pub raw: Vec<u8>,
    pub status: Vec<StatusEvent>,
    pub processing: Vec<Denomination>,
    pub credit: Vec<Denomination>,
    pub events: Vec<CreditEvent>,
}

#[derive(Debug, Default)]
struct StatusC {
    status: Vec<StatusEvent>,
    processing: Vec<Denomination>,
    credit: Vec<Denomination>,
}

/// `DEST | LEN | SRC | HDR | data | CK`, CK completing the sum to 0 mod 256.
fn frame(dest: u8, host: u8, hdr: u8, data: &[u8]) -> Vec<u8> {
    let mut f = Vec::with_capacity(data.len() + 5);
    f.extend_from_slice(&[dest, data.len() as u8, host, hdr]);
    f.extend_from_slice(data);
    let sum = f.iter().fold(0u8, |a, &b| a.wrapping_add(b));
    f.push(sum.wrapping_neg());
    f
}

fn checksum_ok(raw: &[u8]) -> bool {
    raw.iter().fold(0u8, |a, &b| a.wrapping_add(b)) == 0
}

const CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Encrypted-capable peripherals answer with CRC-CCITT instead of the simple
/// sum: low byte in the SRC slot, high byte in the checksum slot. Recognized
/// on read, never emitted.
fn crc_variant_ok(raw: &[u8]) -> bool {
    if raw.len() < 5 {
        return false;
    }
    let mut buf = Vec::with_capacity(raw.len() - 2);
    buf.extend_from_slice(&[raw[0], raw[1], raw[3]]);
    buf.extend_from_slice(&raw[4..raw.len() - 1]);
    let c = CRC_CCITT.checksum(&buf);
    raw[2] == (c & 0xff) as u8 && raw[raw.len() - 1] == (c >> 8) as u8
}

fn denom(rec: &[u8], sign: i64, code: u8) -> Denomination {
    let v = u32::from_le_bytes([rec[0], rec[1], rec[2], rec[3]]);
    Denomination {
        value: sign * i64::from(v),
        country: [rec[4], rec[5], rec[6]],
        code,
    }
}

/// Number of fresh entries in a buffered-event reply. The counter runs
/// 1..=255 and skips zero when it wraps; zero means the slave reset and the
/// buffer is void.
fn new_events(last: u8, counter: u8) -> usize {
    if counter == 0 {
        0
    } else if counter < last {
        usize::from(255 - last) + usize::from(counter)
    } else {
        usize::from(counter - last)
    }
}

impl StatusC {
    fn push_status(&mut self, code: u8, label: &'static str) {
        self.status.push(StatusEvent { code, label });
    }
}

fn parse_denoms(
    rest: &[u8],
    label: &'static str,
    sign: i64,
    out: &mut StatusC,
    credit: bool,
) -> Result<usize> {
    if rest.len() < 2 {
        return Err(Error::Framing("truncated event record"));
    }
    let n = usize::from(rest[1]);
    let consumed = 2 + n * 7;
    if rest.len() < consumed {
        return Err(Error::Framing("truncated event record"));
    }
    out.push_status(rest[0], label);
    let sink = if credit {
        &mut out.credit
    } else {
        &mut out.processing
    };
    for k in 0..n {
        sink.push(denom(&rest[2 + k * 7..2 + k * 7 + 7], sign, rest[0]));
    }
    Ok(consumed)
}

/// Walk a Request_Status_c reply: concatenated event records, each advancing
/// the cursor by its own size.
fn parse_status_c(data: &[u8]) -> Result<StatusC> {
    let mut out = StatusC::default();
    let mut i = 0;
    while i < data.len() {
        let code = data[i];
        let rest = &data[i..];
        let consumed = match code {
            0x00 => {
                out.push_status(code, "Idle");
                1
            }
            0x01 => parse_denoms(rest, "Dispensing", 1, &mut out, false)?,
            0x02 => parse_denoms(rest, "Dispensed", -1, &mut out, true)?,
            0x03 => {
                out.push_status(code, "Coins Low");
                1
            }
            0x04 => {
                out.push_status(code, "Empty");
                1
            }
            0x05 => parse_denoms(rest, "Jammed", 1, &mut out, false)?,
            0x06 => parse_denoms(rest, "Halted", 1, &mut out, false)?,
            0x07 => parse_denoms(rest, "Floating", 1, &mut out, false)?,
            0x08 => parse_denoms(rest, "Floated", 1, &mut out, false)?,
            0x09 => parse_denoms(rest, "Timeout", 1, &mut out, false)?,
            0x0a => parse_denoms(rest, "Incomplete payout", 1, &mut out, false)?,
            0x0b => parse_denoms(rest, "Incomplete float", 1, &mut out, false)?,
            0x0c => parse_denoms(rest, "Cashbox paid", 1, &mut out, true)?,
            0x0d => {
                if rest.len() < 8 {
                    return Err(Error::Framing("truncated coin credit record"));
                }
                out.credit.push(denom(&rest[1..8], 1, code));
                8
            }
            0x11 => {
                out.push_status(code, "Disabled");
                1
            }
            0x13 => {
                out.push_status(code, "Slave reset");
                1
            }
            0x24 => {
                out.push_status(code, "Calibration fault");
                2
            }
            _ => return Err(Error::Framing("unknown status event code")),
        };
        i += consumed;
    }
    Ok(out)
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;
type Slot = (u8, oneshot::Sender<Result<CcReply>>);

struct Shared {
    host: u8,
    writer: AsyncMutex<Option<Writer>>,
    /// Half-duplex bus: at most one outstanding request across all addresses.
    bus: AsyncMutex<()>,
    pending: StdMutex<Option<Slot>>,
    event_counters: StdMutex<HashMap<u8, u8>>,
    coins: StdMutex<HashMap<u8, HashMap<u8, Denomination>>>,
    device_infos: StdMutex<HashMap<u8, HashMap<u8, Vec<u8>>>>,
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

/// ccTalk bus master. Host address 1, peripherals per config.
pub struct CcTalk {
    cfg: SerialConfig,
    adr: u8,
    shared: Arc<Shared>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl CcTalk {
    pub fn new(cfg: SerialConfig, adr: u8) -> CcTalk {
        let (connected, _) = watch::channel(false);
        CcTalk {
            cfg,
            adr,
            shared: Arc::new(Shared {
                host: 1,
                writer: AsyncMutex::new(None),
                bus: AsyncMutex::new(()),
                pending: StdMutex::new(None),
                event_counters: StdMutex::new(HashMap::new()),
                coins: StdMutex::new(HashMap::new()),
                device_infos: StdMutex::new(HashMap::new()),
                connected,
            }),
            task: StdMutex::new(None),
        }
    }

    pub fn address(&self) -> u8 {
        self.adr
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
                        info!(port = %cfg.path, "cctalk port open");
                        let (r, w) = tokio::io::split(port);
                        session(shared.clone(), r, Box::new(w)).await;
                    }
                    Err(e) => error!(port = %cfg.path, error = %e, "cctalk open failed"),
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

    pub fn coins(&self, adr: u8) -> Vec<Denomination> {
        let coins = self.shared.coins.lock().unwrap();
        let Some(map) = coins.get(&adr) else {
            return Vec::new();
        };
        let mut slots: Vec<_> = map.iter().map(|(&k, &v)| (k, v)).collect();
        slots.sort_by_key(|(k, _)| *k);
        slots.into_iter().map(|(_, v)| v).collect()
    }

    pub fn device_info(&self, adr: u8) -> Option<HashMap<u8, Vec<u8>>> {
        self.shared.device_infos.lock().unwrap().get(&adr).cloned()
    }

    /// Send one request and wait for its reply. The bus lock makes this the
    /// only frame in flight anywhere on the bus.
    pub async fn command(&self, adr: u8, hdr: u8, data: &[u8]) -> Result<CcReply> {
        if !*self.shared.connected.borrow() {
            return Err(Error::NotConnected);
        }
        let _bus = self.shared.bus.lock().await;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().unwrap();
            // a cancelled caller may leave a dead slot behind; a live one
            // cannot exist while the bus lock is held
            debug_assert!(pending.as_ref().map_or(true, |(_, tx)| tx.is_closed()));
            *pending = Some((hdr, tx));
        }
        let raw = frame(adr, self.shared.host, hdr, data);
        debug!(tx = %hex(&raw), "cctalk");
        if let Err(e) = self.shared.write(&raw).await {
            self.shared.pending.lock().unwrap().take();
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionLost),
            Err(_) => {
                self.shared.pending.lock().unwrap().take();
                Err(Error::Timeout(REQUEST_TIMEOUT))
            }
        }
    }

    pub async fn simple_poll(&self, adr: u8) -> Result<CcReply> {
        self.command(adr, header::SIMPLE_POLL, &[]).await
    }

    pub async fn status(&self, adr: u8) -> Result<CcReply> {
        self.command(adr, header::REQUEST_STATUS_C, &[]).await
    }

    pub async fn enable(&self, adr: u8) -> Result<()> {
        self.set_master_inhibit(adr, true).await?;
        self.command(adr, header::SET_PERIPHERAL_DEVICE_MASTER_INHIBIT, &[0x00, 0x01])
            .await?;
        Ok(())
    }

    pub async fn disable(&self, adr: u8) -> Result<()> {
        self.set_master_inhibit(adr, false).await?;
        self.command(adr, header::SET_PERIPHERAL_DEVICE_MASTER_INHIBIT, &[0x00, 0x00])
            .await?;
        Ok(())
    }

    pub async fn set_master_inhibit(&self, adr: u8, enabled: bool) -> Result<CcReply> {
        self.command(adr, header::SET_MASTER_INHIBIT_STATUS, &[u8::from(enabled)])
            .await
    }

    pub async fn payout_amount(
        &self,
        adr: u8,
        value_hundredths: u32,
        country: &[u8; 3],
    ) -> Result<CcReply> {
        let mut data = value_hundredths.to_le_bytes().to_vec();
        data.extend_from_slice(country);
        self.command(adr, header::PAYOUT_AMOUNT_C, &data).await
    }

    pub async fn empty(&self, adr: u8) -> Result<CcReply> {
        self.command(adr, header::EMPTY, &[]).await
    }

    pub async fn run_unit_calibration(&self, adr: u8) -> Result<CcReply> {
        self.command(adr, header::RUN_UNIT_CALIBRATION, &[]).await
    }

    pub async fn read_buffered_credit(&self, adr: u8) -> Result<CcReply> {
        self.command(adr, header::READ_BUFFERED_CREDIT, &[]).await
    }

    /// Fetch the hopper's denomination list and remember it for event
    /// resolution.
    pub async fn get_device_setup(&self, adr: u8) -> Result<Vec<Denomination>> {
        let reply = self.command(adr, header::GET_DEVICE_SETUP_C, &[]).await?;
        let raw = &reply.raw;
        if raw.is_empty() {
            return Err(Error::Framing("empty device setup"));
        }
        let count = usize::from(raw[0]);
        if raw.len() < 1 + count * 7 {
            return Err(Error::Framing("truncated device setup"));
        }
        let list: Vec<Denomination> = (0..count)
            .map(|i| denom(&raw[1 + i * 7..1 + i * 7 + 7], 1, 0))
            .collect();
        let mut coins = self.shared.coins.lock().unwrap();
        let slots = coins.entry(adr).or_default();
        for (i, d) in list.iter().enumerate() {
            slots.insert(i as u8, *d);
        }
        Ok(list)
    }

    /// Probe each address and collect identification; hoppers additionally
    /// report their coin table.
    pub async fn init(&self, addrs: &[u8]) -> Result<()> {
        for &adr in addrs {
            if self.simple_poll(adr).await.is_err() {
                debug!(adr, "cctalk address silent");
                continue;
            }
            let mut infos = HashMap::new();
            for hdr in IDENT_HEADERS {
                match self.command(adr, hdr, &[]).await {
                    Ok(reply) => {
                        infos.insert(hdr, reply.raw);
                    }
                    Err(e) => debug!(adr, hdr, error = %e, "identification query failed"),
                }
            }
            let hopper = infos
                .get(&header::REQUEST_EQUIPMENT_CATEGORY_ID)
                .is_some_and(|raw| raw.as_slice() == b"SMART_HOPPER");
            info!(adr, ?hopper, "cctalk device found");
            self.shared.device_infos.lock().unwrap().insert(adr, infos);
            if hopper {
                self.get_device_setup(adr).await?;
            }
        }
        Ok(())
    }

    /// Block until the peripheral reports a credit.
    pub async fn stack_one(&self, adr: u8) -> Result<CcReply> {
        loop {
            tokio::time::sleep(CREDIT_POLL_DELAY).await;
            let out = self.status(adr).await?;
            if !out.credit.is_empty() {
                return Ok(out);
            }
        }
    }
}

async fn session(shared: Arc<Shared>, reader: impl AsyncRead + Unpin, writer: Writer) {
    *shared.writer.lock().await = Some(writer);
    shared.connected.send_replace(true);
    if let Err(e) = read_loop(&shared, reader).await {
        warn!(error = %e, "cctalk reader stopped");
    }
    shared.connected.send_replace(false);
    *shared.writer.lock().await = None;
    fail_pending(&shared);
}

fn fail_pending(shared: &Shared) {
    if let Some((_, tx)) = shared.pending.lock().unwrap().take() {
        let _ = tx.send(Err(Error::ConnectionLost));
    }
}

async fn read_loop(shared: &Shared, mut r: impl AsyncRead + Unpin) -> Result<()> {
    loop {
        let mut head = [0u8; 4];
        r.read_exact(&mut head).await?;
        let [dest, len, src, _hdr] = head;
        let mut data = vec![0u8; usize::from(len)];
        r.read_exact(&mut data).await?;
        let mut ck = [0u8; 1];
        r.read_exact(&mut ck).await?;

        if dest != shared.host {
            // our own transmission coming back off the multi-drop bus
            debug!(dest, "cctalk bus echo dropped");
            continue;
        }
        let mut raw = head.to_vec();
        raw.extend_from_slice(&data);
        raw.push(ck[0]);
        let adr = if checksum_ok(&raw) {
            src
        } else if crc_variant_ok(&raw) {
            0
        } else {
            debug!(rx = %hex(&raw), "cctalk checksum mismatch, frame dropped");
            continue;
        };
        debug!(rx = %hex(&raw), "cctalk");
        on_reply(shared, adr, &data);
    }
}

fn on_reply(shared: &Shared, adr: u8, data: &[u8]) {
    let Some((cmd, tx)) = shared.pending.lock().unwrap().take() else {
        debug!(adr, "cctalk unsolicited frame dropped");
        return;
    };
    let mut resp = CcReply {
        adr,
        cmd,
        raw: data.to_vec(),
        ..Default::default()
    };
    let result = match cmd {
        header::REQUEST_STATUS_C => parse_status_c(data).map(|st| {
            resp.status = st.status;
            resp.processing = st.processing;
            resp.credit = st.credit;
            resp
        }),
        header::READ_BUFFERED_CREDIT => {
            let counter = data.first().copied().unwrap_or(0);
            let last = {
                let mut counters = shared.event_counters.lock().unwrap();
                counters.insert(adr, counter).unwrap_or(0)
            };
            let fresh = new_events(last, counter).min(data.len().saturating_sub(1) / 2);
            let coins = shared.coins.lock().unwrap();
            let records = data.get(1..).unwrap_or_default();
            for chunk in records.chunks_exact(2).take(fresh) {
                let (slot, route) = (chunk[0], chunk[1]);
                resp.events.push(CreditEvent {
                    slot,
                    route,
                    denom: coins.get(&adr).and_then(|m| m.get(&slot)).copied(),
                });
            }
            Ok(resp)
        }
        _ => Ok(resp),
    };
    let _ = tx.send(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn driver() -> CcTalk {
        CcTalk::new(SerialConfig::new("/dev/null", 9600), 2)
    }

    async fn attach(ct: &CcTalk) -> DuplexStream {
        let (host, dev) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(host);
        let shared = ct.shared.clone();
        tokio::spawn(async move { session(shared, r, Box::new(w)).await });
        ct.wait_connected().await.unwrap();
        dev
    }

    async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Vec<u8> {
        let mut head = [0u8; 4];
        r.read_exact(&mut head).await.unwrap();
        let mut rest = vec![0u8; usize::from(head[1]) + 1];
        r.read_exact(&mut rest).await.unwrap();
        let mut raw = head.to_vec();
        raw.extend_from_slice(&rest);
        raw
    }

    fn rec(value: u32, country: &[u8; 3]) -> Vec<u8> {
        let mut r = value.to_le_bytes().to_vec();
        r.extend_from_slice(country);
        r
    }

    #[test]
    fn frame_sums_to_zero() {
        let f = frame(2, 1, header::SIMPLE_POLL, &[]);
        assert_eq!(f, vec![2, 0, 1, 254, 255]);
        assert!(checksum_ok(&f));
        let f = frame(3, 1, header::SET_MASTER_INHIBIT_STATUS, &[0x01]);
        assert!(checksum_ok(&f));
        assert_eq!(f[1], 1);
    }

    #[test]
    fn ack_frame_recognized() {
        // data length 0, header 0: the plain ACK
        let f = frame(1, 2, 0, &[]);
        assert!(checksum_ok(&f));
        assert_eq!(&f[..4], &[1, 0, 2, 0]);
    }

    #[test]
    fn crc_variant_recognized_not_emitted() {
        // emulate an encrypted-capable peripheral: CRC low byte in the SRC
        // slot, high byte in the checksum slot
        let data = b"ack";
        let mut buf = vec![1u8, data.len() as u8, 0];
        buf.extend_from_slice(data);
        let c = CRC_CCITT.checksum(&buf);
        let mut raw = vec![1u8, data.len() as u8, (c & 0xff) as u8, 0];
        raw.extend_from_slice(data);
        raw.push((c >> 8) as u8);
        assert!(crc_variant_ok(&raw));
        // host frames always use the simple sum
        let f = frame(2, 1, header::SIMPLE_POLL, &[]);
        assert!(checksum_ok(&f));
    }

    #[test]
    fn coin_credit_advances_cursor_by_8() {
        let mut data = vec![0x0d];
        data.extend_from_slice(&rec(100, b"RUS"));
        data.push(0x00); // trailing Idle proves the cursor landed right
        let st = parse_status_c(&data).unwrap();
        assert_eq!(st.credit.len(), 1);
        assert_eq!(st.credit[0].amount(), 1.0);
        assert_eq!(st.credit[0].country(), "RUS");
        assert_eq!(st.status.len(), 1);
        assert_eq!(st.status[0].label, "Idle");
    }

    #[test]
    fn dispensed_records_are_negative() {
        let mut data = vec![0x02, 2];
        data.extend_from_slice(&rec(500, b"RUS"));
        data.extend_from_slice(&rec(1000, b"RUS"));
        let st = parse_status_c(&data).unwrap();
        assert_eq!(st.credit.len(), 2);
        assert_eq!(st.credit[0].amount(), -5.0);
        assert_eq!(st.credit[1].amount(), -10.0);
        assert_eq!(st.status[0].label, "Dispensed");
    }

    #[test]
    fn unknown_event_code_is_framing_error() {
        assert!(matches!(
            parse_status_c(&[0x42]),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn truncated_event_record_is_framing_error() {
        // promises 3 records, carries 1
        let mut data = vec![0x01, 3];
        data.extend_from_slice(&rec(100, b"RUS"));
        assert!(matches!(parse_status_c(&data), Err(Error::Framing(_))));
    }

    #[test]
    fn event_counter_wraps() {
        assert_eq!(new_events(0, 3), 3);
        // the counter skips zero on wrap: 254 -> 255 -> 1 -> 2
        assert_eq!(new_events(254, 2), 3);
        assert_eq!(new_events(255, 2), 2);
        assert_eq!(new_events(7, 7), 0);
        // zero counter means slave reset, nothing credited
        assert_eq!(new_events(200, 0), 0);
    }

    #[tokio::test]
    async fn simple_poll_round_trip() {
        let ct = driver();
        let mut dev = attach(&ct).await;
        let dev_task = async {
            let req = read_request(&mut dev).await;
            assert_eq!(req, vec![2, 0, 1, 254, 255]);
            dev.write_all(&frame(1, 2, 0, &[])).await.unwrap();
        };
        let (res, ()) = tokio::join!(ct.simple_poll(2), dev_task);
        let reply = res.unwrap();
        assert_eq!(reply.adr, 2);
        assert!(reply.raw.is_empty());
    }

    #[tokio::test]
    async fn bus_echo_is_dropped() {
        let ct = driver();
        let mut dev = attach(&ct).await;
        let dev_task = async {
            let _req = read_request(&mut dev).await;
            // our own frame coming back first, then the real reply
            dev.write_all(&frame(2, 1, header::SIMPLE_POLL, &[]))
                .await
                .unwrap();
            dev.write_all(&frame(1, 2, 0, &[])).await.unwrap();
        };
        let (res, ()) = tokio::join!(ct.simple_poll(2), dev_task);
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn crc_variant_reply_attributed_to_address_zero() {
        let ct = driver();
        let mut dev = attach(&ct).await;
        let dev_task = async {
            let _req = read_request(&mut dev).await;
            let data = [0x00u8]; // one idle event
            let mut buf = vec![1u8, 1, 47];
            buf.extend_from_slice(&data);
            let c = CRC_CCITT.checksum(&buf);
            let mut raw = vec![1u8, 1, (c & 0xff) as u8, 47];
            raw.extend_from_slice(&data);
            raw.push((c >> 8) as u8);
            dev.write_all(&raw).await.unwrap();
        };
        let (res, ()) = tokio::join!(ct.status(2), dev_task);
        let reply = res.unwrap();
        assert_eq!(reply.adr, 0);
        assert_eq!(reply.status[0].label, "Idle");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_bus_times_out() {
        let ct = driver();
        let mut dev = attach(&ct).await;
        let dev_task = async {
            let _req = read_request(&mut dev).await;
        };
        let (res, ()) = tokio::join!(ct.simple_poll(2), dev_task);
        assert!(matches!(res, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn buffered_credit_events_resolved_against_coin_table() {
        let ct = driver();
        let mut dev = attach(&ct).await;
        ct.shared.coins.lock().unwrap().insert(
            2,
            HashMap::from([(
                1u8,
                Denomination {
                    value: 500,
                    country: *b"RUS",
                    code: 0,
                },
            )]),
        );
        let dev_task = async {
            let req = read_request(&mut dev).await;
            assert_eq!(req[3], header::READ_BUFFERED_CREDIT);
            // counter 2, two (slot, route) pairs
            dev.write_all(&frame(1, 2, 0, &[2, 1, 0, 1, 0])).await.unwrap();
        };
        let (res, ()) = tokio::join!(ct.read_buffered_credit(2), dev_task);
        let reply = res.unwrap();
        assert_eq!(reply.events.len(), 2);
        assert_eq!(reply.events[0].slot, 1);
        assert_eq!(reply.events[0].denom.unwrap().amount(), 5.0);
    }

    #[tokio::test]
    async fn device_setup_fills_coin_table() {
        let ct = driver();
        let mut dev = attach(&ct).await;
        let dev_task = async {
            let req = read_request(&mut dev).await;
            assert_eq!(req[3], header::GET_DEVICE_SETUP_C);
            let mut data = vec![2u8];
            data.extend_from_slice(&rec(100, b"RUS"));
            data.extend_from_slice(&rec(200, b"RUS"));
            dev.write_all(&frame(1, 2, 0, &data)).await.unwrap();
        };
        let (res, ()) = tokio::join!(ct.get_device_setup(2), dev_task);
        let list = res.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].amount(), 2.0);
        assert_eq!(ct.coins(2).len(), 2);
    }
}
