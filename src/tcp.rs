use std::rc::Rc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::ccnet::{Bill, Ccnet, PollStatus, Reply};
use crate::cctalk::{CcReply, CcTalk, Denomination};
use crate::lcdm::{DispenseReply, Lcdm, LcdmReply, Sensors};
use crate::sber::{Acquiring, Pilot, PilotOutput};
use crate::serial::hex;
use crate::types::Error;

/// Upper bound on a blocking bill-accept call.
const GET_BILL_TIMEOUT: Duration = Duration::from_secs(30);
/// Reported when the device behind an endpoint is unreachable, the same
/// code the fronting HTTP layer uses.
const UNREACHABLE: i64 = 523;

pub struct Drivers {
    pub cashcode: Option<Rc<Ccnet>>,
    pub cctalk: Option<Rc<CcTalk>>,
    pub lcdm: Option<Rc<Lcdm>>,
    pub sber: Option<Rc<Pilot>>,
}

#[derive(Debug, Deserialize)]
struct Request {
    device: String,
    op: String,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    count: Option<u8>,
    #[serde(default)]
    upper: Option<u64>,
    #[serde(default)]
    lower: Option<u64>,
    #[serde(default)]
    args: Option<Vec<String>>,
}

/// One JSON request per line, one JSON reply per line.
pub async fn drive(listener: TcpListener, drivers: Rc<Drivers>) {
    loop {
        let stream = match listener.accept().await {
            Ok((s, _)) => s,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let drivers = drivers.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = handle_connection(stream, &drivers).await {
                debug!(error = %e, "connection closed");
            }
        });
    }
}

async fn handle_connection(mut stream: TcpStream, drivers: &Drivers) -> std::io::Result<()> {
    let (r, mut w) = stream.split();
    let mut lines = BufReader::new(r).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut out = dispatch(drivers, &line).await.to_string();
        out.push('\n');
        w.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(drivers: &Drivers, line: &str) -> Value {
    let req: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => return json!({"error": 400, "message": e.to_string()}),
    };
    match req.device.as_str() {
        "cashcode" => match &drivers.cashcode {
            Some(cc) => cashcode_op(cc, &req).await,
            None => not_configured(),
        },
        "cctalk" => match &drivers.cctalk {
            Some(ct) => cctalk_op(ct, &req).await,
            None => not_configured(),
        },
        "lcdm" => match &drivers.lcdm {
            Some(d) => lcdm_op(d, &req).await,
            None => not_configured(),
        },
        "sber" => match &drivers.sber {
            Some(p) => sber_op(p, &req).await,
            None => not_configured(),
        },
        other => json!({"error": 404, "message": format!("unknown device {other}")}),
    }
}

fn not_configured() -> Value {
    json!({"error": UNREACHABLE, "message": "device not configured"})
}

fn err_json(e: &Error) -> Value {
    match e {
        Error::Device { code, label } => json!({"error": *code, "message": label}),
        Error::Timeout(_) => json!({"error": UNREACHABLE, "message": e.to_string()}),
        e if e.is_transport() => json!({"error": UNREACHABLE, "message": e.to_string()}),
        _ => json!({"error": 500, "message": e.to_string()}),
    }
}

fn unknown_op(op: &str) -> Value {
    json!({"error": 404, "message": format!("unknown op {op}")})
}

fn bill_json(b: &Bill) -> Value {
    json!({"denomination": b.value(), "country": b.country()})
}

fn poll_json(st: &PollStatus) -> Value {
    json!({
        "state": st.state,
        "label": crate::ccnet::state_label(st.state),
        "param": st.param,
        "credit": st.credit.as_ref().map(bill_json),
    })
}

fn reply_json(result: crate::types::Result<Reply>) -> Value {
    match result {
        Ok(Reply::Ack) => json!({"ok": true}),
        Ok(Reply::Poll(st)) => poll_json(&st),
        Ok(Reply::Status {
            bill_types,
            security,
        }) => json!({"bill_types": bill_types, "security": security}),
        Ok(Reply::BillTable(table)) => json!({
            "bill_table": table
                .iter()
                .filter(|b| !b.is_empty())
                .map(bill_json)
                .collect::<Vec<_>>(),
        }),
        Ok(Reply::Raw(raw)) => json!({"raw": hex(&raw)}),
        Err(e) => err_json(&e),
    }
}

async fn cashcode_op(cc: &Ccnet, req: &Request) -> Value {
    let adr = cc.address();
    match req.op.as_str() {
        "status" => match cc.poll(adr).await {
            Ok(st) => poll_json(&st),
            Err(e) => err_json(&e),
        },
        "enable" => reply_json(cc.enable(adr).await),
        "enable_coin" => reply_json(cc.enable_coin(adr).await),
        "disable" => reply_json(cc.disable(adr).await),
        "return" => reply_json(cc.return_bill(adr).await),
        "hold" => reply_json(cc.hold(adr).await),
        "get_bill" => match tokio::time::timeout(GET_BILL_TIMEOUT, cc.stack_one(adr)).await {
            Ok(Ok(st)) => poll_json(&st),
            Ok(Err(e)) => err_json(&e),
            Err(_) => json!({"error": UNREACHABLE, "message": "no bill accepted in time"}),
        },
        op => unknown_op(op),
    }
}

fn denom_json(d: &Denomination) -> Value {
    json!({"denomination": d.amount(), "country": d.country(), "code": d.code})
}

fn cc_json(r: &CcReply) -> Value {
    json!({
        "adr": r.adr,
        "cmd": r.cmd,
        "status": r.status
            .iter()
            .map(|s| json!({"code": s.code, "description": s.label}))
            .collect::<Vec<_>>(),
        "credit": r.credit.iter().map(denom_json).collect::<Vec<_>>(),
        "processing": r.processing.iter().map(denom_json).collect::<Vec<_>>(),
        "events": r.events
            .iter()
            .map(|e| json!({
                "slot": e.slot,
                "route": e.route,
                "denomination": e.denom.as_ref().map(denom_json),
            }))
            .collect::<Vec<_>>(),
    })
}

async fn cctalk_op(ct: &CcTalk, req: &Request) -> Value {
    let adr = ct.address();
    match req.op.as_str() {
        "status" => match ct.status(adr).await {
            Ok(r) => cc_json(&r),
            Err(e) => err_json(&e),
        },
        "enable" => match ct.enable(adr).await {
            Ok(()) => json!({"ok": true}),
            Err(e) => err_json(&e),
        },
        "disable" => match ct.disable(adr).await {
            Ok(()) => json!({"ok": true}),
            Err(e) => err_json(&e),
        },
        "get_bill" => match tokio::time::timeout(GET_BILL_TIMEOUT, ct.stack_one(adr)).await {
            Ok(Ok(r)) => cc_json(&r),
            Ok(Err(e)) => err_json(&e),
            Err(_) => json!({"error": UNREACHABLE, "message": "no credit in time"}),
        },
        "events" => match ct.read_buffered_credit(adr).await {
            Ok(r) => cc_json(&r),
            Err(e) => err_json(&e),
        },
        "payout" => {
            let amount = req.amount.unwrap_or(0.0);
            if amount <= 0.0 {
                return json!({"error": 400, "message": "amount must be positive"});
            }
            let country = ct
                .coins(adr)
                .first()
                .map(|d| d.country)
                .unwrap_or(*b"RUS");
            let hundredths = (amount * 100.0).round() as u32;
            match ct.payout_amount(adr, hundredths, &country).await {
                Ok(r) => cc_json(&r),
                Err(e) => err_json(&e),
            }
        }
        "empty" => match ct.empty(adr).await {
            Ok(r) => cc_json(&r),
            Err(e) => err_json(&e),
        },
        "calibrate" => match ct.run_unit_calibration(adr).await {
            Ok(r) => cc_json(&r),
            Err(e) => err_json(&e),
        },
        "info" => match ct.device_info(adr) {
            Some(info) => json!(info
                .iter()
                .map(|(hdr, raw)| (hdr.to_string(), String::from_utf8_lossy(raw)))
                .collect::<std::collections::HashMap<_, _>>()),
            None => json!({"error": 404, "message": "address not initialized"}),
        },
        op => unknown_op(op),
    }
}

fn dispense_json(d: &DispenseReply) -> Value {
    json!({
        "check": d.check,
        "exit": d.exit,
        "error": d.error,
        "description": d.label,
        "nearend": d.nearend,
        "enough": d.enough,
        "reject": d.reject,
        "ok": d.ok,
    })
}

fn sensors_json(s: &Sensors) -> Value {
    json!({
        "chk1": s.chk1, "chk2": s.chk2,
        "div1": s.div1, "div2": s.div2,
        "ejt": s.ejt, "exit": s.exit,
        "nearend0": s.nearend0, "always1": s.always1,
        "sol": s.sol,
        "cassette0": s.cassette0, "cassette1": s.cassette1,
        "chk3": s.chk3, "chk4": s.chk4,
        "nearend1": s.nearend1, "reject": s.reject,
    })
}

async fn lcdm_op(d: &Lcdm, req: &Request) -> Value {
    match req.op.as_str() {
        "dispense" => {
            let amount = req.amount.unwrap_or(0.0);
            if amount <= 0.0 {
                return json!({"error": 400, "message": "amount must be positive"});
            }
            let outcome = d.dispense(amount as u64).await;
            json!({
                "out": outcome.out,
                "ok": outcome.ok,
                "errors": outcome.errors
                    .iter()
                    .map(|(code, text)| json!([code, text]))
                    .collect::<Vec<_>>(),
            })
        }
        "status" => match d.status().await {
            Ok(st) => json!({
                "error": st.error,
                "description": st.label,
                "ok": st.ok,
                "sensors": sensors_json(&st.sensors),
            }),
            Err(e) => err_json(&e),
        },
        "upper_dispense" | "lower_dispense" | "test_upper" | "test_lower" => {
            let Some(count) = req.count.filter(|c| *c > 0) else {
                return json!({"error": 400, "message": "count must be positive"});
            };
            let result = match req.op.as_str() {
                "upper_dispense" => d.upper_dispense(count).await,
                "lower_dispense" => d.lower_dispense(count).await,
                "test_upper" => d.test_upper(count).await,
                _ => d.test_lower(count).await,
            };
            match result {
                Ok(r) => dispense_json(&r),
                Err(e) => err_json(&e),
            }
        }
        "load" => {
            d.load(req.upper.unwrap_or(0), req.lower.unwrap_or(0));
            let (upper, lower) = d.counters();
            json!({"upper": upper, "lower": lower})
        }
        "purge" => match d.purge().await {
            Ok(LcdmReply::Raw(raw)) => json!({"ok": true, "raw": hex(&raw)}),
            Ok(_) => json!({"ok": true}),
            Err(e) => err_json(&e),
        },
        "rom_version" => match d.rom_version().await {
            Ok(LcdmReply::Raw(raw)) => json!({"rom": hex(&raw)}),
            Ok(_) => json!({"error": 500, "message": "unexpected reply"}),
            Err(e) => err_json(&e),
        },
        op => unknown_op(op),
    }
}

fn pilot_json(out: &PilotOutput) -> Value {
    json!({
        "status": out.status,
        "status_text": out.status_text,
        "answer": out.answer,
        "message": out.message,
    })
}

fn acquiring_json(a: &Acquiring) -> Value {
    json!({
        "type": "electronicaly",
        "status": a.status,
        "status_text": a.status_text,
        "card": a.card,
        "auth": a.auth,
        "check": a.check,
        "terminal": a.terminal,
        "time": a.time,
        "link": a.link,
        "hash": a.hash,
        "merchant": a.merchant,
        "amount": a.amount,
        "answer": a.answer,
        "message": a.message,
    })
}

async fn sber_op(p: &Pilot, req: &Request) -> Value {
    match req.op.as_str() {
        "acquiring" => {
            let amount = req.amount.unwrap_or(0.0);
            if amount <= 0.0 {
                return json!({"error": 400, "message": "amount must be positive"});
            }
            acquiring_json(&p.exec_acquiring(amount).await)
        }
        "sync" => pilot_json(&p.exec_sync().await),
        "run" => {
            let args = req.args.clone().unwrap_or_default();
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            pilot_json(&p.run(&refs).await)
        }
        op => unknown_op(op),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccnet::VALIDATOR;
    use crate::serial::SerialConfig;

    fn empty_drivers() -> Drivers {
        Drivers {
            cashcode: None,
            cctalk: None,
            lcdm: None,
            sber: None,
        }
    }

    #[tokio::test]
    async fn malformed_request_is_400() {
        let resp = dispatch(&empty_drivers(), "not json").await;
        assert_eq!(resp["error"], 400);
    }

    #[tokio::test]
    async fn unknown_device_is_404() {
        let resp = dispatch(&empty_drivers(), r#"{"device":"vault","op":"open"}"#).await;
        assert_eq!(resp["error"], 404);
    }

    #[tokio::test]
    async fn missing_device_is_unreachable() {
        let resp = dispatch(&empty_drivers(), r#"{"device":"lcdm","op":"status"}"#).await;
        assert_eq!(resp["error"], UNREACHABLE);
    }

    #[tokio::test]
    async fn closed_driver_is_unreachable() {
        let drivers = Drivers {
            cashcode: Some(Rc::new(Ccnet::new(
                SerialConfig::new("/dev/null", 19200),
                VALIDATOR,
            ))),
            cctalk: None,
            lcdm: None,
            sber: None,
        };
        let resp = dispatch(&drivers, r#"{"device":"cashcode","op":"status"}"#).await;
        assert_eq!(resp["error"], UNREACHABLE);
    }

    #[tokio::test]
    async fn negative_dispense_amount_rejected() {
        let drivers = Drivers {
            cashcode: None,
            cctalk: None,
            lcdm: Some(Rc::new(Lcdm::new(
                SerialConfig::new("/dev/null", 19200),
                1000,
                100,
            ))),
            sber: None,
        };
        let resp = dispatch(
            &drivers,
            r#"{"device":"lcdm","op":"dispense","amount":-5}"#,
        )
        .await;
        assert_eq!(resp["error"], 400);
    }
}
