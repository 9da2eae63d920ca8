use std::path::Path;
use std::rc::Rc;

use anyhow::Context;
#[cfg(feature = "socket")]
use tokio::net::TcpListener;
use tracing::{info, warn};

mod ccnet;
mod cctalk;
mod config;
mod lcdm;
mod sber;
mod serial;
#[cfg(feature = "socket")]
mod tcp;
mod types;

use ccnet::Ccnet;
use cctalk::CcTalk;
use config::Config;
use lcdm::Lcdm;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_owned());
    let cfg = config::load(Path::new(&path)).with_context(|| format!("loading {path}"))?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    rt.block_on(local.run_until(run(cfg)))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let mut cashcode = None;
    if let Some(c) = &cfg.cashcode {
        let cc = Rc::new(Ccnet::new(c.serial(19200), c.adr.unwrap_or(ccnet::VALIDATOR)));
        cc.open();
        tokio::task::spawn_local(bring_up_ccnet(cc.clone()));
        cashcode = Some(cc);
    }

    let mut cctalk = None;
    if let Some(c) = &cfg.cctalk {
        let ct = Rc::new(CcTalk::new(c.serial(9600), c.adr.unwrap_or(2)));
        ct.open();
        tokio::task::spawn_local(bring_up_cctalk(ct.clone()));
        cctalk = Some(ct);
    }

    let mut lcdm = None;
    if let Some(c) = &cfg.lcdm {
        let d = Rc::new(Lcdm::new(c.serial(19200), c.upper_nominal, c.lower_nominal));
        d.open();
        tokio::task::spawn_local(bring_up_lcdm(d.clone()));
        lcdm = Some(d);
    }

    #[cfg(feature = "socket")]
    {
        // the acquiring subprocess is only reachable through the surface
        let mut sber = None;
        if let Some(c) = &cfg.sber {
            match sber::Pilot::new(c) {
                Ok(p) => sber = Some(Rc::new(p)),
                Err(e) => warn!(error = %e, "sb_pilot setup failed"),
            }
        }
        let socket = cfg.socket.clone().unwrap_or_default();
        let listener = TcpListener::bind(&socket.listen)
            .await
            .with_context(|| format!("listening on {}", socket.listen))?;
        info!(listen = %socket.listen, "control socket up");
        let drivers = Rc::new(tcp::Drivers {
            cashcode: cashcode.clone(),
            cctalk: cctalk.clone(),
            lcdm: lcdm.clone(),
            sber,
        });
        tokio::task::spawn_local(tcp::drive(listener, drivers));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    if let Some(cc) = &cashcode {
        cc.close().await;
    }
    if let Some(ct) = &cctalk {
        ct.close().await;
    }
    if let Some(d) = &lcdm {
        d.close().await;
    }
    Ok(())
}

/// Validator bring-up: reset, fetch the bill table, log what the unit says
/// about itself.
async fn bring_up_ccnet(cc: Rc<Ccnet>) {
    if cc.wait_connected().await.is_err() {
        return;
    }
    let adr = cc.address();
    match cc.reset(adr).await {
        Ok(table) => {
            let bills: Vec<String> = table
                .iter()
                .filter(|b| !b.is_empty())
                .map(|b| format!("{} {}", b.value(), b.country()))
                .collect();
            info!(?bills, "validator ready");
        }
        Err(e) => {
            warn!(error = %e, "validator reset failed");
            return;
        }
    }
    if let Ok(r) = cc.status(adr).await {
        info!(status = ?r, "validator status");
    }
    if let Ok(r) = cc.identification(adr).await {
        info!(ident = ?r, "validator identification");
    }
    if let Err(e) = cc.set_security(&[0xff; 3], adr).await {
        warn!(error = %e, "set security failed");
    }
}

async fn bring_up_cctalk(ct: Rc<CcTalk>) {
    if ct.wait_connected().await.is_err() {
        return;
    }
    let adr = ct.address();
    if let Err(e) = ct.init(&[adr]).await {
        warn!(error = %e, "cctalk init failed");
    }
}

async fn bring_up_lcdm(d: Rc<Lcdm>) {
    if d.wait_connected().await.is_err() {
        return;
    }
    match d.status().await {
        Ok(st) => info!(error = st.error, description = st.label, "dispenser ready"),
        Err(e) => warn!(error = %e, "dispenser status failed"),
    }
}
