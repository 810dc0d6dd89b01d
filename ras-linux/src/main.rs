// Ranging Service daemon: responder serves synthetic procedures, requester fetches them.

mod config;
mod link;
mod synth;

use std::time::Duration;

use anyhow::Context;
use rand::SeedableRng;
use ras_core::protocol::ConnId;
use ras_core::ranging::{CsRole, RangingHeader};
use ras_core::{RasEvent, RasHandle, RasService};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Config, Role};
use crate::link::{ConnIds, LinkTransport};
use crate::synth::ProcedureSynth;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("ras-linux {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = config::load();
    info!(role = ?cfg.role, addr = %cfg.addr, mtu = cfg.mtu, "ras-linux {} starting", VERSION);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let transport = LinkTransport::default();
        let (handle, events) = RasService::spawn(cfg.ras.clone(), transport.clone());
        match cfg.role {
            Role::Responder => {
                let listener = TcpListener::bind(&cfg.addr)
                    .await
                    .with_context(|| format!("bind {}", cfg.addr))?;
                tokio::spawn(log_events(events));
                tokio::spawn(run_responder(listener, cfg.clone(), handle, transport));
            }
            Role::Requester => {
                let limit = ras_core::ranging::max_record_len();
                tokio::spawn(fetch_announced(events, handle.clone(), limit));
                tokio::spawn(run_requester(cfg.clone(), handle, transport));
            }
        }
        shutdown_signal().await?;
        info!("shutting down");
        Ok::<_, anyhow::Error>(())
    })
}

async fn run_responder(listener: TcpListener, cfg: Config, handle: RasHandle, transport: LinkTransport) {
    let mut ids = ConnIds::new();
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "accept failed");
                break;
            }
        };
        let conn = ids.next();
        info!(conn = %conn, %peer, "peer connected");
        let handle = handle.clone();
        let transport = transport.clone();
        let cfg = cfg.clone();
        tokio::spawn(async move {
            tokio::select! {
                r = link::run_connection(stream, conn, Role::Responder, cfg.mtu, handle.clone(), transport) => {
                    if let Err(e) = r {
                        link::log_link_error(conn, &e);
                    }
                }
                _ = feed_procedures(conn, &cfg, &handle) => {}
            }
        });
    }
}

/// Feed a synthetic procedure every `procedure_interval_ms` until the service stops.
async fn feed_procedures(conn: ConnId, cfg: &Config, handle: &RasHandle) {
    let mut synth = ProcedureSynth::new(
        CsRole::Reflector,
        cfg.ras.max_antenna_paths,
        cfg.subevents_per_procedure,
        cfg.steps_per_subevent,
    );
    let mut rng = rand::rngs::StdRng::from_entropy();
    let mut tick = tokio::time::interval(Duration::from_millis(cfg.procedure_interval_ms.max(1)));
    tick.tick().await;
    loop {
        tick.tick().await;
        for subevent in synth.next_procedure(&mut rng) {
            if handle.subevent(conn, subevent).is_err() {
                return;
            }
        }
    }
}

async fn run_requester(cfg: Config, handle: RasHandle, transport: LinkTransport) {
    let conn = ConnId(1);
    loop {
        match TcpStream::connect(&cfg.addr).await {
            Ok(stream) => {
                let r = link::run_connection(
                    stream,
                    conn,
                    Role::Requester,
                    cfg.mtu,
                    handle.clone(),
                    transport.clone(),
                )
                .await;
                if let Err(e) = r {
                    link::log_link_error(conn, &e);
                }
            }
            Err(e) => debug!(addr = %cfg.addr, error = %e, "connect failed"),
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Fetch every record the peer announces, one at a time per connection.
async fn fetch_announced(mut events: mpsc::UnboundedReceiver<RasEvent>, handle: RasHandle, limit: usize) {
    while let Some(event) = events.recv().await {
        match event {
            RasEvent::PeerRecordReady {
                conn,
                ranging_counter,
            } => match handle.get_record(conn, ranging_counter, limit).await {
                Ok(record) => match RangingHeader::from_bytes(record.as_slice()) {
                    Some(h) => info!(
                        conn = %conn,
                        ranging_counter,
                        len = record.len(),
                        config_id = h.config_id,
                        antenna_paths = h.antenna_paths(),
                        "record fetched"
                    ),
                    None => warn!(conn = %conn, ranging_counter, "record without ranging header"),
                },
                Err(e) => warn!(conn = %conn, ranging_counter, error = %e, "fetch failed"),
            },
            RasEvent::PeerRecordOverwritten {
                conn,
                ranging_counter,
            } => debug!(conn = %conn, ranging_counter, "peer overwrote record"),
            other => debug!(?other, "event"),
        }
    }
}

async fn log_events(mut events: mpsc::UnboundedReceiver<RasEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            RasEvent::RecordReady {
                conn,
                ranging_counter,
            } => debug!(conn = %conn, ranging_counter, "record ready"),
            RasEvent::RecordOverwritten {
                conn,
                ranging_counter,
            } => info!(conn = %conn, ranging_counter, "record overwritten before ack"),
            other => debug!(?other, "event"),
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
