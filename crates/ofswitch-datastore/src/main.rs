#![warn(missing_docs)]

//! ofswitchd: bring up the datastore and the pipeline, run until
//! SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ofswitch_dataplane::{DataplaneConfig, LcoreAssignment, PipelineRuntime};
use ofswitch_datastore::{Datastore, Drivers};
use ofswitch_ofproto::PortTable;
use ofswitch_packet::MbufPool;
use serde::Deserialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Top-level daemon configuration file.
#[derive(Debug, Deserialize)]
struct DaemonConfig {
    /// Pipeline tunables.
    #[serde(default)]
    dataplane: DataplaneConfig,
    /// Thread layout.
    lcores: Vec<LcoreAssignment>,
    /// Saved configuration to preload, if any.
    #[serde(default)]
    config_snapshot: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ofswitchd.json".to_string());
    tracing::info!(config = %path, "ofswitchd starting");
    let text = std::fs::read_to_string(&path)?;
    let config: DaemonConfig = serde_json::from_str(&text)?;

    let ports = Arc::new(PortTable::default());
    let pool = Arc::new(MbufPool::new(config.dataplane.pool.clone()));
    let datastore = Arc::new(Datastore::new(Arc::clone(&ports), Drivers::default()));

    if let Some(snap) = &config.config_snapshot {
        datastore
            .load_json(snap)
            .map_err(|e| anyhow::anyhow!("preload failed: {e}"))?;
        // Preloaded objects come up in declaration order: interfaces,
        // then ports, then bridges.
        let snapshot = datastore.snapshot();
        for name in snapshot.interfaces.keys() {
            datastore
                .interface_enable(name)
                .map_err(|e| anyhow::anyhow!("interface {name}: {e}"))?;
        }
        for name in snapshot.ports.keys() {
            datastore
                .port_enable(name)
                .map_err(|e| anyhow::anyhow!("port {name}: {e}"))?;
        }
        for name in snapshot.bridges.keys() {
            datastore
                .bridge_enable(name)
                .map_err(|e| anyhow::anyhow!("bridge {name}: {e}"))?;
        }
    }

    let handler = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }

    let mut runtime = PipelineRuntime::spawn(
        config.dataplane.clone(),
        Arc::clone(&ports),
        pool,
        config.lcores.clone(),
    )?;
    tracing::info!("pipeline up");

    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
        // Drive link polling for back-ends without notifications.
        for port in ports.iter_ports() {
            if let Some(iface) = port.interface() {
                iface.poll_link();
            }
        }
    }

    tracing::info!("shutting down");
    runtime.stop()?;
    Ok(())
}
