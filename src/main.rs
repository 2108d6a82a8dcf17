use anyhow::{Context, Result};
use ioe_client::DeviceManager;
use ioe_core::client::{Connection, ConnectionEvent, ConnectionEventKind, SnDecision};
use ioe_core::config::{ConnectionOptions, DevicesFile};
use ioe_core::render;
use std::path::PathBuf;

/// `<config dir>/ioe-editor/devices.json`
fn default_devices_path() -> Result<PathBuf> {
    let dir = dirs::config_dir().context("No config directory on this platform")?;
    Ok(dir.join("ioe-editor").join("devices.json"))
}

fn main() -> Result<()> {
    env_logger::init();

    // ioe-editor [devices.json] [device name]
    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(path) => PathBuf::from(path),
        None => default_devices_path()?,
    };
    let device = args.next();

    let devices = DevicesFile::load(&path)?;
    let mut manager = DeviceManager::new(devices, ConnectionOptions::default())?;
    let conn = match device {
        Some(name) => manager.connect(&name)?,
        None => manager.connect_default()?,
    };
    log::info!(
        "Watching device {} ({})",
        conn.name(),
        conn.config().ws_url()
    );

    let events = manager.events();
    let runtime = manager.runtime().clone();
    runtime.block_on(async {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        manager.handle_event(&event);
                        report(&conn, event);
                    }
                    Err(_) => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted, closing connections");
                    break;
                }
            }
        }
    });

    manager.dispose();
    Ok(())
}

fn report(conn: &Connection, event: ConnectionEvent) {
    let device = event.device;
    match event.kind {
        ConnectionEventKind::Log(record) => log::info!("[{}] {}", device, render::render_log(&record)),
        ConnectionEventKind::Event(record) => {
            log::info!("[{}] {}", device, render::render_event(&record))
        }
        ConnectionEventKind::Comm(record) => {
            log::info!("[{}] {}", device, render::render_comm(&record))
        }
        ConnectionEventKind::AppEvent(record) => {
            log::info!("[{}] app {} event {}: {}", device, record.app, record.event, record.data)
        }
        ConnectionEventKind::Ready => {
            log::info!("[{}] ready, {} buffered events", device, conn.events().len());
            let conn = conn.clone();
            tokio::spawn(async move {
                match conn.list_apps().await {
                    Ok(apps) => {
                        for app in apps {
                            log::info!(
                                "[{}] app {} ({} v{}) running: {}",
                                conn.name(),
                                app.inst,
                                app.name,
                                app.version,
                                app.running
                            );
                        }
                    }
                    Err(e) if e.is_domain() => {
                        log::warn!("[{}] device refused to list applications: {}", conn.name(), e)
                    }
                    Err(e) => log::error!("[{}] listing applications failed: {}", conn.name(), e),
                }
            });
        }
        ConnectionEventKind::SnConflict { remote_sn, configured_sn } => {
            // No one to ask here; an unexpected identity is never trusted.
            log::error!(
                "[{}] device reports SN {} but {} is configured; fix the devices file",
                device,
                remote_sn,
                configured_sn
            );
            conn.resolve_sn_conflict(SnDecision::Reject);
        }
        ConnectionEventKind::LoginFailed { message } => {
            log::error!("[{}] login failed: {}", device, message)
        }
        ConnectionEventKind::Disconnected { code, reason } => {
            log::warn!("[{}] disconnected ({:?}) {}", device, code, reason)
        }
        ConnectionEventKind::TransportError(e) => log::debug!("[{}] {}", device, e),
        ConnectionEventKind::StatusChanged(status) => log::debug!("[{}] {:?}", device, status),
        ConnectionEventKind::DeviceInfo { sn, beta } => {
            log::info!("[{}] SN {} beta {}", device, sn, beta)
        }
        ConnectionEventKind::SnUpdated { sn } => log::info!("[{}] SN set to {}", device, sn),
        ConnectionEventKind::Message(msg) => {
            log::debug!("[{}] unsolicited `{}` #{}", device, msg.code, msg.id)
        }
    }
}
