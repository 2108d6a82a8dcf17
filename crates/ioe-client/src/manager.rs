use anyhow::{Context, Result};
use ioe_core::client::{Connection, ConnectionEvent, ConnectionEventKind, ConnectionStatus};
use ioe_core::config::{ConnectionOptions, DevicesFile};
use std::collections::HashMap;
use std::sync::Arc;

/// Owns every device connection, keyed by device name.
///
/// All connections share one runtime and report on one event channel, so a
/// single consumer sees everything. Connections are created on demand and
/// reused while their config is unchanged.
pub struct DeviceManager {
    devices: DevicesFile,
    options: ConnectionOptions,
    connections: HashMap<String, Connection>,
    /// Kept alive for the connections when the manager built its own.
    _runtime: Option<Arc<tokio::runtime::Runtime>>,
    handle: tokio::runtime::Handle,
    event_tx: async_channel::Sender<ConnectionEvent>,
    event_rx: async_channel::Receiver<ConnectionEvent>,
}

impl DeviceManager {
    /// Build a manager with its own background runtime.
    pub fn new(devices: DevicesFile, options: ConnectionOptions) -> Result<Self> {
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .thread_name("ioe-client")
                .build()
                .context("Failed to create tokio runtime for device client")?,
        );
        let handle = runtime.handle().clone();
        Ok(Self::build(devices, options, handle, Some(runtime)))
    }

    /// Build a manager that spawns onto an existing runtime.
    pub fn with_handle(
        devices: DevicesFile,
        options: ConnectionOptions,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self::build(devices, options, handle, None)
    }

    fn build(
        devices: DevicesFile,
        options: ConnectionOptions,
        handle: tokio::runtime::Handle,
        runtime: Option<Arc<tokio::runtime::Runtime>>,
    ) -> Self {
        let (event_tx, event_rx) = async_channel::bounded::<ConnectionEvent>(256);
        Self {
            devices,
            options,
            connections: HashMap::new(),
            _runtime: runtime,
            handle,
            event_tx,
            event_rx,
        }
    }

    /// Merged event stream of all connections.
    pub fn events(&self) -> async_channel::Receiver<ConnectionEvent> {
        self.event_rx.clone()
    }

    pub fn devices(&self) -> &DevicesFile {
        &self.devices
    }

    pub fn runtime(&self) -> &tokio::runtime::Handle {
        &self.handle
    }

    /// Connection for `name`, opening one if needed. An existing connection
    /// is reused as long as it still points at the configured target.
    pub fn connect(&mut self, name: &str) -> Result<Connection> {
        let config = self
            .devices
            .find(name)
            .cloned()
            .with_context(|| format!("Unknown device `{}`", name))?;

        if let Some(conn) = self.connections.get(name) {
            if !conn.is_closed() && conn.config().same_target(&config) {
                return Ok(conn.clone());
            }
        }
        if let Some(stale) = self.connections.remove(name) {
            log::info!("Replacing connection to {}", name);
            stale.close();
        }

        let credentials = config.credentials(self.devices.auth_code.as_deref());
        let conn = Connection::new(
            config,
            credentials,
            self.options.clone(),
            self.handle.clone(),
            self.event_tx.clone(),
        );
        conn.connect()?;
        self.connections.insert(name.to_string(), conn.clone());
        Ok(conn)
    }

    /// Connect the `default` device, or the first one in the file.
    pub fn connect_default(&mut self) -> Result<Connection> {
        let name = self
            .devices
            .default_device()
            .map(|d| d.name.clone())
            .context("No device configured")?;
        self.connect(&name)
    }

    pub fn get(&self, name: &str) -> Option<&Connection> {
        self.connections.get(name)
    }

    /// Names of the devices with a logged-in session, sorted.
    pub fn connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.status().is_logged_in())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Close and forget the connection for `name`.
    pub fn disconnect(&mut self, name: &str) -> bool {
        match self.connections.remove(name) {
            Some(conn) => {
                conn.close();
                true
            }
            None => false,
        }
    }

    /// (name, status) of every connection, sorted by name.
    pub fn statuses(&self) -> Vec<(String, ConnectionStatus)> {
        let mut out: Vec<_> = self
            .connections
            .iter()
            .map(|(name, conn)| (name.clone(), conn.status()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Swap in a re-read devices file. Connections whose device vanished or
    /// now points elsewhere are closed.
    pub fn reload(&mut self, devices: DevicesFile) {
        let stale: Vec<String> = self
            .connections
            .iter()
            .filter(|(name, conn)| match devices.find(name) {
                Some(config) => !conn.config().same_target(config),
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            log::info!("Device {} changed, closing its connection", name);
            self.disconnect(&name);
        }
        self.devices = devices;
    }

    /// Bookkeeping for events that concern the manager itself. Call for
    /// every event taken from `events()`.
    ///
    /// A confirmed serial is recorded in the in-memory device list so the
    /// connection keeps being reused; writing it to disk is up to the host.
    pub fn handle_event(&mut self, event: &ConnectionEvent) {
        if let ConnectionEventKind::SnUpdated { sn } = &event.kind {
            if self.devices.update_sn(&event.device, sn) {
                log::info!("Device {} serial is now {}", event.device, sn);
            }
        }
    }

    /// Close every connection.
    pub fn dispose(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.close();
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
