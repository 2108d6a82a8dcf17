use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8818;
pub const DEFAULT_USER: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin1";

/// User name that marks the shared-secret login scheme.
pub const AUTH_CODE_USER: &str = "AUTH_CODE";

/// One device entry of the devices file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// User-friendly label, unique within the file
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Expected device serial. Empty or missing means "accept whatever
    /// the device reports".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            sn: None,
            user: None,
            password: None,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    /// Configured serial, ignoring empty strings.
    pub fn expected_sn(&self) -> Option<&str> {
        self.sn.as_deref().filter(|sn| !sn.is_empty())
    }

    /// Login credentials: explicit user/password first, then the shared auth
    /// code, then the factory defaults.
    pub fn credentials(&self, auth_code: Option<&str>) -> Credentials {
        match (&self.user, &self.password, auth_code) {
            (Some(user), password, _) => Credentials {
                user: user.clone(),
                password: password.clone().unwrap_or_default(),
            },
            (None, _, Some(code)) => Credentials {
                user: AUTH_CODE_USER.to_string(),
                password: code.to_string(),
            },
            (None, Some(password), None) => Credentials {
                user: DEFAULT_USER.to_string(),
                password: password.clone(),
            },
            (None, None, None) => Credentials::default(),
        }
    }

    /// Whether an existing connection built from `self` can serve `other`.
    pub fn same_target(&self, other: &DeviceConfig) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.sn == other.sn
            && self.user == other.user
            && self.password == other.password
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            password: DEFAULT_PASSWORD.to_string(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// The devices file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DevicesFile {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_code: Option<String>,
    /// Name of the device to connect to when none is given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

impl DevicesFile {
    pub fn parse(content: &str) -> Result<Self> {
        let file: DevicesFile =
            serde_json::from_str(content).context("Devices file is not valid JSON")?;
        let mut seen = std::collections::HashSet::new();
        for device in &file.devices {
            if !seen.insert(device.name.as_str()) {
                anyhow::bail!("Duplicate device name `{}`", device.name);
            }
        }
        Ok(file)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read devices file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid devices file {}", path.display()))
    }

    /// Record the serial a device was confirmed to have. Returns whether
    /// anything changed.
    pub fn update_sn(&mut self, name: &str, sn: &str) -> bool {
        match self.devices.iter_mut().find(|d| d.name == name) {
            Some(device) if device.sn.as_deref() != Some(sn) => {
                device.sn = Some(sn.to_string());
                true
            }
            _ => false,
        }
    }

    pub fn find(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.devices.iter().map(|d| d.name.as_str()).collect()
    }

    /// The `default` device, or the first one when no default is set.
    pub fn default_device(&self) -> Option<&DeviceConfig> {
        match &self.default {
            Some(name) => self.find(name),
            None => self.devices.first(),
        }
    }
}

/// Tunables of a single connection.
#[derive(Clone, Debug)]
pub struct ConnectionOptions {
    /// Delay before re-opening a socket that closed on its own.
    pub reconnect_delay: Duration,
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
    /// Pause between stop and start in `restart_app`.
    pub restart_delay: Duration,
    /// Maximum number of buffered event records; oldest are evicted first.
    pub event_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(3000),
            request_timeout: Duration::from_secs(30),
            restart_delay: Duration::from_millis(1000),
            event_capacity: 1000,
        }
    }
}
