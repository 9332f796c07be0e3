//! Node configuration.
//!
//! Stored as TOML, `javelin.toml` in the working directory unless another
//! path is given on the command line. A missing file is created with
//! defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use javelin_protocol::Credentials;
use javelin_protocol::constants::{DEFAULT_ADDRESS, DEFAULT_PORT, DEFAULT_WORKERS};
use javelin_socket::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};

/// Which socket the node runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Networking disabled.
    #[default]
    None,
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub mode: Mode,

    /// Worker pool size of the socket.
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub always_allow_local_connections: bool,

    #[serde(default = "default_true")]
    pub local_broadcast: bool,

    /// JSON file holding the accepted users.
    #[serde(default = "default_users_file")]
    pub users_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_address")]
    pub address: String,

    #[serde(default)]
    pub username: String,

    /// Without a password the client connects anonymously.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default)]
    pub local_broadcast: bool,

    /// Reconnect when the connection is lost.
    #[serde(default = "default_true")]
    pub auto_restart: bool,

    #[serde(default = "default_restart_interval")]
    pub restart_interval_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_users_file() -> PathBuf {
    PathBuf::from("users.json")
}

fn default_address() -> String {
    DEFAULT_ADDRESS.into()
}

fn default_restart_interval() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            workers: default_workers(),
            server: ServerSection::default(),
            client: ClientSection::default(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            always_allow_local_connections: false,
            local_broadcast: true,
            users_file: default_users_file(),
        }
    }
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            username: String::new(),
            password: None,
            local_broadcast: false,
            auto_restart: true,
            restart_interval_secs: default_restart_interval(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl NodeConfig {
    /// Loads configuration from `path`, or creates a default if not found.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = NodeConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // May contain the client password.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: self.server.port,
            workers: self.workers,
            always_allow_local_connections: self.server.always_allow_local_connections,
            local_broadcast: self.server.local_broadcast,
        }
    }

    /// Fails if the configured username is not usable in a handshake.
    pub fn client_config(&self) -> anyhow::Result<ClientConfig> {
        let credentials = match &self.client.password {
            Some(password) => Some(Credentials::new(
                self.client.username.clone(),
                password.clone(),
            )?),
            None => None,
        };
        Ok(ClientConfig {
            address: self.client.address.clone(),
            credentials,
            workers: self.workers,
            local_broadcast: self.client.local_broadcast,
            connect_timeout: Duration::from_secs(self.client.connect_timeout_secs),
        })
    }

    pub fn restart_interval(&self) -> Duration {
        Duration::from_secs(self.client.restart_interval_secs.max(1))
    }
}
