use std::{fmt, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown operation mode: {0:?}")]
    UnknownMode(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const DEFAULT_LEFT_INTERFACE: &str = "eth0";
pub const DEFAULT_RIGHT_INTERFACE: &str = "eth1";

/// How the emulator is placed between the left and the right network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OperationMode {
    /// Both interfaces joined in a bridge.
    Bridged,
    /// Both interfaces addressed, traffic routed by the host.
    #[default]
    Routed,
    /// Routed through VLANs, with the public namespace and real uplinks.
    Extended,
}

impl OperationMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bridged => "bridged",
            Self::Routed => "routed",
            Self::Extended => "extended",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bridged" => Ok(Self::Bridged),
            "routed" => Ok(Self::Routed),
            "extended" => Ok(Self::Extended),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// Host configuration, read from a JSON file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub extended: ExtendedConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralConfig {
    pub left_endpoint_ip: String,
    pub right_endpoint_ip: String,
    /// Address with prefix length, e.g. `10.0.1.1/24`.
    pub left_interface_address: String,
    pub right_interface_address: String,
    #[serde(default = "default_left_interface")]
    pub left_interface: String,
    #[serde(default = "default_right_interface")]
    pub right_interface: String,
}

fn default_left_interface() -> String {
    DEFAULT_LEFT_INTERFACE.to_string()
}

fn default_right_interface() -> String {
    DEFAULT_RIGHT_INTERFACE.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedConfig {
    pub left_vlan: u16,
    pub right_vlan: u16,
    pub public_interface: PublicInterface,
    pub right_netns_address: String,
    #[serde(default)]
    pub configs: Vec<UplinkConfig>,
}

/// Uplink of the public namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicInterface {
    pub address: String,
    pub gateway: String,
    pub vlan: u16,
}

impl PublicInterface {
    /// The address without prefix length.
    pub fn public_ip(&self) -> &str {
        self.address.split('/').next().unwrap_or(&self.address)
    }

    pub fn interface_name(&self) -> String {
        vlan_interface_name(self.vlan)
    }
}

/// A real upstream path, reached through a VLAN on the right interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkConfig {
    pub name: String,
    pub vlan: u16,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl UplinkConfig {
    pub fn interface_name(&self) -> String {
        vlan_interface_name(self.vlan)
    }
}

/// Name of the VLAN device created for `vlan`.
pub fn vlan_interface_name(vlan: u16) -> String {
    format!("vlan{vlan}-d")
}

impl Config {
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await?;
        contents.parse()
    }

    pub fn left_interface(&self) -> &str {
        &self.general.left_interface
    }

    pub fn right_interface(&self) -> &str {
        &self.general.right_interface
    }

    /// VLAN sub-interface of the left interface, e.g. `eth0.100`.
    pub fn left_vlan_interface(&self) -> String {
        format!("{}.{}", self.general.left_interface, self.extended.left_vlan)
    }

    pub fn right_vlan_interface(&self) -> String {
        format!("{}.{}", self.general.right_interface, self.extended.right_vlan)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}
