// Overlay network discovery
// Resolves the host's overlay subnet and MTU from a flannel-style subnet
// descriptor file or from the co-located weft daemon over loopback.

use crate::config::parse_ipv4_cidr;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Ethernet default, used when the subnet file carries no MTU entry and no
/// override is configured.
const DEFAULT_MTU: u32 = 1500;

const SUBNET_KEY: &str = "FLANNEL_SUBNET";
const MTU_KEY: &str = "FLANNEL_MTU";

/// Discovered fresh on every ADD, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NetworkInfo {
    pub overlay_subnet: String,
    pub mtu: u32,
}

#[derive(Debug)]
pub enum DiscoverError {
    /// The subnet descriptor file could not be read.
    Open { path: String, source: std::io::Error },
    /// The subnet descriptor file exists but does not carry a valid subnet.
    Parse,
    /// The daemon query failed in transport or decoding.
    Daemon(String),
    /// The invocation config failed validation before discovery ran.
    InvalidConfig(String),
}

impl fmt::Display for DiscoverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoverError::Open { path, source } => write!(f, "open {}: {}", path, source),
            DiscoverError::Parse => write!(f, "unable to parse flannel subnet file"),
            DiscoverError::Daemon(msg) => write!(f, "{}", msg),
            DiscoverError::InvalidConfig(detail) => write!(f, "invalid config: {}", detail),
        }
    }
}

impl std::error::Error for DiscoverError {}

/// One of the two interchangeable discovery backends, selected by
/// configuration presence: a subnet-file path picks the file backend,
/// otherwise the daemon port picks the query backend.
pub enum NetInfoSource {
    FlannelFile { path: PathBuf },
    Daemon(DaemonClient),
}

impl NetInfoSource {
    pub fn flannel_file(path: &str) -> Self {
        NetInfoSource::FlannelFile {
            path: PathBuf::from(path),
        }
    }

    pub fn daemon(port: u16) -> Result<Self, DiscoverError> {
        Ok(NetInfoSource::Daemon(DaemonClient::new(port)?))
    }

    async fn fetch(&self) -> Result<NetworkInfo, DiscoverError> {
        match self {
            NetInfoSource::FlannelFile { path } => read_flannel_file(path),
            NetInfoSource::Daemon(client) => client.fetch().await,
        }
    }
}

/// Resolves NetworkInfo from the configured backend. A nonzero MTU override
/// wins over whatever the backend reports.
pub struct Discoverer {
    pub source: NetInfoSource,
}

impl Discoverer {
    pub async fn discover(&self, mtu_override: u32) -> Result<NetworkInfo, DiscoverError> {
        let mut info = self.source.fetch().await?;
        if mtu_override > 0 {
            info.mtu = mtu_override;
        }
        Ok(info)
    }
}

fn read_flannel_file(path: &PathBuf) -> Result<NetworkInfo, DiscoverError> {
    let contents = fs::read_to_string(path).map_err(|source| DiscoverError::Open {
        path: path.display().to_string(),
        source,
    })?;

    let mut subnet = None;
    let mut mtu = None;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix(SUBNET_KEY).and_then(|r| r.strip_prefix('=')) {
            subnet = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix(MTU_KEY).and_then(|r| r.strip_prefix('=')) {
            mtu = Some(value.trim().parse::<u32>().map_err(|_| DiscoverError::Parse)?);
        }
    }

    let subnet = subnet.ok_or(DiscoverError::Parse)?;
    parse_ipv4_cidr(&subnet).map_err(|_| DiscoverError::Parse)?;

    Ok(NetworkInfo {
        overlay_subnet: subnet,
        mtu: mtu.unwrap_or(DEFAULT_MTU),
    })
}

/// Loopback query client for the weft daemon's network-info endpoint.
pub struct DaemonClient {
    url: String,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn new(port: u16) -> Result<Self, DiscoverError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| DiscoverError::Daemon(e.to_string()))?;
        Ok(Self {
            url: format!("http://127.0.0.1:{}/", port),
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> Result<NetworkInfo, DiscoverError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DiscoverError::Daemon(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoverError::Daemon(format!(
                "daemon returned status {}",
                status.as_u16()
            )));
        }

        response
            .json::<NetworkInfo>()
            .await
            .map_err(|e| DiscoverError::Daemon(e.to_string()))
    }
}
