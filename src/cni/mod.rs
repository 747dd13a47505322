// CNI invocation surface
// Environment intake, stdin config, and the result/error payloads the
// runtime consumes on stdout.

use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::path::Path;

/// The CNI protocol version this plugin implements and reports.
pub const SUPPORTED_CNI_VERSION: &str = "0.3.1";

/// Per-invocation context delivered through the CNI environment variables.
#[derive(Debug, Clone)]
pub struct CmdArgs {
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub cni_path: String,
}

impl CmdArgs {
    /// Read the invocation context from the environment. `CNI_NETNS` may be
    /// absent on DEL (the runtime retries teardown after the sandbox is
    /// gone), so only the interface name is hard-required.
    pub fn from_env() -> Result<Self, String> {
        let if_name = env::var("CNI_IFNAME").unwrap_or_default();
        if if_name.is_empty() {
            return Err("required env variable CNI_IFNAME missing".to_string());
        }
        Ok(Self {
            container_id: env::var("CNI_CONTAINERID").unwrap_or_default(),
            netns: env::var("CNI_NETNS").unwrap_or_default(),
            if_name,
            cni_path: env::var("CNI_PATH").unwrap_or_default(),
        })
    }

    /// The lease-store key: the base name of the namespace path.
    pub fn handle(&self) -> String {
        Path::new(&self.netns)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.netns.clone())
    }
}

/// Network configuration arriving as JSON on stdin.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    #[serde(default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(default)]
    pub data_dir: String,
    #[serde(default)]
    pub subnet_file: String,
    #[serde(default)]
    pub mtu: i64,
    #[serde(default)]
    pub datastore: String,
    #[serde(default)]
    pub daemon_port: u16,
    #[serde(default)]
    pub bandwidth_limits: BandwidthLimits,
}

/// Rate is bits per second, burst is bytes. Shaping engages only when both
/// are positive.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct BandwidthLimits {
    #[serde(default)]
    pub rate: i64,
    #[serde(default)]
    pub burst: i64,
}

/// The sole externally observable failure shape. Printed as JSON on stdout
/// with exit code 1; the calling runtime matches on `msg` and `details`.
#[derive(Debug, Serialize, Deserialize)]
pub struct TypedError {
    pub code: u32,
    pub msg: String,
    #[serde(default)]
    pub details: String,
}

impl TypedError {
    pub fn new(stage: &str, cause: impl fmt::Display) -> Self {
        Self {
            code: 100,
            msg: stage.to_string(),
            details: cause.to_string(),
        }
    }
}

impl fmt::Display for TypedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.details.is_empty() {
            write!(f, "{}", self.msg)
        } else {
            write!(f, "{}; {}", self.msg, self.details)
        }
    }
}

impl std::error::Error for TypedError {}

/// Successful ADD result describing the attached interfaces and addresses.
#[derive(Debug, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    #[serde(default)]
    pub ips: Vec<CniIp>,
    #[serde(default)]
    pub routes: Vec<CniRoute>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CniIp {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<u32>,
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniRoute {
    pub dst: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gw: String,
}

/// Reply to the protocol's VERSION command.
#[derive(Debug, Serialize)]
pub struct VersionReply {
    #[serde(rename = "cniVersion")]
    pub cni_version: &'static str,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<&'static str>,
}

impl VersionReply {
    pub fn current() -> Self {
        Self {
            cni_version: SUPPORTED_CNI_VERSION,
            supported_versions: vec![SUPPORTED_CNI_VERSION],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netconf_parses_all_fields() {
        let conf: NetConf = serde_json::from_str(
            r#"{
                "cniVersion": "0.3.1",
                "name": "weft",
                "type": "weft-cni",
                "dataDir": "/var/lib/cni/ipam",
                "subnetFile": "/run/weft/subnet.env",
                "mtu": 1450,
                "datastore": "/var/lib/weft/store.json",
                "daemonPort": 23954,
                "bandwidthLimits": { "rate": 1000000, "burst": 8000 }
            }"#,
        )
        .unwrap();

        assert_eq!(conf.name, "weft");
        assert_eq!(conf.data_dir, "/var/lib/cni/ipam");
        assert_eq!(conf.subnet_file, "/run/weft/subnet.env");
        assert_eq!(conf.mtu, 1450);
        assert_eq!(conf.daemon_port, 23954);
        assert_eq!(conf.bandwidth_limits.rate, 1000000);
        assert_eq!(conf.bandwidth_limits.burst, 8000);
    }

    #[test]
    fn netconf_defaults_optional_fields() {
        let conf: NetConf = serde_json::from_str(r#"{"name": "weft"}"#).unwrap();
        assert_eq!(conf.subnet_file, "");
        assert_eq!(conf.mtu, 0);
        assert_eq!(conf.daemon_port, 0);
        assert_eq!(conf.bandwidth_limits.rate, 0);
        assert_eq!(conf.bandwidth_limits.burst, 0);
    }

    #[test]
    fn typed_error_serializes_to_the_wire_shape() {
        let err = TypedError::new("discovering network info", "open /x: no such file");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "code": 100,
                "msg": "discovering network info",
                "details": "open /x: no such file"
            })
        );
    }

    #[test]
    fn handle_is_the_netns_base_name() {
        let args = CmdArgs {
            container_id: "apricot".to_string(),
            netns: "/var/run/netns/cni-4f12".to_string(),
            if_name: "eth0".to_string(),
            cni_path: "/opt/cni/bin".to_string(),
        };
        assert_eq!(args.handle(), "cni-4f12");
    }
}
