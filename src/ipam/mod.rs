// IPAM delegation
// Builds the request payload for the host-local delegate and invokes it via
// the CNI process-delegation protocol: config JSON on stdin, result or error
// object on stdout.

use crate::cni::{CmdArgs, CniRoute, TypedError, SUPPORTED_CNI_VERSION};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

pub const DELEGATE_PLUGIN: &str = "host-local";

/// Covers the full IPv4 space. Used for every DEL so that releasing an
/// address never depends on subnet discovery succeeding; the fabric daemon
/// may be down, or the host subnet may have changed since the ADD.
pub const WILDCARD_SUBNET: &str = "0.0.0.0/0";

#[derive(Debug, Clone, Serialize)]
pub struct DelegateConf {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub name: String,
    pub ipam: IpamConf,
}

#[derive(Debug, Clone, Serialize)]
pub struct IpamConf {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub subnet: String,
    pub routes: Vec<CniRoute>,
    #[serde(rename = "dataDir")]
    pub data_dir: String,
}

/// Pure payload builder; no side effects, no discovery, no filesystem.
pub struct IpamConfigGenerator;

impl IpamConfigGenerator {
    pub fn generate(subnet: &str, network_name: &str, data_dir: &str) -> DelegateConf {
        DelegateConf {
            cni_version: SUPPORTED_CNI_VERSION.to_string(),
            name: network_name.to_string(),
            ipam: IpamConf {
                plugin_type: DELEGATE_PLUGIN.to_string(),
                subnet: subnet.to_string(),
                routes: vec![CniRoute {
                    dst: WILDCARD_SUBNET.to_string(),
                    gw: String::new(),
                }],
                data_dir: data_dir.to_string(),
            },
        }
    }
}

/// Allocation result decoded from the delegate's stdout.
#[derive(Debug, Clone, Deserialize)]
pub struct IpamResult {
    #[serde(default)]
    pub ips: Vec<IpamIp>,
    #[serde(default)]
    pub routes: Vec<CniRoute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IpamIp {
    #[serde(default)]
    pub version: String,
    pub address: String,
    #[serde(default)]
    pub gateway: String,
}

#[derive(Debug)]
pub enum IpamError {
    /// The delegate binary is not on the plugin search path.
    MissingPlugin { plugin: String, path: String },
    /// The delegate could not be spawned or its pipes broke.
    Exec(std::io::Error),
    /// The delegate ran and reported a failure; carries its verbatim error.
    Delegate { msg: String, details: String },
    /// The delegate's output was not a decodable result.
    Decode(serde_json::Error),
}

impl fmt::Display for IpamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpamError::MissingPlugin { plugin, path } => {
                write!(f, "failed to find plugin {:?} in path [{}]", plugin, path)
            }
            IpamError::Exec(e) => write!(f, "executing delegate: {}", e),
            IpamError::Delegate { msg, details } => {
                if details.is_empty() {
                    write!(f, "{}", msg)
                } else {
                    write!(f, "{}; {}", msg, details)
                }
            }
            IpamError::Decode(e) => write!(f, "decoding delegate result: {}", e),
        }
    }
}

impl std::error::Error for IpamError {}

/// Runs the external address-management plugin.
pub struct IpamDelegate {
    pub plugin: String,
}

impl Default for IpamDelegate {
    fn default() -> Self {
        Self {
            plugin: DELEGATE_PLUGIN.to_string(),
        }
    }
}

impl IpamDelegate {
    pub async fn add(&self, args: &CmdArgs, conf: &DelegateConf) -> Result<IpamResult, IpamError> {
        let stdout = self.invoke("ADD", args, conf).await?;
        serde_json::from_slice(&stdout).map_err(IpamError::Decode)
    }

    pub async fn del(&self, args: &CmdArgs, conf: &DelegateConf) -> Result<(), IpamError> {
        self.invoke("DEL", args, conf).await.map(|_| ())
    }

    async fn invoke(
        &self,
        command: &str,
        args: &CmdArgs,
        conf: &DelegateConf,
    ) -> Result<Vec<u8>, IpamError> {
        let binary = find_in_cni_path(&self.plugin, &args.cni_path).ok_or_else(|| {
            IpamError::MissingPlugin {
                plugin: self.plugin.clone(),
                path: args.cni_path.clone(),
            }
        })?;

        let payload = serde_json::to_vec(conf).map_err(IpamError::Decode)?;

        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", &args.container_id)
            .env("CNI_NETNS", &args.netns)
            .env("CNI_IFNAME", &args.if_name)
            .env("CNI_PATH", &args.cni_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(IpamError::Exec)?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        stdin.write_all(&payload).await.map_err(IpamError::Exec)?;
        drop(stdin);

        let output = child.wait_with_output().await.map_err(IpamError::Exec)?;
        if !output.status.success() {
            return Err(delegate_error(&output.stdout, &output.stderr));
        }
        Ok(output.stdout)
    }
}

/// A failing delegate prints a CNI error object on stdout. Fall back to the
/// raw output when it does not.
fn delegate_error(stdout: &[u8], stderr: &[u8]) -> IpamError {
    if let Ok(err) = serde_json::from_slice::<TypedError>(stdout) {
        return IpamError::Delegate {
            msg: err.msg,
            details: err.details,
        };
    }
    let raw = if stdout.is_empty() { stderr } else { stdout };
    IpamError::Delegate {
        msg: String::from_utf8_lossy(raw).trim().to_string(),
        details: String::new(),
    }
}

fn find_in_cni_path(plugin: &str, cni_path: &str) -> Option<PathBuf> {
    cni_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| PathBuf::from(dir).join(plugin))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_subnet_and_data_dir_verbatim() {
        let conf = IpamConfigGenerator::generate("10.255.30.0/24", "weft", "/var/lib/cni/ipam");
        assert_eq!(conf.ipam.subnet, "10.255.30.0/24");
        assert_eq!(conf.ipam.data_dir, "/var/lib/cni/ipam");
        assert_eq!(conf.name, "weft");
        assert_eq!(conf.ipam.plugin_type, "host-local");
    }

    #[test]
    fn payload_is_independent_of_other_inputs() {
        let a = IpamConfigGenerator::generate("10.255.30.0/24", "first", "/data");
        let b = IpamConfigGenerator::generate("10.255.30.0/24", "second", "/data");
        assert_eq!(a.ipam.subnet, b.ipam.subnet);
        assert_eq!(a.ipam.data_dir, b.ipam.data_dir);
    }

    #[test]
    fn payload_serializes_with_cni_field_names() {
        let conf = IpamConfigGenerator::generate("10.255.30.0/24", "weft", "/data");
        let json = serde_json::to_value(&conf).unwrap();
        assert_eq!(json["cniVersion"], "0.3.1");
        assert_eq!(json["ipam"]["type"], "host-local");
        assert_eq!(json["ipam"]["subnet"], "10.255.30.0/24");
        assert_eq!(json["ipam"]["dataDir"], "/data");
        assert_eq!(json["ipam"]["routes"][0]["dst"], "0.0.0.0/0");
    }

    #[test]
    fn wildcard_subnet_covers_everything() {
        let conf = IpamConfigGenerator::generate(WILDCARD_SUBNET, "weft", "/data");
        assert_eq!(conf.ipam.subnet, "0.0.0.0/0");
    }

    #[test]
    fn delegate_error_prefers_the_error_object() {
        let stdout = br#"{"code": 11, "msg": "invalid CIDR address: 10.255.30.0/33", "details": ""}"#;
        let err = delegate_error(stdout, b"");
        assert_eq!(err.to_string(), "invalid CIDR address: 10.255.30.0/33");
    }

    #[test]
    fn delegate_error_joins_msg_and_details() {
        let stdout = br#"{"code": 11, "msg": "failed to allocate", "details": "no IP addresses available"}"#;
        let err = delegate_error(stdout, b"");
        assert_eq!(
            err.to_string(),
            "failed to allocate; no IP addresses available"
        );
    }

    #[test]
    fn delegate_error_falls_back_to_raw_output() {
        let err = delegate_error(b"", b"panic: something broke\n");
        assert_eq!(err.to_string(), "panic: something broke");
    }

    #[test]
    fn missing_plugin_names_the_search_path() {
        let err = IpamError::MissingPlugin {
            plugin: "host-local".to_string(),
            path: "/opt/cni/bin".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to find plugin \"host-local\" in path [/opt/cni/bin]"
        );
    }

    #[test]
    fn find_in_cni_path_searches_each_directory() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join("host-local");
        std::fs::write(&binary, b"#!/bin/sh\n").unwrap();

        let path = format!("/nonexistent:{}", dir.path().display());
        assert_eq!(find_in_cni_path("host-local", &path), Some(binary));
        assert_eq!(find_in_cni_path("host-local", "/nonexistent"), None);
        assert_eq!(find_in_cni_path("host-local", ""), None);
    }

    #[test]
    fn ipam_result_decodes_a_delegate_reply() {
        let result: IpamResult = serde_json::from_str(
            r#"{
                "cniVersion": "0.3.1",
                "ips": [{"version": "4", "address": "10.255.30.2/24", "gateway": "10.255.30.1"}],
                "routes": [{"dst": "0.0.0.0/0"}],
                "dns": {}
            }"#,
        )
        .unwrap();
        assert_eq!(result.ips.len(), 1);
        assert_eq!(result.ips[0].address, "10.255.30.2/24");
        assert_eq!(result.routes[0].dst, "0.0.0.0/0");
    }
}
