// Attachment configuration
// One immutable descriptor per ADD, combining the invocation arguments, the
// discovered network info, and the delegate's allocation result. Every
// downstream step consumes it; nothing mutates it after construction.

pub mod devname;
pub mod hwaddr;

use crate::cni::{CmdArgs, CniInterface, CniIp, CniResult, CniRoute, SUPPORTED_CNI_VERSION};
use crate::config::devname::DeviceNameGenerator;
use crate::config::hwaddr::HardwareAddressGenerator;
use crate::ipam::IpamResult;
use std::fs::File;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Kernel interface-name limit, excluding the trailing NUL.
pub const MAX_IF_NAME_LEN: usize = libc::IFNAMSIZ as usize - 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IfName cannot be longer than 15 characters")]
    IfNameTooLong,
    #[error("opening network namespace {path}: {source}")]
    OpenNetns {
        path: String,
        source: std::io::Error,
    },
    #[error("ipam result contains no IPv4 address")]
    MissingAllocation,
    #[error("{0}")]
    InvalidCidr(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrAddress {
    pub ip: Ipv4Addr,
    pub prefix: u8,
}

impl std::fmt::Display for CidrAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouteConfig {
    pub dst: CidrAddress,
    pub gw: Option<Ipv4Addr>,
}

#[derive(Debug)]
pub struct ContainerConfig {
    /// Path of the target network namespace.
    pub netns_path: String,
    /// Open handle on the target namespace; held for the invocation's
    /// lifetime so the namespace cannot vanish mid-attach.
    pub netns: File,
    /// Name the veth end carries while still in the host namespace.
    pub temp_if_name: String,
    /// Name requested by the runtime, applied after the move.
    pub if_name: String,
    pub hardware_addr: [u8; 6],
    pub address: CidrAddress,
    pub gateway: Option<Ipv4Addr>,
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug)]
pub struct HostConfig {
    pub if_name: String,
    pub hardware_addr: [u8; 6],
}

#[derive(Debug)]
pub struct AttachmentConfig {
    pub container: ContainerConfig,
    pub host: HostConfig,
    pub ifb_if_name: String,
    pub mtu: u32,
}

impl AttachmentConfig {
    pub fn as_cni_result(&self, cni_version: &str) -> CniResult {
        let version = if cni_version.is_empty() {
            SUPPORTED_CNI_VERSION
        } else {
            cni_version
        };

        CniResult {
            cni_version: version.to_string(),
            interfaces: vec![
                CniInterface {
                    name: self.host.if_name.clone(),
                    mac: HardwareAddressGenerator::format(&self.host.hardware_addr),
                    sandbox: String::new(),
                },
                CniInterface {
                    name: self.container.if_name.clone(),
                    mac: HardwareAddressGenerator::format(&self.container.hardware_addr),
                    sandbox: self.container.netns_path.clone(),
                },
            ],
            ips: vec![CniIp {
                version: "4".to_string(),
                interface: Some(1),
                address: self.container.address.to_string(),
                gateway: self
                    .container
                    .gateway
                    .map(|gw| gw.to_string())
                    .unwrap_or_default(),
            }],
            routes: self
                .container
                .routes
                .iter()
                .map(|route| CniRoute {
                    dst: route.dst.to_string(),
                    gw: route.gw.map(|gw| gw.to_string()).unwrap_or_default(),
                })
                .collect(),
        }
    }
}

/// Builds the AttachmentConfig. All input validation lives here so that
/// kernel calls only ever see values the kernel will accept.
pub struct ConfigCreator;

impl ConfigCreator {
    pub fn create(
        &self,
        args: &CmdArgs,
        allocation: &IpamResult,
        mtu: u32,
    ) -> Result<AttachmentConfig, ConfigError> {
        if args.if_name.len() > MAX_IF_NAME_LEN {
            return Err(ConfigError::IfNameTooLong);
        }

        let allocated = allocation
            .ips
            .iter()
            .find(|ip| ip.version.is_empty() || ip.version == "4")
            .ok_or(ConfigError::MissingAllocation)?;
        let (ip, prefix) =
            parse_ipv4_cidr(&allocated.address).map_err(ConfigError::InvalidCidr)?;
        let address = CidrAddress { ip, prefix };

        let gateway = if allocated.gateway.is_empty() {
            None
        } else {
            Some(
                allocated
                    .gateway
                    .parse::<Ipv4Addr>()
                    .map_err(|e| ConfigError::InvalidCidr(format!("invalid gateway: {}", e)))?,
            )
        };

        let mut routes = Vec::with_capacity(allocation.routes.len());
        for route in &allocation.routes {
            let (dst_ip, dst_prefix) =
                parse_ipv4_cidr(&route.dst).map_err(ConfigError::InvalidCidr)?;
            let gw = if route.gw.is_empty() {
                None
            } else {
                Some(
                    route
                        .gw
                        .parse::<Ipv4Addr>()
                        .map_err(|e| ConfigError::InvalidCidr(format!("invalid gateway: {}", e)))?,
                )
            };
            routes.push(RouteConfig {
                dst: CidrAddress {
                    ip: dst_ip,
                    prefix: dst_prefix,
                },
                gw,
            });
        }

        let netns = File::open(&args.netns).map_err(|source| ConfigError::OpenNetns {
            path: args.netns.clone(),
            source,
        })?;

        let handle = args.handle();
        Ok(AttachmentConfig {
            container: ContainerConfig {
                netns_path: args.netns.clone(),
                netns,
                temp_if_name: DeviceNameGenerator::generate_temporary_for_container(&handle),
                if_name: args.if_name.clone(),
                hardware_addr: HardwareAddressGenerator::generate_for_container(ip),
                address,
                gateway,
                routes,
            },
            host: HostConfig {
                if_name: DeviceNameGenerator::generate_for_host(&handle),
                hardware_addr: HardwareAddressGenerator::generate_for_host(ip),
            },
            ifb_if_name: DeviceNameGenerator::generate_for_ifb(&handle),
            mtu,
        })
    }
}

/// Parse a CIDR string like "10.255.30.0/24" into (Ipv4Addr, prefix_len).
pub fn parse_ipv4_cidr(cidr: &str) -> Result<(Ipv4Addr, u8), String> {
    let parts: Vec<&str> = cidr.split('/').collect();
    if parts.len() != 2 {
        return Err(format!("invalid CIDR: {}", cidr));
    }
    let ip: Ipv4Addr = parts[0]
        .parse()
        .map_err(|e| format!("invalid IP in CIDR: {}", e))?;
    let prefix_len: u8 = parts[1]
        .parse()
        .map_err(|_| format!("invalid prefix length: {}", parts[1]))?;
    if prefix_len > 32 {
        return Err(format!("invalid prefix length /{}", prefix_len));
    }
    Ok((ip, prefix_len))
}
