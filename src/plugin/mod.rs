// Attachment orchestrator
// Sequences discovery, allocation, link creation, namespace setup, shaping,
// and lease recording for ADD; runs the mirrored lenient sequence for DEL.
// ADD aborts on the first failure and leaves partial state for a later DEL
// to reclaim; DEL keeps going and only a real container-link teardown
// failure is fatal.

use crate::cni::{BandwidthLimits, CmdArgs, CniResult, NetConf, TypedError};
use crate::config::ConfigCreator;
use crate::ipam::{IpamConfigGenerator, IpamDelegate, WILDCARD_SUBNET};
use crate::net::bandwidth::{Bandwidth, IfbCreator};
use crate::net::container::Container;
use crate::net::host::Host;
use crate::net::veth::VethPairCreator;
use crate::net::{LinkOps, NetworkResult};
use crate::netinfo::{DiscoverError, Discoverer, NetInfoSource, NetworkInfo};
use crate::store::Store;
use std::fs::File;
use std::sync::Arc;

pub struct Plugin {
    pub config_creator: ConfigCreator,
    pub veth_pair_creator: VethPairCreator,
    pub host: Host,
    pub ifb_creator: IfbCreator,
    pub container: Container,
    pub bandwidth: Bandwidth,
    pub ipam: IpamDelegate,
    pub store: Store,
}

impl Plugin {
    pub fn new() -> NetworkResult<Self> {
        let link_ops = Arc::new(LinkOps::new()?);
        Ok(Self {
            config_creator: ConfigCreator,
            veth_pair_creator: VethPairCreator {
                link_ops: link_ops.clone(),
            },
            host: Host {
                link_ops: link_ops.clone(),
            },
            ifb_creator: IfbCreator {
                link_ops: link_ops.clone(),
            },
            container: Container { link_ops },
            bandwidth: Bandwidth,
            ipam: IpamDelegate::default(),
            store: Store,
        })
    }

    /// Attach: strict-abort state machine. Any failure surfaces as a
    /// TypedError naming the stage; no compensating cleanup runs here. The
    /// runtime's contract is to issue a DEL after a failed ADD.
    pub async fn cmd_add(&self, args: &CmdArgs, conf: &NetConf) -> Result<CniResult, TypedError> {
        let info = self
            .network_info(conf)
            .await
            .map_err(|e| TypedError::new("discovering network info", e))?;

        let ipam_conf =
            IpamConfigGenerator::generate(&info.overlay_subnet, &conf.name, &conf.data_dir);
        let allocation = self
            .ipam
            .add(args, &ipam_conf)
            .await
            .map_err(|e| TypedError::new("ipam plugin failed", e))?;

        let cfg = self
            .config_creator
            .create(args, &allocation, info.mtu)
            .map_err(|e| TypedError::new("creating config", e))?;

        self.veth_pair_creator
            .create(&cfg)
            .await
            .map_err(|e| TypedError::new("creating veth pair", e))?;

        self.host
            .setup(&cfg)
            .await
            .map_err(|e| TypedError::new("set up host", e))?;

        if bandwidth_configured(&conf.bandwidth_limits) {
            let BandwidthLimits { rate, burst } = conf.bandwidth_limits;
            self.ifb_creator
                .create(&cfg)
                .await
                .map_err(|e| TypedError::new("set up ifb", e))?;
            self.bandwidth
                .inbound_setup(rate, burst, &cfg)
                .await
                .map_err(|e| TypedError::new("set up inbound bandwidth limiting", e))?;
            self.bandwidth
                .outbound_setup(rate, burst, &cfg)
                .await
                .map_err(|e| TypedError::new("set up outbound bandwidth limiting", e))?;
        }

        self.container
            .setup(&cfg)
            .await
            .map_err(|e| TypedError::new("set up container", e))?;

        self.store
            .add(
                &conf.datastore,
                &args.handle(),
                &cfg.container.address.ip.to_string(),
                None,
            )
            .map_err(|e| TypedError::new("write container metadata", e))?;

        Ok(cfg.as_cni_result(&conf.cni_version))
    }

    /// Detach: best-effort. Every step runs regardless of earlier failures;
    /// nonfatal problems are logged and the invocation still succeeds. The
    /// one fatal path is a real (non-absence) container-link teardown
    /// failure.
    pub async fn cmd_del(&self, args: &CmdArgs, conf: &NetConf) -> Result<(), TypedError> {
        // The wildcard subnet keeps address release independent of subnet
        // discovery; the daemon may be down or the subnet may have changed
        // since the ADD.
        let ipam_conf = IpamConfigGenerator::generate(WILDCARD_SUBNET, &conf.name, &conf.data_dir);
        if let Err(e) = self.ipam.del(args, &ipam_conf).await {
            tracing::error!(error = %e, "host-local-ipam");
        }

        if let Err(e) = File::open(&args.netns) {
            tracing::error!(
                netns = %args.netns,
                error = %format!("open {}: {}", args.netns, e),
                "opening-netns"
            );
            return Ok(());
        }

        if let Err(e) = self.ifb_creator.teardown(&args.handle()).await {
            tracing::error!(error = %e, "delete-ifb");
        }

        self.container
            .teardown(&args.netns, &args.if_name)
            .await
            .map_err(|e| TypedError::new("teardown failed", e))?;

        if let Err(e) = self.store.delete(&conf.datastore, &args.handle()) {
            tracing::error!(error = %e, "write-container-metadata");
        }

        Ok(())
    }

    async fn network_info(&self, conf: &NetConf) -> Result<NetworkInfo, DiscoverError> {
        if conf.mtu < 0 {
            return Err(DiscoverError::InvalidConfig(
                "mtu must not be negative".to_string(),
            ));
        }

        let source = if !conf.subnet_file.is_empty() {
            NetInfoSource::flannel_file(&conf.subnet_file)
        } else {
            NetInfoSource::daemon(conf.daemon_port)?
        };

        Discoverer { source }.discover(conf.mtu as u32).await
    }
}

/// Shaping engages only when both rate and burst are positive.
pub fn bandwidth_configured(limits: &BandwidthLimits) -> bool {
    limits.rate > 0 && limits.burst > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(rate: i64, burst: i64) -> BandwidthLimits {
        BandwidthLimits { rate, burst }
    }

    #[test]
    fn shaping_needs_both_rate_and_burst() {
        assert!(bandwidth_configured(&limits(1_000_000, 8000)));
        assert!(!bandwidth_configured(&limits(0, 8000)));
        assert!(!bandwidth_configured(&limits(1_000_000, 0)));
        assert!(!bandwidth_configured(&limits(0, 0)));
        assert!(!bandwidth_configured(&limits(-1, 8000)));
    }

    #[tokio::test]
    async fn negative_mtu_is_rejected_before_discovery() {
        let plugin = match Plugin::new() {
            Ok(plugin) => plugin,
            // Netlink sockets need privileges the test environment may not
            // grant; the validation under test never reaches the kernel.
            Err(_) => return,
        };
        let conf: NetConf =
            serde_json::from_str(r#"{"name": "weft", "mtu": -1, "subnetFile": "/tmp/x"}"#).unwrap();

        let err = plugin.network_info(&conf).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid config: mtu must not be negative");
    }
}
