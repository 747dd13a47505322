// Traffic shaping
// An intermediate functional block device absorbs ingress from the host end
// so inbound traffic can be rate limited; outbound limiting is a token
// bucket directly on the host end. Engaged only when both rate and burst
// are configured.

use crate::config::devname::DeviceNameGenerator;
use crate::config::AttachmentConfig;
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::link_ops::LinkOps;
use std::sync::Arc;

const TBF_LATENCY: &str = "25ms";

pub struct IfbCreator {
    pub link_ops: Arc<LinkOps>,
}

impl IfbCreator {
    /// Create the IFB device for this attachment and bring it up.
    /// rtnetlink's link builder does not model the ifb type, so creation
    /// goes through the ip tool.
    pub async fn create(&self, cfg: &AttachmentConfig) -> NetworkResult<()> {
        run_tool("ip", &ifb_add_args(&cfg.ifb_if_name, cfg.mtu)).await?;
        let index = self.link_ops.link_index(&cfg.ifb_if_name).await?;
        self.link_ops.set_up(index).await
    }

    /// Remove the IFB device for the given handle. Absence is not an error;
    /// shaping may never have been configured for this attachment.
    pub async fn teardown(&self, handle: &str) -> NetworkResult<()> {
        let name = DeviceNameGenerator::generate_for_ifb(handle);
        match self.link_ops.delete_link_by_name(&name).await {
            Ok(()) => Ok(()),
            Err(NetworkError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

pub struct Bandwidth;

impl Bandwidth {
    /// Limit traffic flowing into the container: redirect the host end's
    /// ingress through the IFB device and rate limit there.
    pub async fn inbound_setup(
        &self,
        rate: i64,
        burst: i64,
        cfg: &AttachmentConfig,
    ) -> NetworkResult<()> {
        run_tool("tc", &ingress_qdisc_args(&cfg.host.if_name)).await?;
        run_tool(
            "tc",
            &redirect_filter_args(&cfg.host.if_name, &cfg.ifb_if_name),
        )
        .await?;
        run_tool("tc", &tbf_args(&cfg.ifb_if_name, rate, burst)).await?;

        tracing::debug!(
            device = %cfg.ifb_if_name,
            rate,
            burst,
            "inbound bandwidth limit set"
        );
        Ok(())
    }

    /// Limit traffic flowing out of the container: a token bucket on the
    /// host end's root qdisc.
    pub async fn outbound_setup(
        &self,
        rate: i64,
        burst: i64,
        cfg: &AttachmentConfig,
    ) -> NetworkResult<()> {
        run_tool("tc", &tbf_args(&cfg.host.if_name, rate, burst)).await?;

        tracing::debug!(
            device = %cfg.host.if_name,
            rate,
            burst,
            "outbound bandwidth limit set"
        );
        Ok(())
    }
}

fn ifb_add_args(name: &str, mtu: u32) -> String {
    if mtu > 0 {
        format!("link add name {} mtu {} type ifb", name, mtu)
    } else {
        format!("link add name {} type ifb", name)
    }
}

fn ingress_qdisc_args(device: &str) -> String {
    format!("qdisc add dev {} handle ffff: ingress", device)
}

fn redirect_filter_args(device: &str, ifb: &str) -> String {
    format!(
        "filter add dev {} parent ffff: protocol all u32 match u32 0 0 \
         action mirred egress redirect dev {}",
        device, ifb
    )
}

/// Rate is bits per second, burst is bytes; tc takes both as raw numbers
/// with unit suffixes.
fn tbf_args(device: &str, rate: i64, burst: i64) -> String {
    format!(
        "qdisc add dev {} root tbf rate {}bit burst {}b latency {}",
        device, rate, burst, TBF_LATENCY
    )
}

async fn run_tool(tool: &str, args: &str) -> NetworkResult<()> {
    let output = tokio::process::Command::new(tool)
        .args(args.split_whitespace())
        .output()
        .await
        .map_err(NetworkError::Io)?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(NetworkError::Command {
            cmd: format!("{} {}", tool, args),
            stderr: stderr.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ifb_creation_carries_the_config_mtu() {
        assert_eq!(
            ifb_add_args("i-1a2b3c4d5e6f", 1450),
            "link add name i-1a2b3c4d5e6f mtu 1450 type ifb"
        );
        assert_eq!(
            ifb_add_args("i-1a2b3c4d5e6f", 0),
            "link add name i-1a2b3c4d5e6f type ifb"
        );
    }

    #[test]
    fn inbound_redirects_ingress_through_the_ifb() {
        assert_eq!(
            ingress_qdisc_args("w-1a2b3c4d5e6f"),
            "qdisc add dev w-1a2b3c4d5e6f handle ffff: ingress"
        );
        let filter = redirect_filter_args("w-1a2b3c4d5e6f", "i-1a2b3c4d5e6f");
        assert!(filter.contains("dev w-1a2b3c4d5e6f"));
        assert!(filter.ends_with("redirect dev i-1a2b3c4d5e6f"));
    }

    #[test]
    fn token_bucket_encodes_rate_and_burst_units() {
        assert_eq!(
            tbf_args("w-1a2b3c4d5e6f", 1_000_000, 8000),
            "qdisc add dev w-1a2b3c4d5e6f root tbf rate 1000000bit burst 8000b latency 25ms"
        );
    }
}
