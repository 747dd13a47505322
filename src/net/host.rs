// Host-side setup
// Operates in the host namespace on the host end of the pair.

use crate::config::AttachmentConfig;
use crate::net::error::NetworkResult;
use crate::net::link_ops::LinkOps;
use std::sync::Arc;

pub struct Host {
    pub link_ops: Arc<LinkOps>,
}

impl Host {
    /// Bring the host end up and point a /32 route at the container's
    /// address through it, so the overlay can reach the container without
    /// ARP on the point-to-point pair.
    pub async fn setup(&self, cfg: &AttachmentConfig) -> NetworkResult<()> {
        let index = self.link_ops.link_index(&cfg.host.if_name).await?;
        self.link_ops.set_up(index).await?;
        self.link_ops
            .add_route_via_device(cfg.container.address.ip, 32, index)
            .await?;

        tracing::debug!(
            device = %cfg.host.if_name,
            container_ip = %cfg.container.address.ip,
            "host setup complete"
        );
        Ok(())
    }
}
