// Veth pair creation
// The pair is created entirely in the host namespace; the container end
// keeps its generated temporary name until container setup moves and
// renames it.

use crate::config::AttachmentConfig;
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::link_ops::LinkOps;
use std::sync::Arc;

pub struct VethPairCreator {
    pub link_ops: Arc<LinkOps>,
}

impl VethPairCreator {
    /// Create the host/container veth pair described by the config and apply
    /// MTU and hardware addresses to both ends. Name collisions fail; the
    /// names are derived from the namespace handle, so an existing device
    /// means a stale or concurrent attachment for the same handle.
    pub async fn create(&self, cfg: &AttachmentConfig) -> NetworkResult<()> {
        for name in [&cfg.host.if_name, &cfg.container.temp_if_name] {
            if self.link_ops.link_exists(name).await {
                return Err(NetworkError::AlreadyExists(format!("device {}", name)));
            }
        }

        self.link_ops
            .create_veth(&cfg.host.if_name, &cfg.container.temp_if_name, cfg.mtu)
            .await?;

        let host_index = self.link_ops.link_index(&cfg.host.if_name).await?;
        let peer_index = self.link_ops.link_index(&cfg.container.temp_if_name).await?;

        self.link_ops
            .set_hardware_addr(host_index, cfg.host.hardware_addr)
            .await?;
        self.link_ops
            .set_hardware_addr(peer_index, cfg.container.hardware_addr)
            .await?;
        if cfg.mtu > 0 {
            self.link_ops.set_mtu(peer_index, cfg.mtu).await?;
        }

        Ok(())
    }
}
