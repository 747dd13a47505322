// Shared link-operations primitive
// One rtnetlink handle per invocation, reused by every kernel-facing step in
// the host namespace. In-namespace work opens its own connection after
// setns, see container.rs.

use crate::net::error::{NetworkError, NetworkResult};
use futures::TryStreamExt;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

pub struct LinkOps {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl LinkOps {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    /// Get a link's ifindex by name. Returns NotFound if the link doesn't
    /// exist.
    pub async fn link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                // rtnetlink reports "not found" as an error on some kernels
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    pub async fn link_exists(&self, name: &str) -> bool {
        self.link_index(name).await.is_ok()
    }

    /// Create a veth pair. The host end carries the given MTU from creation;
    /// the peer end is adjusted afterwards because the kernel only accepts
    /// peer attributes on the primary message.
    pub async fn create_veth(&self, name: &str, peer_name: &str, mtu: u32) -> NetworkResult<()> {
        use netlink_packet_route::link::nlas::Nla;

        let mut request = self
            .handle
            .link()
            .add()
            .veth(name.to_string(), peer_name.to_string());
        if mtu > 0 {
            request.message_mut().nlas.push(Nla::Mtu(mtu));
        }
        request.execute().await.map_err(|e| {
            if e.to_string().contains("File exists") {
                NetworkError::AlreadyExists(name.to_string())
            } else {
                NetworkError::Netlink(e)
            }
        })
    }

    pub async fn set_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_hardware_addr(&self, index: u32, addr: [u8; 6]) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .address(addr.to_vec())
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Move a link into the network namespace behind the given fd.
    pub async fn move_to_namespace(&self, index: u32, netns_fd: RawFd) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(netns_fd)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Add an IPv4 address with prefix to a link. Already-assigned is fine.
    pub async fn add_address(&self, index: u32, addr: Ipv4Addr, prefix: u8) -> NetworkResult<()> {
        let result = self
            .handle
            .address()
            .add(index, std::net::IpAddr::V4(addr), prefix)
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Add a device-scoped route: `ip route add <dest>/<prefix> dev <index>`
    pub async fn add_route_via_device(
        &self,
        dest: Ipv4Addr,
        prefix: u8,
        index: u32,
    ) -> NetworkResult<()> {
        let result = self
            .handle
            .route()
            .add()
            .v4()
            .destination_prefix(dest, prefix)
            .output_interface(index)
            .execute()
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("File exists") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Delete a link by name. NotFound propagates; callers decide whether
    /// absence is success for their path.
    pub async fn delete_link_by_name(&self, name: &str) -> NetworkResult<()> {
        let index = self.link_index(name).await?;
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => {
                Err(NetworkError::NotFound(format!("link {}", name)))
            }
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }
}
