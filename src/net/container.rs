// Container-side setup and teardown
// setns() affects the calling OS thread. We MUST use std::thread::spawn,
// never a tokio task, for in-namespace netlink operations; each spawned
// thread builds a current-thread runtime and its own netlink connection
// inside the target namespace.

use crate::config::{AttachmentConfig, CidrAddress, RouteConfig};
use crate::net::error::{NetworkError, NetworkResult};
use crate::net::link_ops::LinkOps;
use futures::TryStreamExt;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

pub struct Container {
    pub link_ops: Arc<LinkOps>,
}

impl Container {
    /// Move the container end into the target namespace, then rename it,
    /// assign the allocated address and routes, and bring it up.
    pub async fn setup(&self, cfg: &AttachmentConfig) -> NetworkResult<()> {
        let index = self
            .link_ops
            .link_index(&cfg.container.temp_if_name)
            .await?;
        self.link_ops
            .move_to_namespace(index, cfg.container.netns.as_raw_fd())
            .await?;

        let netns = cfg.container.netns.try_clone().map_err(NetworkError::Io)?;
        let temp_name = cfg.container.temp_if_name.clone();
        let if_name = cfg.container.if_name.clone();
        let address = cfg.container.address;
        let gateway = cfg.container.gateway;
        let routes = cfg.container.routes.clone();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let result =
                configure_in_netns(netns, &temp_name, &if_name, address, gateway, &routes);
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| NetworkError::Namespace("in-namespace thread panicked".to_string()))?
    }

    /// Delete the named link inside the target namespace. A link that is
    /// already gone is logged and treated as success so that repeated
    /// detach calls converge; every other failure propagates.
    pub async fn teardown(&self, netns_path: &str, if_name: &str) -> NetworkResult<()> {
        let path = netns_path.to_string();
        let name = if_name.to_string();

        let (tx, rx) = tokio::sync::oneshot::channel();
        std::thread::spawn(move || {
            let result = teardown_in_netns(&path, &name);
            let _ = tx.send(result);
        });

        rx.await
            .map_err(|_| NetworkError::Namespace("in-namespace thread panicked".to_string()))?
    }
}

fn enter_netns(netns: &File) -> NetworkResult<()> {
    use nix::sched::{setns, CloneFlags};
    setns(netns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
        .map_err(|e| NetworkError::Namespace(format!("setns failed: {}", e)))
}

fn netns_runtime() -> NetworkResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(NetworkError::Io)
}

/// Runs on a dedicated OS thread that has entered the container namespace.
fn configure_in_netns(
    netns: File,
    temp_name: &str,
    if_name: &str,
    address: CidrAddress,
    gateway: Option<Ipv4Addr>,
    routes: &[RouteConfig],
) -> NetworkResult<()> {
    enter_netns(&netns)?;
    let rt = netns_runtime()?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let mut links = handle
            .link()
            .get()
            .match_name(temp_name.to_string())
            .execute();
        let msg = links
            .try_next()
            .await
            .map_err(NetworkError::Netlink)?
            .ok_or_else(|| {
                NetworkError::NotFound(format!("link {} in container netns", temp_name))
            })?;
        let index = msg.header.index;

        handle
            .link()
            .set(index)
            .name(if_name.to_string())
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        match handle
            .address()
            .add(index, IpAddr::V4(address.ip), address.prefix)
            .execute()
            .await
        {
            Ok(()) => {}
            Err(e) if e.to_string().contains("File exists") => {}
            Err(e) => return Err(NetworkError::Netlink(e)),
        }

        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)?;

        for route in routes {
            let result = match route.gw.or(gateway) {
                Some(gw) => {
                    handle
                        .route()
                        .add()
                        .v4()
                        .destination_prefix(route.dst.ip, route.dst.prefix)
                        .gateway(gw)
                        .execute()
                        .await
                }
                None => {
                    handle
                        .route()
                        .add()
                        .v4()
                        .destination_prefix(route.dst.ip, route.dst.prefix)
                        .output_interface(index)
                        .execute()
                        .await
                }
            };
            match result {
                Ok(()) => {}
                Err(e) if e.to_string().contains("File exists") => {}
                Err(e) => return Err(NetworkError::Netlink(e)),
            }
        }

        Ok(())
    })
}

/// Runs on a dedicated OS thread that has entered the container namespace.
fn teardown_in_netns(netns_path: &str, if_name: &str) -> NetworkResult<()> {
    let netns = File::open(netns_path)
        .map_err(|e| NetworkError::Namespace(format!("open {}: {}", netns_path, e)))?;
    enter_netns(&netns)?;
    let rt = netns_runtime()?;

    rt.block_on(async {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let mut links = handle
            .link()
            .get()
            .match_name(if_name.to_string())
            .execute();
        let index = match links.try_next().await {
            Ok(Some(msg)) => msg.header.index,
            Ok(None) => {
                tracing::warn!(device = %if_name, "Link not found");
                return Ok(());
            }
            Err(e) if e.to_string().contains("No such device") => {
                tracing::warn!(device = %if_name, "Link not found");
                return Ok(());
            }
            Err(e) => return Err(NetworkError::Netlink(e)),
        };

        match handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => {
                tracing::warn!(device = %if_name, "Link not found");
                Ok(())
            }
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    })
}
