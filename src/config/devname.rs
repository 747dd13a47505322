// Deterministic device naming
// Host, container, and shaping device names are derived from the namespace
// handle so that concurrent attachments on one host cannot collide.

use sha2::{Digest, Sha256};

const HOST_PREFIX: char = 'w';
const CONTAINER_PREFIX: char = 'c';
const IFB_PREFIX: char = 'i';

/// Number of digest bytes rendered into the name. Two hex characters per
/// byte plus the two-character prefix keeps names at 14 characters, inside
/// the kernel's interface-name limit.
const NAME_BYTES: usize = 6;

pub struct DeviceNameGenerator;

impl DeviceNameGenerator {
    /// Name of the veth end that stays in the host namespace.
    pub fn generate_for_host(handle: &str) -> String {
        derive(HOST_PREFIX, handle)
    }

    /// Temporary name of the veth end destined for the container namespace.
    /// It is renamed to the requested interface name after the move.
    pub fn generate_temporary_for_container(handle: &str) -> String {
        derive(CONTAINER_PREFIX, handle)
    }

    /// Name of the intermediate functional block device used for inbound
    /// shaping.
    pub fn generate_for_ifb(handle: &str) -> String {
        derive(IFB_PREFIX, handle)
    }
}

fn derive(prefix: char, handle: &str) -> String {
    let digest = Sha256::digest(handle.as_bytes());
    let mut name = String::with_capacity(2 + NAME_BYTES * 2);
    name.push(prefix);
    name.push('-');
    for byte in digest.iter().take(NAME_BYTES) {
        name.push_str(&format!("{:02x}", byte));
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const MAX_IF_NAME_LEN: usize = libc::IFNAMSIZ - 1;

    #[test]
    fn names_fit_the_kernel_limit() {
        let name = DeviceNameGenerator::generate_for_host("cni-0123456789abcdef");
        assert!(name.len() <= MAX_IF_NAME_LEN, "{} is too long", name);
        assert_eq!(name.len(), 14);
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(
            DeviceNameGenerator::generate_for_host("cni-4f12"),
            DeviceNameGenerator::generate_for_host("cni-4f12"),
        );
    }

    #[test]
    fn the_three_names_for_one_handle_differ_only_in_prefix() {
        let host = DeviceNameGenerator::generate_for_host("cni-4f12");
        let container = DeviceNameGenerator::generate_temporary_for_container("cni-4f12");
        let ifb = DeviceNameGenerator::generate_for_ifb("cni-4f12");

        assert_eq!(&host[1..], &container[1..]);
        assert_eq!(&host[1..], &ifb[1..]);
        assert!(host.starts_with("w-"));
        assert!(container.starts_with("c-"));
        assert!(ifb.starts_with("i-"));
    }

    #[test]
    fn distinct_handles_never_share_a_name() {
        let mut seen = HashSet::new();
        for i in 0..1000 {
            let handle = format!("cni-handle-{}", i);
            let name = DeviceNameGenerator::generate_for_host(&handle);
            assert!(seen.insert(name.clone()), "collision on {}", name);
        }
    }
}
