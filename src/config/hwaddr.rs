// Hardware address generation
// Both veth ends get stable, locally administered MACs derived from the
// allocated container address, so repeated attachments of the same lease
// look identical to the fabric.

use std::net::Ipv4Addr;

const CONTAINER_OUI: [u8; 2] = [0xee, 0xee];
const HOST_OUI: [u8; 2] = [0xaa, 0xaa];

pub struct HardwareAddressGenerator;

impl HardwareAddressGenerator {
    pub fn generate_for_container(ip: Ipv4Addr) -> [u8; 6] {
        with_prefix(CONTAINER_OUI, ip)
    }

    pub fn generate_for_host(ip: Ipv4Addr) -> [u8; 6] {
        with_prefix(HOST_OUI, ip)
    }

    pub fn format(mac: &[u8; 6]) -> String {
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    }
}

fn with_prefix(prefix: [u8; 2], ip: Ipv4Addr) -> [u8; 6] {
    let octets = ip.octets();
    [
        prefix[0], prefix[1], octets[0], octets[1], octets[2], octets[3],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_mac_embeds_the_address() {
        let mac = HardwareAddressGenerator::generate_for_container(Ipv4Addr::new(10, 255, 30, 2));
        assert_eq!(mac, [0xee, 0xee, 10, 255, 30, 2]);
    }

    #[test]
    fn host_mac_uses_its_own_prefix() {
        let mac = HardwareAddressGenerator::generate_for_host(Ipv4Addr::new(10, 255, 30, 2));
        assert_eq!(mac, [0xaa, 0xaa, 10, 255, 30, 2]);
    }

    #[test]
    fn macs_are_locally_administered_unicast() {
        for mac in [
            HardwareAddressGenerator::generate_for_container(Ipv4Addr::new(10, 255, 30, 2)),
            HardwareAddressGenerator::generate_for_host(Ipv4Addr::new(10, 255, 30, 2)),
        ] {
            assert_eq!(mac[0] & 0x02, 0x02, "locally administered bit unset");
            assert_eq!(mac[0] & 0x01, 0x00, "multicast bit set");
        }
    }

    #[test]
    fn formats_as_colon_separated_hex() {
        let mac = HardwareAddressGenerator::generate_for_container(Ipv4Addr::new(10, 255, 30, 2));
        assert_eq!(HardwareAddressGenerator::format(&mac), "ee:ee:0a:ff:1e:02");
    }
}
