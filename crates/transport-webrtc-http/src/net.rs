use std::net::{IpAddr, SocketAddr};

/// Picks the first `host:port` whose IP is not in a private range, falling
/// back to the first entry. Unparseable hosts (mDNS names) never win the
/// preference but can still be the fallback.
pub fn prefer_non_private_ip<S: AsRef<str>>(addresses: &[S]) -> Option<String> {
    addresses
        .iter()
        .map(AsRef::as_ref)
        .find(|addr| parse_ip(addr).is_some_and(|ip| !is_private(ip)))
        .or_else(|| addresses.first().map(AsRef::as_ref))
        .map(str::to_string)
}

fn parse_ip(address: &str) -> Option<IpAddr> {
    if let Ok(socket) = address.parse::<SocketAddr>() {
        return Some(socket.ip());
    }
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse()
        .ok()
}

fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        // fc00::/7 unique local
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn public_address_wins_over_earlier_private_ones() {
        let addrs = ["10.0.0.2:4000", "192.168.0.9:4001", "198.51.100.7:4002"];
        assert_eq!(
            prefer_non_private_ip(&addrs).as_deref(),
            Some("198.51.100.7:4002")
        );
    }

    #[test_timeout::timeout]
    fn falls_back_to_first_entry() {
        let addrs = ["abc.local:4000", "172.16.3.3:4001"];
        assert_eq!(prefer_non_private_ip(&addrs).as_deref(), Some("abc.local:4000"));
        assert_eq!(prefer_non_private_ip::<&str>(&[]), None);
    }

    #[test_timeout::timeout]
    fn unique_local_v6_is_private() {
        let addrs = ["[fd00::1]:5000", "[2001:db8::1]:5001"];
        assert_eq!(prefer_non_private_ip(&addrs).as_deref(), Some("[2001:db8::1]:5001"));
    }
}
