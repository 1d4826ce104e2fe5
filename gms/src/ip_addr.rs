use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use anyhow::{anyhow, Result};
use sysinfo::Networks;

/// Bind address accepted by the configuration builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAddress(pub(crate) IpAddr);

impl From<IpAddr> for IpAddress {
    fn from(ip: IpAddr) -> Self {
        Self(ip)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(ip: Ipv4Addr) -> Self {
        Self(IpAddr::V4(ip))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(ip: Ipv6Addr) -> Self {
        Self(IpAddr::V6(ip))
    }
}

impl FromStr for IpAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(IpAddress)
    }
}

impl IpAddress {
    /// Routable address of this host: the first non-loopback IPv4 address of
    /// the system's interfaces, falling back to the first such IPv6 address.
    pub fn find_local_ip() -> Result<IpAddr> {
        let networks = Networks::new_with_refreshed_list();
        let candidates: Vec<IpAddr> = networks
            .iter()
            .flat_map(|(_, data)| data.ip_networks().iter().map(|network| network.addr))
            .filter(|addr| !addr.is_loopback() && !addr.is_unspecified())
            .collect();

        candidates.iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| anyhow!("no routable IPv4 or IPv6 address on any interface"))
    }

    /// Address a member bound to `bind` advertises in its identity; a wildcard
    /// bind advertises [`IpAddress::find_local_ip`].
    pub fn advertised(bind: IpAddr) -> Result<IpAddr> {
        if bind.is_unspecified() {
            return Self::find_local_ip();
        }
        Ok(bind)
    }
}

impl AsRef<IpAddr> for IpAddress {
    fn as_ref(&self) -> &IpAddr {
        &self.0
    }
}

impl std::fmt::Display for IpAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        let v4 = Ipv4Addr::new(10, 0, 0, 7);
        assert_eq!(IpAddress::from(v4).0, IpAddr::V4(v4));
        assert_eq!(IpAddress::from(Ipv6Addr::LOCALHOST).to_string(), "::1");
    }

    #[test]
    fn test_from_str() {
        let ip_address: IpAddress = "192.168.0.1".parse().unwrap();
        assert_eq!(ip_address.0, IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)));
        assert!("not-an-ip".parse::<IpAddress>().is_err());
    }

    #[test]
    fn test_specific_bind_is_advertised_as_is() {
        let bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(IpAddress::advertised(bind).unwrap(), bind);
    }
}
