//! Local network interface enumeration, used by the embedded ICE agent's
//! host candidate gathering. Kept deliberately small: callers only need an
//! interface's name and the addresses bound to it.

use std::net::IpAddr;

#[derive(Debug, Clone)]
pub struct Iface {
    pub name: String,
    pub addr: IpAddr,
}

#[cfg(unix)]
pub fn interfaces() -> crate::error::Result<Vec<Iface>> {
    use nix::ifaddrs::getifaddrs;

    let mut out = Vec::new();
    let addrs = getifaddrs().map_err(|e| crate::error::Error::Other(e.to_string()))?;
    for ifaddr in addrs {
        let Some(sockaddr) = ifaddr.address else {
            continue;
        };
        let ip = if let Some(sin) = sockaddr.as_sockaddr_in() {
            Some(IpAddr::V4(std::net::Ipv4Addr::from(sin.ip())))
        } else if let Some(sin6) = sockaddr.as_sockaddr_in6() {
            Some(IpAddr::V6(sin6.ip()))
        } else {
            None
        };
        if let Some(addr) = ip {
            out.push(Iface {
                name: ifaddr.interface_name,
                addr,
            });
        }
    }
    Ok(out)
}

#[cfg(not(unix))]
pub fn interfaces() -> crate::error::Result<Vec<Iface>> {
    // Windows host-candidate gathering is out of scope; ICE falls back to
    // the server-reflexive/relay candidates it still gathers via STUN/TURN.
    Ok(Vec::new())
}
