use crate::socks5::protocol::AddressType;
use anyhow::{Result, anyhow};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// TargetAddr is a SOCKS5 destination as it appears on the wire,
/// before any name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

/// TargetAddr implementation block
impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// resolve turns the target into a connectable SocketAddr, looking
    /// domain names up through the tokio resolver
    pub async fn resolve(&self) -> Result<SocketAddr> {
        match self {
            TargetAddr::Ip(addr) => Ok(*addr),
            TargetAddr::Domain(domain, port) => tokio::net::lookup_host((domain.as_str(), *port))
                .await
                .map_err(|e| anyhow!("failed to resolve host '{domain}': {e}"))?
                .next()
                .ok_or_else(|| anyhow!("no IP address found for '{domain}'")),
        }
    }

    /// is_broadcast reports whether the target may be a broadcast address,
    /// so the outbound socket needs SO_BROADCAST. A `.255` host can also be
    /// an ordinary unicast peer, so this never decides whether replies are
    /// received.
    pub fn is_broadcast(&self) -> bool {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => {
                addr.ip().is_broadcast() || addr.ip().octets()[3] == 255
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// parse_address_from_packet parses the ATYP/DST.ADDR/DST.PORT triple that
/// starts at `start_offset` and returns the target plus the number of
/// bytes consumed, ATYP byte included
pub fn parse_address_from_packet(packet: &[u8], start_offset: usize) -> Result<(TargetAddr, usize)> {
    let atyp = *packet
        .get(start_offset)
        .ok_or_else(|| anyhow!("not enough data to read address type"))?;

    // Set offset past ATYP
    let mut offset = start_offset + 1;

    let target = match AddressType::from_byte(atyp) {
        Some(AddressType::IPv4) => TargetAddr::Ip(parse_ipv4_address(packet, &mut offset)?),
        Some(AddressType::IPv6) => TargetAddr::Ip(parse_ipv6_address(packet, &mut offset)?),
        Some(AddressType::DomainName) => {
            let (domain, port) = parse_domain_address(packet, &mut offset)?;
            TargetAddr::Domain(domain, port)
        }
        None => return Err(anyhow!("unknown address type: {atyp}")),
    };

    Ok((target, offset - start_offset))
}

/// parse_ipv4_address parses an IPv4 address and port from a byte slice
pub fn parse_ipv4_address(data: &[u8], offset: &mut usize) -> Result<SocketAddr> {
    // IPv4 address + port -> 6 bytes
    if *offset + 6 > data.len() {
        return Err(anyhow!("not enough data for IPv4 address and port"));
    }

    let ip_bytes: [u8; 4] = data[*offset..*offset + 4]
        .try_into()
        .map_err(|_| anyhow!("invalid IPv4 bytes"))?;
    *offset += 4;

    let port = read_port(data, offset);
    Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip_bytes)), port))
}

/// parse_ipv6_address parses an IPv6 address and port from a byte slice
pub fn parse_ipv6_address(data: &[u8], offset: &mut usize) -> Result<SocketAddr> {
    // IPv6 address + port -> 18 bytes
    if *offset + 18 > data.len() {
        return Err(anyhow!("not enough data for IPv6 address and port"));
    }

    let ip_bytes: [u8; 16] = data[*offset..*offset + 16]
        .try_into()
        .map_err(|_| anyhow!("invalid IPv6 bytes"))?;
    *offset += 16;

    let port = read_port(data, offset);
    Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip_bytes)), port))
}

/// parse_domain_address parses a length-prefixed domain and port from a byte slice
pub fn parse_domain_address(data: &[u8], offset: &mut usize) -> Result<(String, u16)> {
    if *offset + 1 > data.len() {
        return Err(anyhow!("not enough data to read domain length"));
    }

    // First octet holds the number of octets to follow
    let domain_len = data[*offset] as usize;

    if domain_len == 0 {
        return Err(anyhow!("domain length cannot be 0"));
    }

    if domain_len > 253 {
        return Err(anyhow!(
            "domain name too long: {domain_len} (max 253 bytes)"
        ));
    }

    if *offset + 1 + domain_len + 2 > data.len() {
        return Err(anyhow!("not enough data for domain and port"));
    }
    *offset += 1;

    let domain = String::from_utf8(data[*offset..*offset + domain_len].to_vec())
        .map_err(|e| anyhow!("invalid domain: {e}"))?;
    *offset += domain_len;

    let port = read_port(data, offset);
    Ok((domain, port))
}

/// write_socket_addr appends ATYP/ADDR/PORT for an address in network order
pub fn write_socket_addr(buf: &mut Vec<u8>, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(v4) => {
            buf.push(AddressType::IPv4 as u8);
            buf.extend_from_slice(&v4.ip().octets());
            buf.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(v6) => {
            buf.push(AddressType::IPv6 as u8);
            buf.extend_from_slice(&v6.ip().octets());
            buf.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
}

// Caller has already bounds-checked the two port bytes
fn read_port(data: &[u8], offset: &mut usize) -> u16 {
    let port = u16::from_be_bytes([data[*offset], data[*offset + 1]]);
    *offset += 2;
    port
}
