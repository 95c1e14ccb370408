use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x02;
pub const ATYP_IPV6: u8 = 0x03;

/// transport(1) + port(2) + address type(1)
const FIXED_LEN: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("unknown transport {0}")]
    UnknownTransport(u8),
    #[error("unknown address type {0:#04x}")]
    UnknownAddressType(u8),
    #[error("domain is not valid utf-8")]
    InvalidDomain,
    #[error("domain too long: {0} bytes")]
    DomainTooLong(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Transport::Tcp),
            2 => Some(Transport::Udp),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Transport::Tcp => 1,
            Transport::Udp => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Destination host as carried on the wire.
///
/// A `Domain` either has not been resolved yet or resolution produced no record, in which case
/// the connector falls back to the system resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Domain(String),
}

impl Host {
    pub fn is_empty(&self) -> bool {
        match self {
            Host::Ip(_) => false,
            Host::Domain(d) => d.trim().is_empty(),
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{ip}"),
            // Eight uncompressed groups, lowercase hex without leading zeros.
            Host::Ip(IpAddr::V6(ip)) => {
                for (i, seg) in ip.segments().iter().enumerate() {
                    if i > 0 {
                        f.write_str(":")?;
                    }
                    write!(f, "{seg:x}")?;
                }
                Ok(())
            }
            Host::Domain(d) => f.write_str(d),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub transport: Transport,
    pub host: Host,
    pub port: u16,
}

impl Destination {
    pub fn new(transport: Transport, host: Host, port: u16) -> Self {
        Self {
            transport,
            host,
            port,
        }
    }

    /// Both host and port must be present for a destination to be dialed.
    pub fn is_valid(&self) -> bool {
        self.port != 0 && !self.host.is_empty()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(_)) => write!(f, "{}://[{}]:{}", self.transport, self.host, self.port),
            _ => write!(f, "{}://{}:{}", self.transport, self.host, self.port),
        }
    }
}

/// Decodes `transport(1) port(2 BE) atyp(1) addr` from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` ends before the address does, otherwise the destination and the
/// number of bytes it occupied. Domains are returned unresolved.
pub fn decode(buf: &[u8]) -> Result<Option<(Destination, usize)>, AddressError> {
    if buf.len() < FIXED_LEN {
        return Ok(None);
    }

    let transport = Transport::from_u8(buf[0]).ok_or(AddressError::UnknownTransport(buf[0]))?;
    let port = u16::from_be_bytes([buf[1], buf[2]]);
    let atyp = buf[3];
    let rest = &buf[FIXED_LEN..];

    let (host, n) = match atyp {
        ATYP_IPV4 => {
            let Some(b) = rest.get(..4) else {
                return Ok(None);
            };
            let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
            (Host::Ip(IpAddr::V4(ip)), 4)
        }
        ATYP_DOMAIN => {
            let Some(&len) = rest.first() else {
                return Ok(None);
            };
            let len = len as usize;
            let Some(b) = rest.get(1..1 + len) else {
                return Ok(None);
            };
            let name = std::str::from_utf8(b).map_err(|_| AddressError::InvalidDomain)?;
            (Host::Domain(name.to_string()), 1 + len)
        }
        ATYP_IPV6 => {
            let Some(b) = rest.get(..16) else {
                return Ok(None);
            };
            let mut octets = [0u8; 16];
            octets.copy_from_slice(b);
            (Host::Ip(IpAddr::V6(Ipv6Addr::from(octets))), 16)
        }
        other => return Err(AddressError::UnknownAddressType(other)),
    };

    Ok(Some((Destination::new(transport, host, port), FIXED_LEN + n)))
}

/// Appends the wire form of `dest` to `out`.
pub fn encode(dest: &Destination, out: &mut BytesMut) -> Result<(), AddressError> {
    out.put_u8(dest.transport.as_u8());
    out.put_u16(dest.port);
    match &dest.host {
        Host::Ip(IpAddr::V4(ip)) => {
            out.put_u8(ATYP_IPV4);
            out.put_slice(&ip.octets());
        }
        Host::Ip(IpAddr::V6(ip)) => {
            out.put_u8(ATYP_IPV6);
            out.put_slice(&ip.octets());
        }
        Host::Domain(d) => {
            let n: u8 = d
                .len()
                .try_into()
                .map_err(|_| AddressError::DomainTooLong(d.len()))?;
            out.put_u8(ATYP_DOMAIN);
            out.put_u8(n);
            out.put_slice(d.as_bytes());
        }
    }
    Ok(())
}
