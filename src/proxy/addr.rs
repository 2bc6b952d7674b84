//! SOCKS5 address codec (RFC 1928)
//!
//! Wire format: `ATYP(1) | ADDR(var) | PORT(2, big-endian)`
//! - `ATYP = 0x01`: IPv4, 4 address bytes
//! - `ATYP = 0x03`: FQDN, 1 length byte then that many bytes, no NUL
//! - `ATYP = 0x04`: IPv6, 16 address bytes

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address type constants.
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Address codec errors
#[derive(Debug, Error)]
pub enum AddrError {
    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("truncated address field")]
    Truncated,

    #[error("unsupported address type: 0x{0:02x}")]
    UnsupportedType(u8),

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("domain name too long: {0} bytes")]
    DomainTooLong(usize),

    #[error("port out of range: {0}")]
    PortOutOfRange(String),

    #[error("unrecognised address format: {0}")]
    InvalidFormat(String),
}

fn read_err(e: io::Error) -> AddrError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        AddrError::Truncated
    } else {
        AddrError::Io(e)
    }
}

/// Read an `ATYP | ADDR | PORT` triple from `r` and return the canonical
/// `host:port` string, with IPv6 hosts bracketed.
pub async fn read_address<R>(r: &mut R) -> Result<String, AddrError>
where
    R: AsyncRead + Unpin,
{
    let host = read_host(r).await?;
    let port = read_port(r).await?;
    Ok(join_host_port(&host, port))
}

/// Read the `ATYP | ADDR` part of an address.
async fn read_host<R>(r: &mut R) -> Result<String, AddrError>
where
    R: AsyncRead + Unpin,
{
    let mut atyp = [0u8; 1];
    r.read_exact(&mut atyp).await.map_err(read_err)?;

    match atyp[0] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            r.read_exact(&mut octets).await.map_err(read_err)?;
            Ok(Ipv4Addr::from(octets).to_string())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            r.read_exact(&mut octets).await.map_err(read_err)?;
            Ok(Ipv6Addr::from(octets).to_string())
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            r.read_exact(&mut len).await.map_err(read_err)?;
            if len[0] == 0 {
                return Err(AddrError::InvalidDomain);
            }
            let mut name = vec![0u8; len[0] as usize];
            r.read_exact(&mut name).await.map_err(read_err)?;
            String::from_utf8(name).map_err(|_| AddrError::InvalidDomain)
        }
        t => Err(AddrError::UnsupportedType(t)),
    }
}

/// Read the trailing 16 bit big-endian port.
async fn read_port<R>(r: &mut R) -> Result<u16, AddrError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 2];
    r.read_exact(&mut buf).await.map_err(read_err)?;
    Ok(u16::from_be_bytes(buf))
}

/// Encode a canonical `host:port` address into its wire representation.
///
/// Hosts that parse as IPv4 are always encoded as IPv4, never as FQDN;
/// IPv4-mapped IPv6 addresses collapse to their IPv4 form.
pub fn write_address(addr: &str) -> Result<Vec<u8>, AddrError> {
    let (host, port) = split_host_port(addr)?;

    let mut buf = encode_host(host)?;
    buf.extend_from_slice(&encode_port(port)?);
    Ok(buf)
}

fn split_host_port(addr: &str) -> Result<(&str, &str), AddrError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| AddrError::InvalidFormat(addr.to_string()))?;
    if host.is_empty() {
        return Err(AddrError::InvalidFormat(addr.to_string()));
    }
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host, port))
}

fn encode_host(host: &str) -> Result<Vec<u8>, AddrError> {
    let mut buf = Vec::with_capacity(1 + host.len());

    match host.parse::<IpAddr>() {
        Ok(ip) => {
            let ip = match ip {
                IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                    Some(v4) => IpAddr::V4(v4),
                    None => IpAddr::V6(v6),
                },
                v4 => v4,
            };
            match ip {
                IpAddr::V4(v4) => {
                    buf.push(ATYP_IPV4);
                    buf.extend_from_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    buf.push(ATYP_IPV6);
                    buf.extend_from_slice(&v6.octets());
                }
            }
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(AddrError::DomainTooLong(host.len()));
            }
            buf.push(ATYP_DOMAIN);
            buf.push(host.len() as u8);
            buf.extend_from_slice(host.as_bytes());
        }
    }

    Ok(buf)
}

fn encode_port(port: &str) -> Result<[u8; 2], AddrError> {
    let p: u32 = port
        .parse()
        .map_err(|_| AddrError::PortOutOfRange(port.to_string()))?;
    if !(1..=0xffff).contains(&p) {
        return Err(AddrError::PortOutOfRange(port.to_string()));
    }
    Ok((p as u16).to_be_bytes())
}

/// Canonical `host:port` form, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
