//! SOCKS5 wire types (RFC 1928) and the shadowsocks address header encoding.
//!
//! This module only knows bytes-in, bytes-out: parsing a client request, writing the
//! replies the local proxy fakes back, and encoding the `[ATYP][ADDR][PORT]` header that
//! gets prefixed to the first upstream-bound segment. Everything else (the negotiation
//! stage machine, upstream connect, streaming) lives in `relay::tcprelay::local`.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt};

pub const SOCKS5_VERSION: u8 = 0x05;

pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;
pub const CMD_BIND: u8 = 0x02;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCEEDED: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Errors parsing a client's handshake or request. Each variant knows the `REP` code the
/// local proxy should best-effort reply with before closing, per the error table in the
/// error-handling design.
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0:#x}")]
    UnsupportedVersion(u8),
    #[error("unsupported address type {0:#x}")]
    UnsupportedAddressType(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Socks5Error {
    pub fn reply_code(&self) -> u8 {
        match self {
            Socks5Error::UnsupportedVersion(_) => REP_GENERAL_FAILURE,
            Socks5Error::UnsupportedAddressType(_) => REP_ADDRESS_TYPE_NOT_SUPPORTED,
            Socks5Error::Io(_) => REP_GENERAL_FAILURE,
        }
    }
}

/// A parsed SOCKS5 destination address, in whichever form the client sent it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    SocketAddress(SocketAddr),
    DomainNameAddress(String, u16),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::SocketAddress(addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(_, port) => *port,
        }
    }

    /// Encodes the shadowsocks address header: `[ATYP][ADDR][PORT]`, exactly the bytes
    /// that are prefixed to the first upstream-bound segment (before encryption).
    pub fn write_header(&self, out: &mut Vec<u8>) {
        match self {
            Address::SocketAddress(SocketAddr::V4(v4)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&v4.ip().octets());
                write_port(out, v4.port());
            }
            Address::SocketAddress(SocketAddr::V6(v6)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&v6.ip().octets());
                write_port(out, v6.port());
            }
            Address::DomainNameAddress(domain, port) => {
                out.push(ATYP_DOMAIN);
                out.push(domain.len() as u8);
                out.extend_from_slice(domain.as_bytes());
                write_port(out, *port);
            }
        }
    }

    pub fn to_header_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_header(&mut buf);
        buf
    }
}

fn write_port(out: &mut Vec<u8>, port: u16) {
    let mut b = [0u8; 2];
    BigEndian::write_u16(&mut b, port);
    out.extend_from_slice(&b);
}

/// The client's initial method-selection request. The local proxy reads the header,
/// discards the offered method list (only no-auth is ever granted) and discards the
/// buffer content here since nothing downstream needs it.
pub async fn read_method_select_header<R>(stream: &mut R) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let nmethods = header[1] as usize;

    let mut methods = vec![0u8; nmethods];
    stream.read_exact(&mut methods).await?;
    Ok(())
}

/// `{ver=5, method=0}` — the only reply this proxy ever sends for method selection.
pub fn method_select_reply() -> [u8; 2] {
    [SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
    Unsupported(u8),
}

impl From<u8> for Command {
    fn from(v: u8) -> Command {
        match v {
            CMD_CONNECT => Command::Connect,
            CMD_BIND => Command::Bind,
            CMD_UDP_ASSOCIATE => Command::UdpAssociate,
            other => Command::Unsupported(other),
        }
    }
}

/// A parsed `VER CMD RSV ATYP DST.ADDR DST.PORT` request.
pub struct Request {
    pub command: Command,
    pub address: Address,
}

/// Reads and parses one SOCKS5 request header. Returns the request plus any payload
/// bytes the caller had already buffered beyond the header (the "coalesced payload"
/// case) are left untouched in the caller's buffer — this function only consumes the
/// header itself from the stream.
pub async fn read_request<R>(stream: &mut R) -> Result<Request, Socks5Error>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let (ver, cmd, _rsv, atyp) = (head[0], head[1], head[2], head[3]);

    if ver != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(ver));
    }

    let address = read_address(stream, atyp).await?;

    Ok(Request { command: cmd.into(), address })
}

async fn read_address<R>(stream: &mut R, atyp: u8) -> Result<Address, Socks5Error>
where
    R: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = BigEndian::read_u16(&buf[4..6]);
            Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(ip, port))))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut segments = [0u16; 8];
            for (i, seg) in segments.iter_mut().enumerate() {
                *seg = BigEndian::read_u16(&buf[i * 2..i * 2 + 2]);
            }
            let ip = Ipv6Addr::new(
                segments[0], segments[1], segments[2], segments[3], segments[4], segments[5], segments[6], segments[7],
            );
            let port = BigEndian::read_u16(&buf[16..18]);
            Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0))))
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream.read_exact(&mut len_buf).await?;
            let len = len_buf[0] as usize;

            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await?;
            let domain = String::from_utf8_lossy(&buf[..len]).into_owned();
            let port = BigEndian::read_u16(&buf[len..len + 2]);
            Ok(Address::DomainNameAddress(domain, port))
        }
        other => Err(Socks5Error::UnsupportedAddressType(other)),
    }
}

/// The fake CONNECT success reply: `{ver=5, rep=0, rsv=0, atyp=1} 0.0.0.0:0`. Sent before
/// the upstream connection is known to succeed, by design (see design notes on latency
/// vs. protocol fidelity).
pub fn connect_success_reply() -> [u8; 10] {
    [SOCKS5_VERSION, REP_SUCCEEDED, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

/// The UDP ASSOCIATE stub success reply, reporting the client socket's own bound local
/// address (there is no real UDP relay behind it in this crate).
pub fn udp_associate_reply(bound: SocketAddr) -> Vec<u8> {
    let mut out = vec![SOCKS5_VERSION, REP_SUCCEEDED, 0x00];
    Address::SocketAddress(bound).write_header(&mut out);
    out
}

/// A 4-byte error reply: `{ver=5, rep, rsv=0, atyp=1}`, used for unsupported commands and
/// other protocol violations that are rejected before a destination address is known to
/// be usable.
pub fn error_reply(rep: u8) -> [u8; 4] {
    [SOCKS5_VERSION, rep, 0x00, ATYP_IPV4]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn parses_ipv4_connect_request() {
        let raw = [0x05, 0x01, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90];
        let mut cursor = Cursor::new(raw);
        let req = read_request(&mut cursor).await.unwrap();

        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::SocketAddress("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(req.address.to_header_bytes(), vec![0x01, 0x7F, 0x00, 0x00, 0x01, 0x1F, 0x90]);
    }

    #[tokio::test]
    async fn parses_domain_connect_request() {
        let mut raw = vec![0x05, 0x01, 0x00, 0x03, 0x09];
        raw.extend_from_slice(b"localhost");
        raw.extend_from_slice(&[0x00, 0x50]);
        let mut cursor = Cursor::new(raw);
        let req = read_request(&mut cursor).await.unwrap();

        assert_eq!(req.command, Command::Connect);
        assert_eq!(req.address, Address::DomainNameAddress("localhost".to_owned(), 80));

        let mut header = Vec::new();
        req.address.write_header(&mut header);
        let mut expected = vec![0x03, 0x09];
        expected.extend_from_slice(b"localhost");
        expected.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(header, expected);
    }

    #[tokio::test]
    async fn rejects_unsupported_address_type() {
        let raw = [0x05, 0x01, 0x00, 0x7F];
        let mut cursor = Cursor::new(raw);
        let err = read_request(&mut cursor).await.unwrap_err();
        assert_eq!(err.reply_code(), REP_ADDRESS_TYPE_NOT_SUPPORTED);
    }

    #[test]
    fn unsupported_command_maps_to_variant() {
        let cmd: Command = 0x02.into();
        assert_eq!(cmd, Command::Bind);
        let cmd: Command = 0x99.into();
        assert_eq!(cmd, Command::Unsupported(0x99));
    }
}
