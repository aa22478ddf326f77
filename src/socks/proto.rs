// rfc1928 wire structures, only what a CONNECT-ing client needs
use bytes::{BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xff;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
  Socket(SocketAddr),
  Domain(String, u16),
}

impl From<SocketAddr> for Address {
  fn from(addr: SocketAddr) -> Self {
    Address::Socket(addr)
  }
}

impl Address {
  fn write_to_buf(&self, buf: &mut BytesMut) {
    match self {
      Address::Socket(SocketAddr::V4(addr)) => {
        buf.put_u8(ATYP_IPV4);
        buf.put_slice(&addr.ip().octets());
        buf.put_u16(addr.port());
      }
      Address::Socket(SocketAddr::V6(addr)) => {
        buf.put_u8(ATYP_IPV6);
        buf.put_slice(&addr.ip().octets());
        buf.put_u16(addr.port());
      }
      Address::Domain(host, port) => {
        buf.put_u8(ATYP_DOMAIN);
        buf.put_u8(host.len() as u8);
        buf.put_slice(host.as_bytes());
        buf.put_u16(*port);
      }
    }
  }

  async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
    let address = match r.read_u8().await? {
      ATYP_IPV4 => {
        let mut ip = [0u8; 4];
        r.read_exact(&mut ip).await?;
        let ip = IpAddr::V4(Ipv4Addr::from(ip));
        Address::Socket((ip, r.read_u16().await?).into())
      }
      ATYP_IPV6 => {
        let mut ip = [0u8; 16];
        r.read_exact(&mut ip).await?;
        let ip = IpAddr::V6(Ipv6Addr::from(ip));
        Address::Socket((ip, r.read_u16().await?).into())
      }
      ATYP_DOMAIN => {
        let len = r.read_u8().await? as usize;
        let mut host = vec![0u8; len];
        r.read_exact(&mut host).await?;
        let host = String::from_utf8(host)?;
        Address::Domain(host, r.read_u16().await?)
      }
      atyp => bail!("unknown socks address type {}", atyp),
    };
    Ok(address)
  }
}

pub struct HandshakeRequest {
  methods: Vec<u8>,
}

impl HandshakeRequest {
  pub fn new(methods: Vec<u8>) -> Self {
    Self { methods }
  }

  pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
    let mut buf = BytesMut::with_capacity(2 + self.methods.len());
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(self.methods.len() as u8);
    buf.put_slice(&self.methods);
    w.write_all(&buf).await?;
    Ok(())
  }
}

pub struct HandshakeResponse {
  pub chosen_method: u8,
}

impl HandshakeResponse {
  pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
    let version = r.read_u8().await?;
    ensure!(version == SOCKS5_VERSION, "unexpected socks version {}", version);
    let chosen_method = r.read_u8().await?;
    Ok(Self { chosen_method })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
  TcpConnect = 0x01,
}

pub struct TcpRequestHeader {
  pub command: Command,
  pub address: Address,
}

impl TcpRequestHeader {
  pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
    let mut buf = BytesMut::with_capacity(22);
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(self.command as u8);
    buf.put_u8(0x00);
    self.address.write_to_buf(&mut buf);
    w.write_all(&buf).await?;
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
  Succeeded,
  Failed(u8),
}

impl From<u8> for Reply {
  fn from(code: u8) -> Self {
    match code {
      0x00 => Reply::Succeeded,
      code => Reply::Failed(code),
    }
  }
}

pub struct TcpResponseHeader {
  pub reply: Reply,
  pub address: Address,
}

impl TcpResponseHeader {
  pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
    let version = r.read_u8().await?;
    ensure!(version == SOCKS5_VERSION, "unexpected socks version {}", version);
    let reply = r.read_u8().await?.into();
    let _reserved = r.read_u8().await?;
    let address = Address::read_from(r).await?;
    Ok(Self { reply, address })
  }
}
