use failure::Error;
use std::net::IpAddr;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Fail)]
#[fail(
  display = "fallback resolver {} is the same as the dns address {}, this would be a dns loop",
  fallback, dns
)]
pub struct DnsLoop {
  pub dns: IpAddr,
  pub fallback: IpAddr,
}

#[derive(Debug, Fail)]
#[fail(display = "socks server rejected request with reply code {}", _0)]
pub struct SocksRejected(pub u8);

#[derive(Debug, Fail)]
#[fail(display = "unsupported address")]
pub struct UnsupportedAddress;

#[derive(Debug, Fail)]
#[fail(display = "iptables {} exited with {}", args, status)]
pub struct RedirectorCommand {
  pub args: String,
  pub status: std::process::ExitStatus,
}
