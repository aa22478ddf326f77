use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DnsLoop, Result};

#[derive(Debug, Clone)]
pub struct DnsConfig {
  // address the redirector sends dns traffic for
  pub ip: IpAddr,
  pub fallback: IpAddr,
  pub bind_port: u16,
}

#[derive(Debug, Clone)]
pub struct InterceptConfig {
  pub bind_port: u16,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
  pub remote: String,
  pub user: String,
  pub socks_port: u16,
  pub restart_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct RedirectorConfig {
  pub chain: String,
}

#[derive(Debug, Clone)]
pub struct Config {
  pub kubeconfig: PathBuf,
  pub dns_config: DnsConfig,
  pub intercept_config: InterceptConfig,
  pub tunnel_config: TunnelConfig,
  pub redirector_config: RedirectorConfig,
}

impl DnsConfig {
  /// Picks a public resolver that differs from the advertised dns address
  /// when no fallback was given, and refuses configurations that would send
  /// forwarded queries straight back to us.
  pub fn new(
    ip: IpAddr,
    fallback: Option<IpAddr>,
    bind_port: u16,
  ) -> Result<Self> {
    let fallback = fallback.unwrap_or_else(|| default_fallback(ip));
    if fallback == ip {
      return Err(DnsLoop { dns: ip, fallback }.into());
    }

    Ok(Self {
      ip,
      fallback,
      bind_port,
    })
  }

  pub fn fallback_addr(&self) -> SocketAddr {
    (self.fallback, 53).into()
  }
}

fn default_fallback(ip: IpAddr) -> IpAddr {
  let google: IpAddr = [8, 8, 8, 8].into();
  if ip == google {
    [8, 8, 4, 4].into()
  } else {
    google
  }
}

impl TunnelConfig {
  pub fn socks_addr(&self) -> SocketAddr {
    ([127, 0, 0, 1], self.socks_port).into()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::DnsLoop;

  #[test]
  fn derives_fallback() {
    let conf = DnsConfig::new([10, 0, 0, 1].into(), None, 1233).unwrap();
    assert_eq!(conf.fallback, IpAddr::from([8, 8, 8, 8]));

    let conf = DnsConfig::new([8, 8, 8, 8].into(), None, 1233).unwrap();
    assert_eq!(conf.fallback, IpAddr::from([8, 8, 4, 4]));
    assert_eq!(conf.fallback_addr(), ([8, 8, 4, 4], 53).into());
  }

  #[test]
  fn refuses_dns_loop() {
    let addrs: Vec<IpAddr> = vec![
      [10, 0, 0, 1].into(),
      [8, 8, 4, 4].into(),
      "::1".parse().unwrap(),
    ];
    for ip in addrs {
      let err = DnsConfig::new(ip, Some(ip), 1233).unwrap_err();
      let dns_loop = err.downcast_ref::<DnsLoop>().unwrap();
      assert_eq!(dns_loop.dns, ip);
      assert_eq!(dns_loop.fallback, ip);
    }
  }
}
