use crate::config::Config;
use crate::error::Result;

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
  about = "Resolve and reach cluster services from the local machine through an ssh socks tunnel"
)]
pub struct CliConfig {
  /// Path to the kubeconfig file
  ///
  /// Defaults to ~/.kube/config.
  #[structopt(long, parse(from_os_str))]
  kubeconfig: Option<PathBuf>,

  /// Address the bridge advertises as its dns server
  ///
  /// UDP traffic to this address is redirected to the local dns responder.
  #[structopt(long, default_value = "10.0.0.1")]
  dns: IpAddr,

  /// Upstream resolver for names that are not cluster services
  ///
  /// Defaults to 8.8.8.8 (8.8.4.4 if --dns is 8.8.8.8). Must differ from --dns.
  #[structopt(long)]
  fallback: Option<IpAddr>,

  /// Host running the remote end of the ssh tunnel
  #[structopt(long)]
  remote: String,

  /// Login used for the ssh tunnel
  #[structopt(long, default_value = "telepresence")]
  user: String,

  /// Name of the iptables chain holding the redirect rules
  #[structopt(long, default_value = "cluster-bridge")]
  chain: String,

  /// Port for the intercepting TCP listener
  #[structopt(long, default_value = "1234")]
  tcp_port: u16,

  /// Port for the dns responder
  #[structopt(long, default_value = "1233")]
  dns_port: u16,

  /// Port of the dynamic socks proxy exposed by ssh
  #[structopt(long, default_value = "1080")]
  socks_port: u16,
}

impl CliConfig {
  pub fn into_config(self) -> Result<Config> {
    use crate::config::*;

    let kubeconfig = match self.kubeconfig {
      Some(path) => path,
      None => dirs::home_dir()
        .ok_or_else(|| format_err!("unable to determine home directory"))?
        .join(".kube/config"),
    };
    let dns_config = DnsConfig::new(self.dns, self.fallback, self.dns_port)?;
    let intercept_config = InterceptConfig {
      bind_port: self.tcp_port,
    };
    let tunnel_config = TunnelConfig {
      remote: self.remote,
      user: self.user,
      socks_port: self.socks_port,
      restart_delay: Duration::from_secs(1),
    };
    let redirector_config = RedirectorConfig { chain: self.chain };

    Ok(Config {
      kubeconfig,
      dns_config,
      intercept_config,
      tunnel_config,
      redirector_config,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(args: &[&str]) -> Result<Config> {
    let mut argv = vec!["cluster-bridge"];
    argv.extend_from_slice(args);
    CliConfig::from_iter_safe(argv)?.into_config()
  }

  #[test]
  fn applies_defaults() {
    let conf = parse(&["--remote", "1.2.3.4", "--kubeconfig", "/tmp/kc"]).unwrap();
    assert_eq!(conf.kubeconfig, PathBuf::from("/tmp/kc"));
    assert_eq!(conf.dns_config.ip, IpAddr::from([10, 0, 0, 1]));
    assert_eq!(conf.dns_config.fallback, IpAddr::from([8, 8, 8, 8]));
    assert_eq!(conf.dns_config.bind_port, 1233);
    assert_eq!(conf.intercept_config.bind_port, 1234);
    assert_eq!(conf.tunnel_config.socks_port, 1080);
    assert_eq!(conf.tunnel_config.user, "telepresence");
    assert_eq!(conf.tunnel_config.restart_delay, Duration::from_secs(1));
  }

  #[test]
  fn rejects_equal_dns_and_fallback() {
    let res = parse(&[
      "--remote",
      "1.2.3.4",
      "--dns",
      "1.1.1.1",
      "--fallback",
      "1.1.1.1",
    ]);
    assert!(res.is_err());
  }
}
