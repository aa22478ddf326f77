// this module programs the kernel to hand cluster-bound traffic to us
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::RedirectorConfig;
use crate::error::{RedirectorCommand, Result, UnsupportedAddress};

#[async_trait]
pub trait Redirector: Send + Sync {
  async fn enable(&self) -> Result<()>;
  async fn disable(&self) -> Result<()>;
  async fn forward_tcp(&self, ip: IpAddr, port: u16) -> Result<()>;
  async fn forward_udp(&self, ip: IpAddr, port: u16) -> Result<()>;
  async fn clear_tcp(&self, ip: IpAddr) -> Result<()>;

  // the destination a redirected connection was heading to
  fn original_dst(&self, socket: &TcpStream) -> Result<SocketAddr>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Proto {
  Tcp,
  Udp,
}

impl Proto {
  fn as_str(self) -> &'static str {
    match self {
      Proto::Tcp => "tcp",
      Proto::Udp => "udp",
    }
  }
}

/// Netfilter backed redirector.
///
/// All rules live in a dedicated chain of the `nat` table which is jumped to
/// from `OUTPUT`, so tearing the chain down removes every redirect at once.
pub struct Iptables {
  chain: String,
  tcp: Mutex<HashMap<IpAddr, u16>>,
  udp: Mutex<HashMap<IpAddr, u16>>,
}

impl Iptables {
  pub fn new(conf: &RedirectorConfig) -> Self {
    Self {
      chain: conf.chain.clone(),
      tcp: Mutex::new(HashMap::new()),
      udp: Mutex::new(HashMap::new()),
    }
  }

  async fn iptables(&self, args: &[String]) -> Result<()> {
    let status = Command::new("iptables")
      .arg("-t")
      .arg("nat")
      .args(args)
      .status()
      .await?;

    if !status.success() {
      let args = args.join(" ");
      return Err(RedirectorCommand { args, status }.into());
    }
    Ok(())
  }

  fn rule(&self, op: &str, proto: Proto, ip: IpAddr, port: u16) -> Vec<String> {
    vec![
      op.into(),
      self.chain.clone(),
      "-d".into(),
      format!("{}/32", ip),
      "-p".into(),
      proto.as_str().into(),
      "-j".into(),
      "REDIRECT".into(),
      "--to-ports".into(),
      port.to_string(),
    ]
  }

  fn jump(&self, op: &str) -> Vec<String> {
    vec![op.into(), "OUTPUT".into(), "-j".into(), self.chain.clone()]
  }

  async fn forward(&self, proto: Proto, ip: IpAddr, port: u16) -> Result<()> {
    ensure_ipv4(ip)?;
    let mut rules = match proto {
      Proto::Tcp => self.tcp.lock().await,
      Proto::Udp => self.udp.lock().await,
    };

    match rules.get(&ip) {
      Some(&old) if old == port => return Ok(()),
      Some(&old) => self.iptables(&self.rule("-D", proto, ip, old)).await?,
      None => (),
    }

    rules.remove(&ip);
    self.iptables(&self.rule("-A", proto, ip, port)).await?;
    rules.insert(ip, port);
    debug!("redirecting {} {} to port {}", proto.as_str(), ip, port);
    Ok(())
  }
}

fn ensure_ipv4(ip: IpAddr) -> Result<()> {
  match ip {
    IpAddr::V4(_) => Ok(()),
    IpAddr::V6(_) => Err(UnsupportedAddress.into()),
  }
}

#[async_trait]
impl Redirector for Iptables {
  async fn enable(&self) -> Result<()> {
    if self.iptables(&["-N".into(), self.chain.clone()]).await.is_err() {
      // left over from an unclean exit
      self.iptables(&["-F".into(), self.chain.clone()]).await?;
    }
    if self.iptables(&self.jump("-C")).await.is_err() {
      self.iptables(&self.jump("-I")).await?;
    }
    info!("enabled redirect chain {}", self.chain);
    Ok(())
  }

  async fn disable(&self) -> Result<()> {
    let steps = vec![
      self.jump("-D"),
      vec!["-F".into(), self.chain.clone()],
      vec!["-X".into(), self.chain.clone()],
    ];

    let mut first_err = None;
    for step in steps {
      if let Err(e) = self.iptables(&step).await {
        warn!("failed to remove redirect chain {}: {}", self.chain, e);
        first_err.get_or_insert(e);
      }
    }
    self.tcp.lock().await.clear();
    self.udp.lock().await.clear();

    match first_err {
      Some(e) => Err(e),
      None => {
        info!("disabled redirect chain {}", self.chain);
        Ok(())
      }
    }
  }

  async fn forward_tcp(&self, ip: IpAddr, port: u16) -> Result<()> {
    self.forward(Proto::Tcp, ip, port).await
  }

  async fn forward_udp(&self, ip: IpAddr, port: u16) -> Result<()> {
    self.forward(Proto::Udp, ip, port).await
  }

  async fn clear_tcp(&self, ip: IpAddr) -> Result<()> {
    let mut rules = self.tcp.lock().await;
    if let Some(&port) = rules.get(&ip) {
      // stays tracked until the kernel rule is really gone
      self.iptables(&self.rule("-D", Proto::Tcp, ip, port)).await?;
      rules.remove(&ip);
      debug!("stopped redirecting tcp {}", ip);
    }
    Ok(())
  }

  fn original_dst(&self, socket: &TcpStream) -> Result<SocketAddr> {
    original_dst(socket)
  }
}

#[cfg(target_os = "linux")]
fn original_dst(socket: &TcpStream) -> Result<SocketAddr> {
  use std::mem::{size_of, zeroed};
  use std::net::Ipv4Addr;
  use std::os::unix::io::AsRawFd;

  // linux/netfilter_ipv4.h
  const SO_ORIGINAL_DST: libc::c_int = 80;

  let mut addr: libc::sockaddr_in = unsafe { zeroed() };
  let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
  let ret = unsafe {
    libc::getsockopt(
      socket.as_raw_fd(),
      libc::SOL_IP,
      SO_ORIGINAL_DST,
      &mut addr as *mut libc::sockaddr_in as *mut libc::c_void,
      &mut len,
    )
  };
  if ret != 0 {
    return Err(std::io::Error::last_os_error().into());
  }

  let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
  let port = u16::from_be(addr.sin_port);
  Ok((ip, port).into())
}

#[cfg(not(target_os = "linux"))]
fn original_dst(_socket: &TcpStream) -> Result<SocketAddr> {
  bail!("original destination lookup is only supported on linux")
}
