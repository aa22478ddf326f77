// this module implements a transparent proxy
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

use crate::config::InterceptConfig;
use crate::error::Result;
use crate::redirect::Redirector;
use crate::relay::relay;
use crate::socks::Client as SocksClient;
use crate::tunnel;

pub struct Client {
  pub socket: TcpStream,
  // the actual destination
  pub dest: SocketAddr,
  // the source
  pub src: SocketAddr,
}

// transparent proxy
pub struct Tproxy {
  listener: TcpListener,
  socks_client: SocksClient,
  redirector: Arc<dyn Redirector>,
}

impl Tproxy {
  pub async fn setup(
    conf: &InterceptConfig,
    tunnel: &tunnel::Handle,
    redirector: Arc<dyn Redirector>,
  ) -> Result<Self> {
    let bind_addr = ([0, 0, 0, 0], conf.bind_port).into();
    Self::bind(bind_addr, tunnel.proxy(), redirector).await
  }

  pub async fn bind(
    bind_addr: SocketAddr,
    socks_client: SocksClient,
    redirector: Arc<dyn Redirector>,
  ) -> Result<Self> {
    let listener = TcpListener::bind(bind_addr)
      .await
      .map_err(|e| format_err!("failed to bind tcp listener {}: {}", bind_addr, e))?;

    Ok(Tproxy {
      listener,
      socks_client,
      redirector,
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  pub async fn start(self) -> Result<()> {
    info!("intercepting connections on {}", self.local_addr()?);

    loop {
      let (socket, src) = match self.listener.accept().await {
        Ok(x) => x,
        Err(e) if is_transient(&e) => {
          warn!("accept failed: {}", e);
          continue;
        }
        Err(e) => {
          error!("listener failed, no longer accepting connections: {}", e);
          return Err(e.into());
        }
      };

      let socks_client = self.socks_client.clone();
      let redirector = self.redirector.clone();
      tokio::spawn(async move {
        let client = match Self::resolve(redirector.as_ref(), socket, src) {
          Ok(client) => client,
          Err(e) => {
            warn!("dropping connection from {}: {}", src, e);
            return;
          }
        };
        if let Err(e) = Self::forward_to_socks_proxy(socks_client, client).await {
          warn!("dropping connection from {}: {}", src, e);
        }
      });
    }
  }

  fn resolve(
    redirector: &dyn Redirector,
    socket: TcpStream,
    src: SocketAddr,
  ) -> Result<Client> {
    let dest = redirector
      .original_dst(&socket)
      .map_err(|e| format_err!("original destination lookup failed: {}", e))?;

    // a connection made straight to the listener would loop back to us
    ensure!(
      Some(dest) != socket.local_addr().ok(),
      "connection to {} was not redirected",
      dest
    );

    Ok(Client { socket, dest, src })
  }

  async fn forward_to_socks_proxy(
    socks_client: SocksClient,
    client: Client,
  ) -> Result<()> {
    info!("CONNECT: {} -> {}", client.src, client.dest);

    let socks_stream =
      socks_client.tcp_connect(client.dest).await.map_err(|e| {
        format_err!(
          "dialing {} through {} failed: {}",
          client.dest,
          socks_client.server_addr(),
          e
        )
      })?;

    relay(client.socket, socks_stream);
    Ok(())
  }
}

fn is_transient(e: &io::Error) -> bool {
  use io::ErrorKind::*;
  match e.kind() {
    ConnectionAborted | ConnectionReset | Interrupted | WouldBlock => true,
    _ => matches!(
      e.raw_os_error(),
      Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    ),
  }
}
