use std::net::SocketAddr;
use tokio::net::TcpStream;

use crate::error::{Result, SocksRejected};
use crate::socks::proto;

#[derive(Clone, Debug)]
pub struct Client {
  server_addr: SocketAddr,
}

impl Client {
  pub fn new(server_addr: SocketAddr) -> Self {
    Self { server_addr }
  }

  pub fn server_addr(&self) -> SocketAddr {
    self.server_addr
  }

  async fn handshake(&self) -> Result<TcpStream> {
    use proto::*;
    let mut client = TcpStream::connect(self.server_addr).await?;
    let auth_methods = vec![SOCKS5_AUTH_METHOD_NONE];
    let handshake_req = HandshakeRequest::new(auth_methods);
    handshake_req.write_to(&mut client).await?;

    let handshake_resp = HandshakeResponse::read_from(&mut client).await?;
    ensure!(
      handshake_resp.chosen_method != SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
      "socks server requires authentication"
    );
    ensure!(
      handshake_resp.chosen_method == SOCKS5_AUTH_METHOD_NONE,
      "auth_none not supported!"
    );

    Ok(client)
  }

  pub async fn tcp_connect(&self, address: SocketAddr) -> Result<TcpStream> {
    use proto::Reply::{Failed, Succeeded};

    let mut client = self.handshake().await?;
    let req = {
      let command = proto::Command::TcpConnect;
      let address = address.into();
      proto::TcpRequestHeader { command, address }
    };

    req.write_to(&mut client).await?;
    let resp = proto::TcpResponseHeader::read_from(&mut client).await?;
    match resp.reply {
      Succeeded => {
        debug!("socks server bound {:?} for {}", resp.address, address);
        Ok(client)
      }
      Failed(code) => Err(SocksRejected(code).into()),
    }
  }
}

#[cfg(test)]
pub mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;
  use tokio::sync::mpsc;

  // accepts one no-auth CONNECT per connection and answers with `reply`,
  // returns the listening address and the requested destinations
  pub async fn stub_server(
    reply: u8,
  ) -> (SocketAddr, mpsc::UnboundedReceiver<(TcpStream, SocketAddr)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
      loop {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 3];
        socket.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        socket.write_all(&[5, 0]).await.unwrap();

        let mut req = [0u8; 10];
        socket.read_exact(&mut req).await.unwrap();
        assert_eq!(&req[..4], &[5, 1, 0, 1]);
        let ip = [req[4], req[5], req[6], req[7]];
        let port = u16::from_be_bytes([req[8], req[9]]);

        socket
          .write_all(&[5, reply, 0, 1, 127, 0, 0, 1, 0, 0])
          .await
          .unwrap();
        if tx.send((socket, (ip, port).into())).is_err() {
          return;
        }
      }
    });

    (addr, rx)
  }

  #[tokio::test]
  async fn connects_through_proxy() {
    let (addr, mut requests) = stub_server(0).await;
    let client = Client::new(addr);
    let mut stream = client.tcp_connect(([10, 1, 2, 3], 80).into()).await.unwrap();

    let (mut upstream, dest) = requests.recv().await.unwrap();
    assert_eq!(dest, ([10, 1, 2, 3], 80).into());

    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    upstream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
  }

  #[tokio::test]
  async fn reports_rejection() {
    let (addr, _requests) = stub_server(5).await;
    let client = Client::new(addr);
    let err = client
      .tcp_connect(([10, 1, 2, 3], 80).into())
      .await
      .unwrap_err();
    assert_eq!(err.downcast_ref::<SocksRejected>().unwrap().0, 5);
  }

  #[tokio::test]
  async fn fails_without_proxy() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(addr);
    assert!(client.tcp_connect(([10, 1, 2, 3], 80).into()).await.is_err());
  }
}
