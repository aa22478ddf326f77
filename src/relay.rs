// forwards bytes between two streams, one task per direction
use std::io;
use std::net::{Shutdown, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const CHUNK_SIZE: usize = 64 * 1024;

/// A byte stream whose directions can be closed independently.
pub trait Duplex: Send + 'static {
  type Read: AsyncRead + Unpin + Send + 'static;
  type Write: AsyncWrite + Unpin + Send + 'static;

  fn peer(&self) -> Option<SocketAddr>;
  fn into_halves(self) -> (Self::Read, Self::Write);
  fn shutdown_read(read: &Self::Read) -> io::Result<()>;
}

impl Duplex for TcpStream {
  type Read = OwnedReadHalf;
  type Write = OwnedWriteHalf;

  fn peer(&self) -> Option<SocketAddr> {
    self.peer_addr().ok()
  }

  fn into_halves(self) -> (OwnedReadHalf, OwnedWriteHalf) {
    self.into_split()
  }

  fn shutdown_read(read: &OwnedReadHalf) -> io::Result<()> {
    socket2::SockRef::from(read.as_ref()).shutdown(Shutdown::Read)
  }
}

/// Starts copying `a -> b` and `b -> a`. Each direction finishes on its own;
/// the connection is gone once both handles have completed.
pub fn relay<A: Duplex, B: Duplex>(
  a: A,
  b: B,
) -> (JoinHandle<u64>, JoinHandle<u64>) {
  let a_peer = a.peer();
  let b_peer = b.peer();
  let (a_rx, a_tx) = a.into_halves();
  let (b_rx, b_tx) = b.into_halves();

  let up = tokio::spawn(pipe::<A, B>(a_rx, b_tx, a_peer, b_peer));
  let down = tokio::spawn(pipe::<B, A>(b_rx, a_tx, b_peer, a_peer));
  (up, down)
}

async fn pipe<F: Duplex, T: Duplex>(
  mut from: F::Read,
  mut to: T::Write,
  from_peer: Option<SocketAddr>,
  to_peer: Option<SocketAddr>,
) -> u64 {
  let mut buf = vec![0u8; CHUNK_SIZE];
  let mut total = 0u64;

  loop {
    let n = match from.read(&mut buf).await {
      Ok(0) => break,
      Ok(n) => n,
      Err(e) => {
        warn!("read from {:?} failed: {}", from_peer, e);
        break;
      }
    };
    if let Err(e) = to.write_all(&buf[..n]).await {
      warn!("write to {:?} failed: {}", to_peer, e);
      break;
    }
    total += n as u64;
  }

  debug!("closed read: {:?}", from_peer);
  if let Err(e) = F::shutdown_read(&from) {
    debug!("shutdown read of {:?}: {}", from_peer, e);
  }
  debug!("closed write: {:?}", to_peer);
  if let Err(e) = to.shutdown().await {
    debug!("shutdown write of {:?}: {}", to_peer, e);
  }
  total
}
