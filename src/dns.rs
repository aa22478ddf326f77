// this module answers dns queries for cluster services and forwards the rest
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::config::DnsConfig;
use crate::error::Result;
use crate::route::RouteTable;

const TTL: u32 = 60;
const RECV_BUF_SIZE: usize = 4096;
// upstream replies may be as large as the requester's edns payload allows
const MAX_UDP_SIZE: usize = 65535;
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(2);

pub struct DnsResponder {
  socket: Arc<UdpSocket>,
  routes: RouteTable,
  fallback: SocketAddr,
}

impl DnsResponder {
  pub async fn setup(conf: &DnsConfig, routes: &RouteTable) -> Result<Self> {
    let bind_addr = ([0, 0, 0, 0], conf.bind_port).into();
    Self::bind(bind_addr, conf.fallback_addr(), routes).await
  }

  pub async fn bind(
    bind_addr: SocketAddr,
    fallback: SocketAddr,
    routes: &RouteTable,
  ) -> Result<Self> {
    let socket = UdpSocket::bind(bind_addr)
      .await
      .map_err(|e| format_err!("failed to bind dns listener {}: {}", bind_addr, e))?;

    Ok(Self {
      socket: Arc::new(socket),
      routes: routes.clone(),
      fallback,
    })
  }

  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.socket.local_addr()?)
  }

  pub async fn start(self) -> Result<()> {
    info!(
      "dns responder listening on {}, fallback {}",
      self.local_addr()?,
      self.fallback
    );

    loop {
      let mut recv_buf = vec![0u8; RECV_BUF_SIZE];
      let (len, src) = match self.socket.recv_from(&mut recv_buf).await {
        Ok(x) => x,
        Err(e) => {
          warn!("dns recv failed: {}", e);
          continue;
        }
      };
      recv_buf.truncate(len);

      let socket = self.socket.clone();
      let routes = self.routes.clone();
      let fallback = self.fallback;
      tokio::spawn(async move {
        let query = Bytes::from(recv_buf);
        match Self::respond(&routes, fallback, query).await {
          Ok(Some(reply)) => {
            if let Err(e) = socket.send_to(&reply, src).await {
              warn!("dns reply to {} failed: {}", src, e);
            }
          }
          Ok(None) => (),
          Err(e) => warn!("dns query from {} dropped: {}", src, e),
        }
      });
    }
  }

  async fn respond(
    routes: &RouteTable,
    fallback: SocketAddr,
    query: Bytes,
  ) -> Result<Option<Vec<u8>>> {
    let request = match Message::from_vec(&query) {
      Ok(request) => request,
      Err(e) => {
        debug!("ignoring malformed dns query: {}", e);
        return Ok(None);
      }
    };

    if let Some(q) = request.queries().first() {
      debug!("dns request for {} {}", q.name(), q.query_type());
      if let Some(reply) = Self::answer(routes, &request, q)? {
        return Ok(Some(reply));
      }
    }

    Self::forward(fallback, &query).await.map(Some)
  }

  fn answer(
    routes: &RouteTable,
    request: &Message,
    query: &Query,
  ) -> Result<Option<Vec<u8>>> {
    if query.query_type() != RecordType::A {
      return Ok(None);
    }
    let name = query.name().to_lowercase().to_ascii();
    let ip = match routes.lookup(&name) {
      Some(IpAddr::V4(ip)) => ip,
      _ => return Ok(None),
    };

    let mut reply = Message::new();
    reply
      .set_id(request.id())
      .set_message_type(MessageType::Response)
      .set_op_code(request.op_code())
      .set_recursion_desired(request.recursion_desired())
      .set_authoritative(true)
      .add_query(query.clone())
      .add_answer(Record::from_rdata(
        query.name().clone(),
        TTL,
        RData::A(A(ip)),
      ));
    Ok(Some(reply.to_vec()?))
  }

  // relays the query untouched and hands back the upstream reply untouched
  async fn forward(fallback: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
    let bind_addr: SocketAddr = match fallback {
      SocketAddr::V4(_) => ([0, 0, 0, 0], 0).into(),
      SocketAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.connect(fallback).await?;
    socket.send(query).await?;

    let mut recv_buf = vec![0u8; MAX_UDP_SIZE];
    let len = timeout(FALLBACK_TIMEOUT, socket.recv(&mut recv_buf))
      .await
      .map_err(|_| format_err!("fallback resolver {} timed out", fallback))??;
    recv_buf.truncate(len);
    Ok(recv_buf)
  }
}
