use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;

use crate::error::Result;
use crate::redirect::Redirector;

// map from service domain (with trailing dot) to its cluster address,
// every address in here is also redirected to the intercepting listener
#[derive(Clone)]
pub struct RouteTable {
  routes: Arc<DashMap<String, IpAddr>>,
  redirector: Arc<dyn Redirector>,
  intercept_port: u16,
}

impl RouteTable {
  pub fn new(redirector: Arc<dyn Redirector>, intercept_port: u16) -> Self {
    Self {
      routes: Arc::new(DashMap::new()),
      redirector,
      intercept_port,
    }
  }

  pub async fn upsert(&self, name: &str, ip: IpAddr) -> Result<()> {
    let old = self.routes.insert(name.to_owned(), ip);
    // the name already resolves to the new address, so redirect it first
    self.redirector.forward_tcp(ip, self.intercept_port).await?;
    match old.filter(|old| *old != ip) {
      Some(old) => self.release(old).await,
      None => Ok(()),
    }
  }

  pub async fn remove(&self, name: &str) -> Result<()> {
    match self.routes.remove(name) {
      Some((_, ip)) => self.release(ip).await,
      None => Ok(()),
    }
  }

  pub fn lookup(&self, name: &str) -> Option<IpAddr> {
    self.routes.get(name).map(|entry| *entry.value())
  }

  // only drop the redirect once no other name points at the address
  async fn release(&self, ip: IpAddr) -> Result<()> {
    if self.routes.iter().any(|entry| *entry.value() == ip) {
      return Ok(());
    }
    self.redirector.clear_tcp(ip).await
  }
}
