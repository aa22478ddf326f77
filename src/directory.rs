// this module turns cluster service changes into route table updates
use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Api;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use std::net::IpAddr;
use std::path::Path;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::route::RouteTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
  Added(String, IpAddr),
  Updated(String, IpAddr),
  Deleted(String),
}

pub type EventSink = mpsc::Sender<ServiceEvent>;
pub type EventSource = mpsc::Receiver<ServiceEvent>;

pub fn channel() -> (EventSink, EventSource) {
  mpsc::channel(64)
}

/// Applies events to the route table one at a time, in arrival order.
pub async fn apply_events(mut events: EventSource, routes: RouteTable) {
  use ServiceEvent::*;

  while let Some(event) = events.recv().await {
    let res = match &event {
      Added(name, ip) => {
        info!("ADDED: {} -> {}", name, ip);
        routes.upsert(name, *ip).await
      }
      Updated(name, ip) => {
        info!("CHANGED: {} -> {}", name, ip);
        routes.upsert(name, *ip).await
      }
      Deleted(name) => {
        info!("DELETED: {}", name);
        routes.remove(name).await
      }
    };

    if let Err(e) = res {
      warn!("failed to apply {:?}: {}", event, e);
    }
  }
}

// remembers what has been announced so plain watch events can be told apart
// as additions, updates and deletions
#[derive(Default)]
struct Tracker {
  known: HashMap<String, IpAddr>,
  relist: Option<HashSet<String>>,
}

impl Tracker {
  fn apply(&mut self, svc: &Service) -> Option<ServiceEvent> {
    use ServiceEvent::*;

    let name = route_name(svc)?;
    if let Some(seen) = self.relist.as_mut() {
      seen.insert(name.clone());
    }

    match cluster_ip(svc) {
      Some(ip) => match self.known.insert(name.clone(), ip) {
        None => Some(Added(name, ip)),
        Some(old) if old == ip => None,
        Some(_) => Some(Updated(name, ip)),
      },
      None => self.known.remove(&name).map(|_| Deleted(name)),
    }
  }

  fn delete(&mut self, svc: &Service) -> Option<ServiceEvent> {
    let name = route_name(svc)?;
    self.known.remove(&name).map(|_| ServiceEvent::Deleted(name))
  }

  fn init(&mut self) {
    self.relist = Some(HashSet::new());
  }

  fn init_done(&mut self) -> Vec<ServiceEvent> {
    let seen = self.relist.take().unwrap_or_default();
    let stale: Vec<String> = self
      .known
      .keys()
      .filter(|name| !seen.contains(*name))
      .cloned()
      .collect();

    stale
      .into_iter()
      .map(|name| {
        self.known.remove(&name);
        ServiceEvent::Deleted(name)
      })
      .collect()
  }

  fn translate(&mut self, event: watcher::Event<Service>) -> Vec<ServiceEvent> {
    use watcher::Event::*;
    match event {
      Apply(svc) | InitApply(svc) => self.apply(&svc).into_iter().collect(),
      Delete(svc) => self.delete(&svc).into_iter().collect(),
      Init => {
        self.init();
        vec![]
      }
      InitDone => self.init_done(),
    }
  }
}

fn route_name(svc: &Service) -> Option<String> {
  svc.metadata.name.as_ref().map(|name| format!("{}.", name))
}

// headless services have no address to route to
fn cluster_ip(svc: &Service) -> Option<IpAddr> {
  let ip = svc.spec.as_ref()?.cluster_ip.as_ref()?;
  ip.parse().ok()
}

pub struct KubeDirectory {
  client: kube::Client,
}

impl KubeDirectory {
  pub async fn setup(kubeconfig: &Path) -> Result<Self> {
    let kubeconfig = Kubeconfig::read_from(kubeconfig).map_err(|e| {
      format_err!("unable to read kubeconfig {}: {}", kubeconfig.display(), e)
    })?;
    let options = KubeConfigOptions::default();
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
    let client = kube::Client::try_from(config)?;

    let version = client
      .apiserver_version()
      .await
      .map_err(|e| format_err!("cluster api unreachable: {}", e))?;
    info!("connected to cluster api {}", version.git_version);

    Ok(Self { client })
  }

  pub async fn start(self, sink: EventSink) -> Result<()> {
    let api: Api<Service> = Api::all(self.client);
    let mut tracker = Tracker::default();

    let stream = watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
      let event = match event {
        Ok(event) => event,
        Err(e) => {
          warn!("service watch failed: {}", e);
          continue;
        }
      };

      for event in tracker.translate(event) {
        if sink.send(event).await.is_err() {
          return Ok(());
        }
      }
    }

    bail!("service watch ended")
  }
}
