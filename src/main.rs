#[macro_use]
extern crate failure;
#[macro_use]
extern crate log;

mod cli;
mod config;
mod directory;
mod dns;
mod error;
mod redirect;
mod relay;
mod route;
mod shutdown;
mod socks;
mod tproxy;
mod tunnel;

use crate::cli::CliConfig;
use crate::config::Config;
use crate::directory::KubeDirectory;
use crate::dns::DnsResponder;
use crate::error::Result;
use crate::redirect::{Iptables, Redirector};
use crate::route::RouteTable;
use crate::shutdown::{Coordinator, Signals};
use crate::tproxy::Tproxy;
use crate::tunnel::{Ssh, Supervisor};

use std::future::Future;
use std::sync::Arc;
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
  initialize_logging();
  let config = CliConfig::from_args().into_config()?;

  // fail before touching any redirect rules if the cluster is unreachable
  let directory = KubeDirectory::setup(&config.kubeconfig).await?;

  let signals = Signals::register()?;
  let redirector: Arc<dyn Redirector> =
    Arc::new(Iptables::new(&config.redirector_config));
  redirector.enable().await?;

  // from here on the coordinator owns tearing the redirects down
  let coordinator = match start(config, directory, redirector.clone()).await {
    Ok(coordinator) => coordinator,
    Err(e) => {
      if let Err(e) = redirector.disable().await {
        warn!("failed to disable redirects: {}", e);
      }
      return Err(e);
    }
  };
  coordinator.run(signals.recv()).await;
  Ok(())
}

async fn start(
  config: Config,
  directory: KubeDirectory,
  redirector: Arc<dyn Redirector>,
) -> Result<Coordinator> {
  let intercept_port = config.intercept_config.bind_port;
  let routes = RouteTable::new(redirector.clone(), intercept_port);

  // setup dns responder
  let dns = DnsResponder::setup(&config.dns_config, &routes).await?;
  let dns_config = &config.dns_config;
  redirector
    .forward_udp(dns_config.ip, dns_config.bind_port)
    .await?;

  // setup tunnel and transparent proxy
  let tunnel_config = &config.tunnel_config;
  let (supervisor, tunnel) = Supervisor::new(
    Ssh::new(tunnel_config),
    tunnel_config.restart_delay,
    tunnel_config.socks_addr(),
  );
  let tproxy =
    Tproxy::setup(&config.intercept_config, &tunnel, redirector.clone())
      .await?;

  // service events flow through a single ordered queue
  let (sink, source) = directory::channel();
  tokio::spawn(directory::apply_events(source, routes));
  tokio::spawn(log_exit("service directory", directory.start(sink)));

  tokio::spawn(log_exit("dns responder", dns.start()));
  tokio::spawn(supervisor.run());
  tokio::spawn(log_exit("transparent proxy", tproxy.start()));

  Ok(Coordinator::new(tunnel, redirector))
}

async fn log_exit<F>(name: &'static str, fut: F)
where
  F: Future<Output = Result<()>>,
{
  if let Err(e) = fut.await {
    error!("{} stopped: {}", name, e);
  }
}

fn initialize_logging() {
  let filter = EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}
