use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::error::Result;
use crate::redirect::Redirector;
use crate::tunnel;

/// SIGINT/SIGTERM listeners. Once registered, the default action of killing
/// the process is replaced, so register before installing any redirects.
pub struct Signals {
  interrupt: Signal,
  terminate: Signal,
}

impl Signals {
  pub fn register() -> Result<Self> {
    Ok(Self {
      interrupt: signal(SignalKind::interrupt())?,
      terminate: signal(SignalKind::terminate())?,
    })
  }

  pub async fn recv(mut self) -> &'static str {
    tokio::select! {
      _ = self.interrupt.recv() => "SIGINT",
      _ = self.terminate.recv() => "SIGTERM",
    }
  }
}

// owns the only handles that can stop the tunnel and tear down redirects;
// relays and listeners are simply abandoned when the process exits
pub struct Coordinator {
  tunnel: tunnel::Handle,
  redirector: Arc<dyn Redirector>,
}

impl Coordinator {
  pub fn new(tunnel: tunnel::Handle, redirector: Arc<dyn Redirector>) -> Self {
    Self { tunnel, redirector }
  }

  pub async fn run<F>(self, signal: F)
  where
    F: Future<Output = &'static str>,
  {
    info!("received {}, shutting down", signal.await);
    self.shutdown().await;
  }

  async fn shutdown(mut self) {
    self.tunnel.stop().await;
    debug!("tunnel state after stop: {:?}", self.tunnel.state());
    if let Err(e) = self.redirector.disable().await {
      error!("failed to disable redirects: {}", e);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::redirect::fake::{Op, Recorder};
  use crate::tunnel::{Launcher, Supervisor};
  use std::time::Duration;
  use tokio::process::Command;

  struct Sleeper;

  impl Launcher for Sleeper {
    fn command(&self) -> Command {
      let mut cmd = Command::new("sh");
      cmd.arg("-c").arg("exec sleep 30");
      cmd
    }
  }

  #[tokio::test]
  async fn stops_tunnel_then_disables_redirects() {
    let recorder = Arc::new(Recorder::default());
    let (supervisor, handle) = Supervisor::new(
      Sleeper,
      Duration::from_millis(10),
      ([127, 0, 0, 1], 1080).into(),
    );
    let task = tokio::spawn(supervisor.run());

    let coordinator = Coordinator::new(handle, recorder.clone());
    coordinator.run(async { "SIGTERM" }).await;

    task.await.unwrap();
    assert_eq!(recorder.ops(), vec![Op::Disable]);
  }

  #[tokio::test]
  async fn registered_signal_is_caught() {
    let signals = Signals::register().unwrap();
    // the listener is in place, so this no longer terminates the test binary
    unsafe {
      libc::kill(libc::getpid(), libc::SIGTERM);
    }
    let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
      .await
      .unwrap();
    assert_eq!(name, "SIGTERM");
  }
}
