// this module keeps the ssh dynamic proxy alive
use bytes::BytesMut;
use futures::stream::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::time::sleep;
use tokio_util::codec::{Decoder, FramedRead};

use crate::config::TunnelConfig;
use crate::socks::Client as SocksClient;

const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Builds the command for one attempt at running the tunnel.
pub trait Launcher: Send + 'static {
  fn command(&self) -> Command;
}

pub struct Ssh {
  conf: TunnelConfig,
}

impl Ssh {
  pub fn new(conf: &TunnelConfig) -> Self {
    Self { conf: conf.clone() }
  }
}

impl Launcher for Ssh {
  fn command(&self) -> Command {
    let mut cmd = Command::new("ssh");
    cmd
      .arg("-D")
      .arg(format!("localhost:{}", self.conf.socks_port))
      .arg("-C")
      .arg("-N")
      .arg("-oExitOnForwardFailure=yes")
      .arg("-oStrictHostKeyChecking=no")
      .arg(format!("{}@{}", self.conf.user, self.conf.remote));
    cmd
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
  Starting,
  Running,
  Exited,
  Stopping,
  Stopped,
}

pub struct Supervisor<L> {
  launcher: L,
  restart_delay: Duration,
  stop: oneshot::Receiver<()>,
  state: watch::Sender<State>,
}

pub struct Handle {
  stop: Option<oneshot::Sender<()>>,
  state: watch::Receiver<State>,
  proxy: SocksClient,
}

impl<L: Launcher> Supervisor<L> {
  pub fn new(
    launcher: L,
    restart_delay: Duration,
    proxy_addr: SocketAddr,
  ) -> (Self, Handle) {
    let (stop_tx, stop) = oneshot::channel();
    let (state, state_rx) = watch::channel(State::Starting);
    let supervisor = Self {
      launcher,
      restart_delay,
      stop,
      state,
    };
    let handle = Handle {
      stop: Some(stop_tx),
      state: state_rx,
      proxy: SocksClient::new(proxy_addr),
    };
    (supervisor, handle)
  }

  pub async fn run(mut self) {
    let mut attempt = 0u64;

    loop {
      attempt += 1;
      self.set(State::Starting);

      match self.launch() {
        Ok(mut child) => {
          self.set(State::Running);
          tokio::select! {
            _ = &mut self.stop => {
              self.set(State::Stopping);
              info!("killing tunnel (attempt {})", attempt);
              if let Err(e) = child.kill().await {
                warn!("failed to kill tunnel: {}", e);
              }
              break;
            }
            status = child.wait() => match status {
              Ok(status) => warn!("tunnel exited: {}", status),
              Err(e) => warn!("failed to wait for tunnel: {}", e),
            }
          }
        }
        Err(e) => error!("failed to start tunnel: {}", e),
      }

      self.set(State::Exited);
      info!("waiting {:?} before restarting tunnel", self.restart_delay);
      tokio::select! {
        _ = &mut self.stop => {
          self.set(State::Stopping);
          break;
        }
        _ = sleep(self.restart_delay) => (),
      }
    }

    self.set(State::Stopped);
    info!("tunnel stopped");
  }

  fn launch(&self) -> std::io::Result<Child> {
    let mut cmd = self.launcher.command();
    cmd
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    info!("starting tunnel: {:?}", cmd.as_std());

    let mut child = cmd.spawn()?;
    if let Some(stdout) = child.stdout.take() {
      tokio::spawn(drain("tunnel stdout", stdout));
    }
    if let Some(stderr) = child.stderr.take() {
      tokio::spawn(drain("tunnel stderr", stderr));
    }
    Ok(child)
  }

  fn set(&self, state: State) {
    debug!("tunnel state: {:?}", state);
    self.state.send_replace(state);
  }
}

impl Handle {
  pub fn state(&self) -> State {
    *self.state.borrow()
  }

  pub fn proxy(&self) -> SocksClient {
    self.proxy.clone()
  }

  /// Asks the supervisor to kill the tunnel and waits until it is stopped.
  pub async fn stop(&mut self) {
    if let Some(stop) = self.stop.take() {
      let _ = stop.send(());
    }
    while *self.state.borrow() != State::Stopped {
      if self.state.changed().await.is_err() {
        break;
      }
    }
  }
}

// an unread pipe eventually blocks the child, so keep reading until eof
async fn drain<R: AsyncRead + Unpin>(name: &'static str, pipe: R) {
  let mut lines = FramedRead::new(pipe, LossyLines);
  while let Some(line) = lines.next().await {
    match line {
      Ok(line) => info!("{}: {}", name, line),
      Err(e) => {
        warn!("{}: {}", name, e);
        break;
      }
    }
  }
}

/// Newline separated output decoded lossily, so a stray non-utf8 byte costs
/// one garbled line instead of the rest of the stream. Lines longer than
/// `MAX_LINE_LENGTH` come out in pieces.
struct LossyLines;

impl Decoder for LossyLines {
  type Item = String;
  type Error = io::Error;

  fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
    let end = match buf.iter().position(|b| *b == b'\n') {
      Some(pos) => pos + 1,
      None if buf.len() >= MAX_LINE_LENGTH => MAX_LINE_LENGTH,
      None => return Ok(None),
    };
    Ok(Some(lossy(&buf.split_to(end))))
  }

  fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<String>> {
    match self.decode(buf)? {
      Some(line) => Ok(Some(line)),
      None if buf.is_empty() => Ok(None),
      None => Ok(Some(lossy(&buf.split()))),
    }
  }
}

fn lossy(line: &[u8]) -> String {
  let line = String::from_utf8_lossy(line);
  line.trim_end_matches(&['\r', '\n'][..]).to_owned()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use tokio::time::timeout;

  // crashes `crashes` times, then stays up
  struct Flaky {
    launches: Arc<AtomicUsize>,
    crashes: usize,
    pid_file: std::path::PathBuf,
  }

  impl Launcher for Flaky {
    fn command(&self) -> Command {
      let n = self.launches.fetch_add(1, Ordering::SeqCst);
      let script = if n < self.crashes {
        "echo crashing >&2; exit 1".to_string()
      } else {
        format!("echo $$ > {}; exec sleep 30", self.pid_file.display())
      };
      let mut cmd = Command::new("sh");
      cmd.arg("-c").arg(script);
      cmd
    }
  }

  fn flaky(crashes: usize, name: &str) -> (Flaky, Arc<AtomicUsize>) {
    let launches = Arc::new(AtomicUsize::new(0));
    let pid_file = std::env::temp_dir()
      .join(format!("cluster-bridge-{}-{}.pid", name, std::process::id()));
    let _ = std::fs::remove_file(&pid_file);
    let launcher = Flaky {
      launches: launches.clone(),
      crashes,
      pid_file,
    };
    (launcher, launches)
  }

  async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(Duration::from_secs(10), async {
      while !cond() {
        sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .expect("condition not reached");
  }

  #[tokio::test]
  async fn restarts_after_each_crash() {
    let (launcher, launches) = flaky(5, "restart");
    let proxy_addr = ([127, 0, 0, 1], 1080).into();
    let (supervisor, mut handle) =
      Supervisor::new(launcher, Duration::from_millis(10), proxy_addr);
    let task = tokio::spawn(supervisor.run());

    wait_until(|| launches.load(Ordering::SeqCst) == 6).await;
    wait_until(|| handle.state() == State::Running).await;
    assert_eq!(handle.proxy().server_addr(), proxy_addr);

    handle.stop().await;
    assert_eq!(handle.state(), State::Stopped);
    task.await.unwrap();
  }

  #[cfg(target_os = "linux")]
  #[tokio::test]
  async fn stop_kills_running_tunnel() {
    let (launcher, launches) = flaky(0, "kill");
    let pid_file = launcher.pid_file.clone();
    let (supervisor, mut handle) = Supervisor::new(
      launcher,
      Duration::from_millis(10),
      ([127, 0, 0, 1], 1080).into(),
    );
    let task = tokio::spawn(supervisor.run());

    wait_until(|| {
      std::fs::read_to_string(&pid_file)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
    })
    .await;
    let pid = std::fs::read_to_string(&pid_file).unwrap();
    let proc_dir = std::path::PathBuf::from(format!("/proc/{}", pid.trim()));
    assert!(proc_dir.exists());

    handle.stop().await;
    task.await.unwrap();
    assert!(!proc_dir.exists());

    sleep(Duration::from_millis(100)).await;
    assert_eq!(launches.load(Ordering::SeqCst), 1);
    let _ = std::fs::remove_file(&pid_file);
  }

  #[tokio::test]
  async fn stop_during_backoff_skips_restart() {
    let (launcher, launches) = flaky(usize::MAX, "backoff");
    let (supervisor, mut handle) = Supervisor::new(
      launcher,
      Duration::from_secs(3600),
      ([127, 0, 0, 1], 1080).into(),
    );
    let task = tokio::spawn(supervisor.run());

    wait_until(|| handle.state() == State::Exited).await;
    handle.stop().await;
    task.await.unwrap();
    assert_eq!(launches.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn builds_ssh_command() {
    let ssh = Ssh::new(&TunnelConfig {
      remote: "1.2.3.4".into(),
      user: "telepresence".into(),
      socks_port: 1080,
      restart_delay: Duration::from_secs(1),
    });
    let cmd = ssh.command();
    let cmd = cmd.as_std();
    assert_eq!(cmd.get_program(), "ssh");
    let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
    assert_eq!(
      args,
      vec![
        "-D",
        "localhost:1080",
        "-C",
        "-N",
        "-oExitOnForwardFailure=yes",
        "-oStrictHostKeyChecking=no",
        "telepresence@1.2.3.4",
      ]
    );
  }

  async fn decode_all(output: &[u8]) -> Vec<String> {
    FramedRead::new(output, LossyLines)
      .map(|line| line.unwrap())
      .collect::<Vec<_>>()
      .await
  }

  #[tokio::test]
  async fn keeps_logging_after_invalid_utf8() {
    let lines = decode_all(b"\xff\xfe bad\r\nssh: connection lost\npartial").await;
    assert_eq!(
      lines,
      vec!["\u{fffd}\u{fffd} bad", "ssh: connection lost", "partial"]
    );
  }

  #[tokio::test]
  async fn splits_overlong_lines() {
    let mut output = vec![b'a'; MAX_LINE_LENGTH + 10];
    output.extend_from_slice(b"\nok\n");
    let lines = decode_all(&output).await;
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0].len(), MAX_LINE_LENGTH);
    assert_eq!(lines[1].len(), 10);
    assert_eq!(lines[2], "ok");
  }
}
