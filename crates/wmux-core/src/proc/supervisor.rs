//! Supervisor for the tmux control-mode subprocess.
//!
//! Keeps exactly one `tmux -CC attach-session` alive on a pseudo-terminal,
//! publishes a writer for outbound command lines, streams stdout lines to
//! a callback, and restarts the subprocess with capped exponential
//! backoff.

use std::io::{BufRead, BufReader, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("tmux control mode not ready")]
    NotReady,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub tmux_bin: String,
    pub target_session: String,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl SupervisorConfig {
    fn normalized(mut self) -> Self {
        if self.backoff_base.is_zero() {
            self.backoff_base = Duration::from_millis(500);
        }
        if self.backoff_max < self.backoff_base {
            self.backoff_max = Duration::from_secs(10);
        }
        self
    }
}

pub type LineCallback = Box<dyn Fn(String) + Send + Sync>;
pub type RestartCallback = Box<dyn Fn() + Send + Sync>;

pub struct ControlModeSupervisor {
    cfg: SupervisorConfig,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    on_line: LineCallback,
    on_restart: RestartCallback,
}

enum RunExit {
    Shutdown,
    Ended(String),
}

impl ControlModeSupervisor {
    pub fn new(
        cfg: SupervisorConfig,
        on_line: LineCallback,
        on_restart: RestartCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg: cfg.normalized(),
            writer: Mutex::new(None),
            on_line,
            on_restart,
        })
    }

    /// Write one command line (a newline is appended). Fails fast when no
    /// subprocess writer is published.
    pub fn send_line(&self, line: &str) -> Result<(), SendError> {
        let mut guard = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let Some(writer) = guard.as_mut() else {
            return Err(SendError::NotReady);
        };
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Supervision loop: run the subprocess, restart on exit with capped
    /// exponential backoff, stop when the shutdown channel fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = self.cfg.backoff_base;
        loop {
            match self.run_once(&mut shutdown).await {
                RunExit::Shutdown => {
                    info!("tmux control client stopped");
                    return;
                }
                RunExit::Ended(reason) => {
                    warn!(reason = %reason, "tmux control client exited");
                }
            }

            (self.on_restart)();

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            if backoff < self.cfg.backoff_max {
                backoff = (backoff * 2).min(self.cfg.backoff_max);
            }
        }
    }

    async fn run_once(self: &Arc<Self>, shutdown: &mut broadcast::Receiver<()>) -> RunExit {
        let pty = match native_pty_system().openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        }) {
            Ok(pty) => pty,
            Err(e) => return RunExit::Ended(format!("openpty: {e}")),
        };

        let mut cmd = CommandBuilder::new(&self.cfg.tmux_bin);
        cmd.args(["-CC", "attach-session", "-t", &self.cfg.target_session]);

        let mut child = match pty.slave.spawn_command(cmd) {
            Ok(child) => child,
            Err(e) => return RunExit::Ended(format!("spawn: {e}")),
        };
        drop(pty.slave);
        let master = pty.master;

        let mut killer = child.clone_killer();

        let writer = match master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                let _ = killer.kill();
                return RunExit::Ended(format!("take writer: {e}"));
            }
        };
        let reader = match master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                let _ = killer.kill();
                return RunExit::Ended(format!("clone reader: {e}"));
            }
        };

        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(writer);
        info!(pid = ?child.process_id(), "tmux control client started");

        // Bridge blocking line reads into the async loop.
        let (read_done_tx, mut read_done_rx) = mpsc::channel::<std::io::Result<()>>(1);
        let sup = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = sup.read_lines(reader);
            let _ = read_done_tx.blocking_send(result);
        });

        let wait_task = tokio::task::spawn_blocking(move || child.wait());

        let exit = tokio::select! {
            _ = shutdown.recv() => {
                let _ = killer.kill();
                RunExit::Shutdown
            }
            done = read_done_rx.recv() => match done {
                Some(Ok(())) => RunExit::Ended("stdout closed".to_string()),
                Some(Err(e)) => RunExit::Ended(format!("read: {e}")),
                None => RunExit::Ended("reader gone".to_string()),
            },
            status = wait_task => match status {
                Ok(Ok(status)) => RunExit::Ended(format!("exit status {status:?}")),
                Ok(Err(e)) => RunExit::Ended(format!("wait: {e}")),
                Err(e) => RunExit::Ended(format!("wait task: {e}")),
            },
        };

        *self.writer.lock().unwrap_or_else(|e| e.into_inner()) = None;
        // Dropping the master closes the PTY and unblocks the subprocess.
        drop(master);
        exit
    }

    fn read_lines(&self, reader: Box<dyn std::io::Read + Send>) -> std::io::Result<()> {
        let mut reader = BufReader::with_capacity(64 * 1024, reader);
        let mut buf = Vec::with_capacity(4096);
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                return Ok(());
            }
            if buf.last() == Some(&b'\n') {
                buf.pop();
            }
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            let line = String::from_utf8_lossy(&buf).into_owned();
            debug!(line = %line, "tmux stdout");
            (self.on_line)(line);
        }
    }
}

impl crate::hub::ControlSender for ControlModeSupervisor {
    fn send_line(&self, line: &str) -> Result<()> {
        ControlModeSupervisor::send_line(self, line)?;
        Ok(())
    }
}

/// Sanity-check the tmux binary by invoking `tmux -V`.
pub async fn check_tmux(tmux_bin: &str) -> Result<()> {
    let output = tokio::process::Command::new(tmux_bin)
        .arg("-V")
        .output()
        .await
        .with_context(|| format!("tmux sanity check failed: cannot run {tmux_bin:?}"))?;
    if !output.status.success() {
        bail!(
            "tmux sanity check failed: {}",
            combined_output(&output.stdout, &output.stderr)
        );
    }
    Ok(())
}

/// Make sure the target session exists: `has-session`, otherwise a
/// detached `new-session`. Idempotent.
pub async fn ensure_session(tmux_bin: &str, name: &str) -> Result<()> {
    let check = tokio::process::Command::new(tmux_bin)
        .args(["has-session", "-t", name])
        .output()
        .await
        .with_context(|| format!("cannot run {tmux_bin:?}"))?;
    if check.status.success() {
        return Ok(());
    }

    let create = tokio::process::Command::new(tmux_bin)
        .args(["new-session", "-d", "-s", name])
        .output()
        .await
        .with_context(|| format!("cannot run {tmux_bin:?}"))?;
    if !create.status.success() {
        bail!(
            "create session {name:?}: {}",
            combined_output(&create.stdout, &create.stderr)
        );
    }
    Ok(())
}

fn combined_output(stdout: &[u8], stderr: &[u8]) -> String {
    let mut out = String::from_utf8_lossy(stdout).trim().to_string();
    let err = String::from_utf8_lossy(stderr);
    let err = err.trim();
    if !err.is_empty() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(err);
    }
    out
}
