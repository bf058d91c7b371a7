//! Slave emulator lifecycle, backed by the external `diagslave` tool.
use async_trait::async_trait;
use std::{io, process::Stdio, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Child,
};

use crate::{
    core::{
        cleanup::SlaveRegistry,
        error::{SpawnError, StopError},
        types::{SlaveConfiguration, SlaveState},
    },
    protocol::arch::ToolCommand,
};

/// How many trailing stderr lines are kept for spawn diagnostics.
const STDERR_TAIL_LINES: usize = 20;

/// Spawns slave emulators bound to serial ports.
pub trait SlaveLauncher: Send + Sync {
    /// Start an emulator in the background. Returns as soon as the process is
    /// spawned; the emulator may still be opening its port.
    fn start(&self, config: &SlaveConfiguration) -> Result<Box<dyn SlaveProcess>, SpawnError>;
}

/// A running slave emulator, exclusively owned by the permutation that
/// spawned it.
#[async_trait]
pub trait SlaveProcess: Send {
    fn port(&self) -> &str;

    fn state(&self) -> SlaveState;

    /// Confirm the emulator survived start-up. Moves `Starting` to `Running`,
    /// or reports the early exit.
    fn confirm_running(&mut self) -> Result<(), SpawnError>;

    /// Terminate the emulator and wait up to `grace` for it to exit. The
    /// handle is `Terminated` afterwards even when an error is returned.
    async fn stop(&mut self, grace: Duration) -> Result<(), StopError>;
}

pub fn slave_args(config: &SlaveConfiguration) -> Vec<String> {
    vec![
        "-m".to_string(),
        config.mode.to_string(),
        "-a".to_string(),
        config.address.to_string(),
        "-b".to_string(),
        config.baud_rate.to_string(),
        "-p".to_string(),
        config.parity.to_string(),
        config.port.clone(),
    ]
}

/// [`SlaveLauncher`] running `diagslave`.
#[derive(Clone)]
pub struct DiagslaveLauncher {
    tool: ToolCommand,
    registry: SlaveRegistry,
}

impl DiagslaveLauncher {
    pub fn new(tool: ToolCommand, registry: SlaveRegistry) -> Self {
        Self { tool, registry }
    }
}

impl SlaveLauncher for DiagslaveLauncher {
    fn start(&self, config: &SlaveConfiguration) -> Result<Box<dyn SlaveProcess>, SpawnError> {
        let args = slave_args(config);
        log::info!(
            "Spawning slave emulator on {} (address {}, {} baud)",
            config.port,
            config.address,
            config.baud_rate
        );
        log::debug!("Running {} {}", self.tool.display(), args.join(" "));

        let mut child = self
            .tool
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SpawnError::Launch {
                port: config.port.clone(),
                message: format!("{}: {err}", self.tool.program.display()),
            })?;

        let pid = child.id();
        if let Some(pid) = pid {
            self.registry.track(pid, &config.port);
        }
        log::debug!("Slave emulator on {} has pid {:?}", config.port, pid);

        // Drain both streams so a chatty emulator never blocks on a full pipe.
        if let Some(stdout) = child.stdout.take() {
            let label = config.port.clone();
            tokio::spawn(drain_lines(stdout, move |line| {
                log::debug!("slave[{label}] stdout: {line}");
            }));
        }
        let (stderr_tx, stderr_rx) = flume::bounded(STDERR_TAIL_LINES);
        if let Some(stderr) = child.stderr.take() {
            let label = config.port.clone();
            let oldest = stderr_rx.clone();
            tokio::spawn(drain_lines(stderr, move |line| {
                log::debug!("slave[{label}] stderr: {line}");
                if let Err(flume::TrySendError::Full(line)) = stderr_tx.try_send(line) {
                    let _ = oldest.try_recv();
                    let _ = stderr_tx.try_send(line);
                }
            }));
        }

        Ok(Box::new(DiagslaveProcess {
            port: config.port.clone(),
            pid,
            child,
            state: SlaveState::Starting,
            stderr_tail: stderr_rx,
            registry: self.registry.clone(),
        }))
    }
}

async fn drain_lines<R, F>(stream: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim_end();
                if !trimmed.is_empty() {
                    on_line(trimmed.to_string());
                }
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!("Slave output reader error: {err}");
                break;
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        fn send_terminate(pid: u32) -> io::Result<()> {
            // SAFETY: kill(2) has no memory-safety preconditions.
            if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            // ESRCH: already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                Ok(())
            } else {
                Err(err)
            }
        }
    } else {
        fn send_terminate(_pid: u32) -> io::Result<()> {
            Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "graceful termination is unix-only",
            ))
        }
    }
}

pub struct DiagslaveProcess {
    port: String,
    pid: Option<u32>,
    child: Child,
    state: SlaveState,
    stderr_tail: flume::Receiver<String>,
    registry: SlaveRegistry,
}

impl DiagslaveProcess {
    fn stderr_tail(&self) -> String {
        self.stderr_tail.drain().collect::<Vec<_>>().join(" | ")
    }

    fn mark_terminated(&mut self) {
        self.state = SlaveState::Terminated;
        if let Some(pid) = self.pid.take() {
            self.registry.untrack(pid);
        }
    }

    /// Ask the emulator to exit on its own first.
    fn request_exit(&mut self) -> Result<(), StopError> {
        let Some(pid) = self.pid else {
            return self.force_exit();
        };
        match send_terminate(pid) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Unsupported => self.force_exit(),
            Err(err) => Err(StopError::Signal {
                port: self.port.clone(),
                message: err.to_string(),
            }),
        }
    }

    fn force_exit(&mut self) -> Result<(), StopError> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(err) if err.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(err) => Err(StopError::Signal {
                port: self.port.clone(),
                message: err.to_string(),
            }),
        }
    }

    async fn wait_exit(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("Slave emulator on {} exited with {status}", self.port);
                true
            }
            Ok(Err(err)) => {
                log::warn!("Waiting for slave emulator on {} failed: {err}", self.port);
                true
            }
            Err(_) => false,
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), StopError> {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        self.request_exit()?;
        if self.wait_exit(grace).await {
            return Ok(());
        }
        log::warn!(
            "Slave emulator on {} ignored termination, killing it",
            self.port
        );
        self.force_exit()?;
        if self.wait_exit(grace).await {
            Ok(())
        } else {
            Err(StopError::Timeout {
                port: self.port.clone(),
                grace,
            })
        }
    }
}

#[async_trait]
impl SlaveProcess for DiagslaveProcess {
    fn port(&self) -> &str {
        &self.port
    }

    fn state(&self) -> SlaveState {
        self.state
    }

    fn confirm_running(&mut self) -> Result<(), SpawnError> {
        match self.child.try_wait() {
            Ok(None) => {
                self.state = SlaveState::Running;
                Ok(())
            }
            Ok(Some(status)) => {
                self.mark_terminated();
                Err(SpawnError::EarlyExit {
                    port: self.port.clone(),
                    status: status.to_string(),
                    stderr: self.stderr_tail(),
                })
            }
            Err(err) => Err(SpawnError::Launch {
                port: self.port.clone(),
                message: format!("cannot poll emulator: {err}"),
            }),
        }
    }

    async fn stop(&mut self, grace: Duration) -> Result<(), StopError> {
        if self.state == SlaveState::Terminated {
            return Ok(());
        }
        log::info!("Stopping slave emulator on {}", self.port);

        let result = self.terminate(grace).await;
        self.mark_terminated();
        result
    }
}

impl Drop for DiagslaveProcess {
    fn drop(&mut self) {
        if self.state != SlaveState::Terminated {
            log::warn!(
                "Slave emulator on {} dropped without stop, killing it",
                self.port
            );
            let _ = self.child.start_kill();
            self.mark_terminated();
        }
    }
}
