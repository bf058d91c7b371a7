//! Master-side transactions, issued through the external `modpoll` tool.
use async_trait::async_trait;
use std::{
    process::{ExitStatus, Stdio},
    time::Duration,
};

use crate::{
    core::{
        error::{ReadError, TransactionError},
        types::{Parity, ProtocolMode, RegisterSet},
    },
    protocol::{arch::ToolCommand, parse::extract_register_values},
};

/// Extra time granted on top of the tool's own response timeout before the
/// tool process is killed.
const TOOL_EXIT_MARGIN: Duration = Duration::from_secs(5);

/// Serial line parameters and the addressed slave of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterTarget {
    /// Port the master tool opens.
    pub port: String,
    pub baud_rate: u32,
    pub timeout: Duration,
    pub parity: Parity,
    pub mode: ProtocolMode,
    pub address: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub target: MasterTarget,
    pub registers: RegisterSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub target: MasterTarget,
    pub start: u16,
    pub count: u16,
}

/// One write or one read against one slave address. Implementations must not
/// retry: a failure is reported exactly once.
#[async_trait]
pub trait ModbusMaster: Send + Sync {
    async fn write(&self, request: &WriteRequest) -> Result<(), TransactionError>;

    /// Returns the register values in the order the tool printed them.
    async fn read(&self, request: &ReadRequest) -> Result<Vec<i64>, ReadError>;
}

fn common_args(target: &MasterTarget, start: u16, count: u16) -> Vec<String> {
    vec![
        "-b".to_string(),
        target.baud_rate.to_string(),
        "-o".to_string(),
        target.timeout.as_secs_f64().to_string(),
        "-p".to_string(),
        target.parity.to_string(),
        "-m".to_string(),
        target.mode.to_string(),
        "-a".to_string(),
        target.address.to_string(),
        "-r".to_string(),
        start.to_string(),
        "-c".to_string(),
        count.to_string(),
    ]
}

pub fn write_args(request: &WriteRequest) -> Vec<String> {
    let registers = &request.registers;
    let mut args = common_args(&request.target, registers.start, registers.count());
    args.push(request.target.port.clone());
    args.extend(registers.values.iter().map(i64::to_string));
    args
}

pub fn read_args(request: &ReadRequest) -> Vec<String> {
    let mut args = common_args(&request.target, request.start, request.count);
    // Poll once and exit.
    args.push("-1".to_string());
    args.push(request.target.port.clone());
    args
}

/// [`ModbusMaster`] backed by the `modpoll` command line tool.
#[derive(Debug, Clone)]
pub struct ModpollClient {
    tool: ToolCommand,
}

struct ToolOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

impl ModpollClient {
    pub fn new(tool: ToolCommand) -> Self {
        Self { tool }
    }

    async fn invoke(
        &self,
        args: Vec<String>,
        capture_stdout: bool,
        timeout: Duration,
    ) -> Result<ToolOutput, TransactionError> {
        log::debug!("Running {} {}", self.tool.display(), args.join(" "));

        let mut cmd = self.tool.command(args);
        cmd.stdin(Stdio::null())
            .stdout(if capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|err| TransactionError::Launch {
            message: format!("{}: {err}", self.tool.program.display()),
        })?;

        let limit = timeout + TOOL_EXIT_MARGIN;
        let output = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| TransactionError::Timeout { elapsed: limit })?
            .map_err(|err| TransactionError::Launch {
                message: format!("waiting for {}: {err}", self.tool.program.display()),
            })?;

        Ok(ToolOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
        })
    }
}

#[async_trait]
impl ModbusMaster for ModpollClient {
    async fn write(&self, request: &WriteRequest) -> Result<(), TransactionError> {
        let output = self
            .invoke(write_args(request), false, request.target.timeout)
            .await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TransactionError::Failed {
                status: output.status.to_string(),
                stderr: output.stderr,
            })
        }
    }

    async fn read(&self, request: &ReadRequest) -> Result<Vec<i64>, ReadError> {
        let output = self
            .invoke(read_args(request), true, request.target.timeout)
            .await?;
        if !output.status.success() {
            return Err(TransactionError::Failed {
                status: output.status.to_string(),
                stderr: output.stderr,
            }
            .into());
        }

        let values = extract_register_values(&output.stdout);
        if values.is_empty() && !output.stdout.trim().is_empty() {
            return Err(ReadError::NoValues {
                output: output.stdout,
            });
        }
        Ok(values)
    }
}
