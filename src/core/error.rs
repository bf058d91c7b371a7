use derive_more::{Display, Error};
use std::time::Duration;

use crate::core::types::PermutationReport;

/// A slave emulator could not be brought up on its port.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum SpawnError {
    #[display("failed to launch slave emulator on {port}: {message}")]
    Launch { port: String, message: String },
    #[display("slave emulator on {port} exited before the first request ({status}): {stderr}")]
    EarlyExit {
        port: String,
        status: String,
        stderr: String,
    },
}

impl SpawnError {
    pub fn port(&self) -> &str {
        match self {
            SpawnError::Launch { port, .. } | SpawnError::EarlyExit { port, .. } => port,
        }
    }
}

/// The master tool did not complete a transaction successfully.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum TransactionError {
    #[display("failed to launch master tool: {message}")]
    Launch { message: String },
    #[display("master tool exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[display("master tool did not exit within {elapsed:?}")]
    Timeout { elapsed: Duration },
}

/// A read either failed at the transaction level or returned data that does
/// not match what was written.
#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum ReadError {
    #[display("{_0}")]
    Transaction(TransactionError),
    #[display("Read values do not match expected values. Read: {actual:?}, Expected: {expected:?}")]
    Mismatch {
        actual: Vec<i64>,
        expected: Vec<i64>,
    },
    #[display("no register values found in master tool output: {output:?}")]
    NoValues { output: String },
}

impl From<TransactionError> for ReadError {
    fn from(err: TransactionError) -> Self {
        ReadError::Transaction(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Display, Error)]
pub enum StopError {
    #[display("slave emulator on {port} still running {grace:?} after kill")]
    Timeout { port: String, grace: Duration },
    #[display("failed to signal slave emulator on {port}: {message}")]
    Signal { port: String, message: String },
}

/// Errors that end a permutation early. Slave cleanup has always run by the
/// time one of these reaches the caller.
#[derive(Debug, Display, Error)]
pub enum HarnessError {
    /// `reports` holds every permutation recorded before the abort, the
    /// interrupted one last.
    #[display("run aborted by operator after {} recorded permutation(s)", reports.len())]
    Aborted { reports: Vec<PermutationReport> },
}
