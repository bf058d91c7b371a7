//! Operator-facing console output.
//!
//! Report lines go to stdout so they stay readable when log records are sent
//! to a file; the same events are also logged with full context.
use std::io::Write;

use crate::core::{
    error::SpawnError,
    matrix::RunSummary,
    rotation::Permutation,
    types::{OperationKind, OperationResult},
};

/// Observer of rotation progress. Every hook defaults to a no-op.
pub trait Reporter: Send + Sync {
    fn permutation_started(&self, _permutation: &Permutation, _baud_rate: u32) {}

    fn phase_started(&self, _kind: OperationKind) {}

    fn spawn_failed(&self, _error: &SpawnError) {}

    fn operation_finished(&self, _result: &OperationResult) {}

    fn run_finished(&self, _summary: &RunSummary) {}
}

/// Plain-text reporter printing one line per operation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    fn emit(&self, line: std::fmt::Arguments<'_>) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
        let _ = out.flush();
    }
}

impl Reporter for ConsoleReporter {
    fn permutation_started(&self, permutation: &Permutation, baud_rate: u32) {
        let slaves: Vec<&str> = permutation
            .slaves
            .iter()
            .map(|s| s.port.as_str())
            .collect();
        self.emit(format_args!(
            "Test {}: Master = {}, Slaves = {:?}, Baud rate = {}",
            permutation.index + 1,
            permutation.master_port,
            slaves,
            baud_rate
        ));
    }

    fn phase_started(&self, kind: OperationKind) {
        match kind {
            OperationKind::Write => self.emit(format_args!("\tTesting write of values")),
            OperationKind::Read => self.emit(format_args!("\tTesting read of values")),
        }
    }

    fn spawn_failed(&self, error: &SpawnError) {
        self.emit(format_args!("\tSlave start failed: {error}"));
    }

    fn operation_finished(&self, result: &OperationResult) {
        if let Some(diagnostic) = &result.diagnostic {
            match result.kind {
                OperationKind::Write => {
                    self.emit(format_args!("\tModbus write failed: {diagnostic}"))
                }
                OperationKind::Read => self.emit(format_args!("\t{diagnostic}")),
            }
        }
        match (result.kind, result.success) {
            (OperationKind::Write, true) => {
                self.emit(format_args!("\tWrite operation successful {}", result.port))
            }
            (OperationKind::Write, false) => {
                self.emit(format_args!("\tWrite operation failed {}", result.port))
            }
            (OperationKind::Read, true) => self.emit(format_args!(
                "\tRead operation successful and values verified {}",
                result.port
            )),
            (OperationKind::Read, false) => self.emit(format_args!(
                "\tRead operation failed or values do not match {}",
                result.port
            )),
        }
    }

    fn run_finished(&self, summary: &RunSummary) {
        self.emit(format_args!("{summary}"));
    }
}
