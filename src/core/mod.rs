//! Test-matrix core of the harness.
//!
//! This module contains the UI-independent logic:
//! - Data model shared by every layer
//! - Role rotation across ports at one baud rate
//! - The baud-rate sweep and end-of-run tally
//! - Console reporting
//! - Abort signalling and the live-slave registry
pub mod cleanup;
pub mod error;
pub mod matrix;
pub mod report;
pub mod rotation;
pub mod types;

pub use cleanup::{AbortSignal, SlaveRegistry};
pub use error::{HarnessError, ReadError, SpawnError, StopError, TransactionError};
pub use matrix::{BaudSweep, MatrixDriver, MatrixOutcome, RunSummary, Tally};
pub use report::{ConsoleReporter, Reporter};
pub use rotation::{plan_permutations, Permutation, RotationEngine, RotationSettings};
pub use types::*;
