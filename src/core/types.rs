use serde::{Deserialize, Serialize};
use std::fmt;

/// Serial parity passed to both the master tool and the slave emulator.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Modbus serial framing mode.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ProtocolMode {
    #[default]
    Rtu,
    Ascii,
}

/// Parameters of one slave emulator. Built per permutation and never mutated
/// after the emulator is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveConfiguration {
    pub port: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub mode: ProtocolMode,
    pub address: u8,
}

/// A contiguous range of holding registers together with the values held in
/// it. The register count is always `values.len()`, so a write and the read
/// that verifies it can never disagree on the count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    pub start: u16,
    pub values: Vec<i64>,
}

impl RegisterSet {
    pub fn new(start: u16, values: Vec<i64>) -> Self {
        Self { start, values }
    }

    /// The canonical test payload: `1..=count` starting at `start`.
    pub fn canonical(start: u16, count: u16) -> Self {
        Self {
            start,
            values: (1..=i64::from(count)).collect(),
        }
    }

    pub fn count(&self) -> u16 {
        self.values.len() as u16
    }
}

/// Lifecycle of a spawned slave emulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SlaveState {
    Starting,
    Running,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Write,
    Read,
}

/// Outcome of a single master transaction against one addressed slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationResult {
    pub kind: OperationKind,
    pub address: u8,
    /// Port the addressed slave emulator is bound to.
    pub port: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl OperationResult {
    pub fn passed(kind: OperationKind, slave: &SlaveAssignment) -> Self {
        Self {
            kind,
            address: slave.address,
            port: slave.port.clone(),
            success: true,
            diagnostic: None,
        }
    }

    pub fn failed(kind: OperationKind, slave: &SlaveAssignment, diagnostic: String) -> Self {
        Self {
            kind,
            address: slave.address,
            port: slave.port.clone(),
            success: false,
            diagnostic: Some(diagnostic),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveAssignment {
    pub port: String,
    pub address: u8,
}

impl fmt::Display for SlaveAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.address, self.port)
    }
}

/// Everything observed while one port held the master role at one baud rate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermutationReport {
    pub master_port: String,
    pub slaves: Vec<SlaveAssignment>,
    pub baud_rate: u32,
    pub results: Vec<OperationResult>,
    /// Diagnostics for slaves that failed to start or died before the
    /// first master operation.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub spawn_failures: Vec<String>,
}

impl PermutationReport {
    pub fn new(master_port: String, slaves: Vec<SlaveAssignment>, baud_rate: u32) -> Self {
        Self {
            master_port,
            slaves,
            baud_rate,
            results: Vec::new(),
            spawn_failures: Vec::new(),
        }
    }

    pub fn results_of(&self, kind: OperationKind) -> impl Iterator<Item = &OperationResult> {
        self.results.iter().filter(move |r| r.kind == kind)
    }

    pub fn all_passed(&self) -> bool {
        self.spawn_failures.is_empty() && self.results.iter().all(|r| r.success)
    }
}
