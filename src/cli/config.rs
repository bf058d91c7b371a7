use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    core::{
        matrix::BaudSweep,
        rotation::RotationSettings,
        types::{Parity, ProtocolMode, RegisterSet},
    },
    protocol::arch::{ToolCommand, ToolPaths},
};

/// Largest register count a single FC16 write may carry.
pub const MAX_REGISTER_COUNT: u16 = 123;

/// Highest assignable slave address.
const MAX_SLAVE_ADDRESS: usize = 247;

/// Root configuration of a harness run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Serial ports on the bus, in the order slave addresses are assigned
    pub ports: Vec<String>,
    /// Baud rates to sweep; run lowest first
    pub baud_rates: Vec<u32>,
    pub start_register: u16,
    pub count: u16,
    /// Explicit payload; `1..=count` when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<i64>>,
    /// Master tool response timeout in milliseconds
    pub timeout_ms: u64,
    pub parity: Parity,
    pub mode: ProtocolMode,
    /// Delay after spawning slaves before the first request, in milliseconds
    pub settle_ms: u64,
    /// Bounded wait for a stopped slave to exit, in milliseconds
    pub stop_timeout_ms: u64,
    /// Directory containing `modpoll/<arch>/modpoll` and `diagslave/<arch>/diagslave`
    pub tool_dir: PathBuf,
    /// Machine name override for tool resolution (`uname -m` when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_tool: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_tool: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            ports: (0..4).map(|i| format!("/dev/ttyUSB{i}")).collect(),
            baud_rates: vec![9600, 19200, 38400, 57600, 115200, 230400, 460800],
            start_register: 500,
            count: 10,
            payload: None,
            timeout_ms: 10_000,
            parity: Parity::None,
            mode: ProtocolMode::Rtu,
            settle_ms: 1000,
            stop_timeout_ms: 2000,
            tool_dir: PathBuf::from("."),
            machine: None,
            master_tool: None,
            slave_tool: None,
        }
    }
}

impl HarnessConfig {
    /// Parse configuration from a JSON string
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Read configuration from a `.json` or `.toml` file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let parsed = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&content).map_err(anyhow::Error::from),
            Some("json") | None => Self::from_json(&content).map_err(anyhow::Error::from),
            Some(other) => Err(anyhow!("unsupported config format '.{other}'")),
        };
        parsed.with_context(|| format!("parsing config {}", path.display()))
    }

    /// Convert to a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ports.len() < 2 {
            bail!("at least two ports are needed, got {}", self.ports.len());
        }
        if self.ports.len() - 1 > MAX_SLAVE_ADDRESS {
            bail!(
                "{} ports exceed the {MAX_SLAVE_ADDRESS} assignable slave addresses",
                self.ports.len()
            );
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.ports.iter().find(|p| !seen.insert(p.as_str())) {
            bail!("port {dup} is listed more than once");
        }
        if self.baud_rates.is_empty() {
            bail!("no baud rates configured");
        }
        if self.baud_rates.contains(&0) {
            bail!("baud rate 0 is not valid");
        }
        if self.count == 0 || self.count > MAX_REGISTER_COUNT {
            bail!(
                "register count must be within 1..={MAX_REGISTER_COUNT}, got {}",
                self.count
            );
        }
        if u32::from(self.start_register) + u32::from(self.count) > 65536 {
            bail!(
                "register range {}+{} runs past the end of the address space",
                self.start_register,
                self.count
            );
        }
        if let Some(payload) = &self.payload {
            if payload.len() != usize::from(self.count) {
                bail!(
                    "payload has {} values but count is {}",
                    payload.len(),
                    self.count
                );
            }
        }
        if self.timeout_ms == 0 {
            bail!("operation timeout must be non-zero");
        }
        Ok(())
    }

    pub fn payload(&self) -> RegisterSet {
        match &self.payload {
            Some(values) => RegisterSet::new(self.start_register, values.clone()),
            None => RegisterSet::canonical(self.start_register, self.count),
        }
    }

    pub fn rotation_settings(&self) -> RotationSettings {
        RotationSettings {
            parity: self.parity,
            mode: self.mode,
            payload: self.payload(),
            timeout: Duration::from_millis(self.timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
            stop_grace: Duration::from_millis(self.stop_timeout_ms),
        }
    }

    pub fn baud_sweep(&self) -> BaudSweep {
        let sweep = BaudSweep::new(self.baud_rates.iter().copied());
        if sweep.rates() != self.baud_rates.as_slice() {
            log::info!(
                "Baud rates reordered to ascending sweep: {:?}",
                sweep.rates()
            );
        }
        sweep
    }

    pub fn tool_paths(&self) -> ToolPaths {
        let mut paths = match &self.machine {
            Some(machine) => ToolPaths::for_machine(&self.tool_dir, machine),
            None => ToolPaths::for_host(&self.tool_dir),
        };
        if let Some(master) = &self.master_tool {
            paths.master = ToolCommand::new(master);
        }
        if let Some(slave) = &self.slave_tool {
            paths.slave = ToolCommand::new(slave);
        }
        paths
    }
}
