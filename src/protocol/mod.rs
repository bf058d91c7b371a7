//! Adapters for the external Modbus tools: `modpoll` acts as master,
//! `diagslave` emulates slaves. Framing and CRC are entirely theirs.
pub mod arch;
pub mod diagslave;
pub mod modpoll;
pub mod parse;

pub use arch::{arch_suffix, machine_name, ToolCommand, ToolPaths};
pub use diagslave::{DiagslaveLauncher, SlaveLauncher, SlaveProcess};
pub use modpoll::{MasterTarget, ModbusMaster, ModpollClient, ReadRequest, WriteRequest};
pub use parse::{extract_register_values, verify};
