//! busprobe: round-robin verification of multi-drop RS-485 / Modbus RTU buses
//!
//! Every port on the bus takes the master role in turn while all other ports
//! run slave emulators. The master writes a known payload to every slave,
//! reads it back and the result of each transaction is reported, once, with
//! no retries, for every baud rate of the sweep.
//!
//! Modbus framing is delegated to external tools (`modpoll` as master,
//! `diagslave` as slave); this crate orchestrates them. The [`core`](crate::core) module
//! holds the test matrix, [`protocol`] the tool adapters.

#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
pub mod core;
pub mod protocol;
#[doc(hidden)]
pub mod utils;
