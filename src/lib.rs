#![cfg_attr(not(feature = "std"), no_std)]

//! Core driver framework for PCIe-attached FPGA accelerator cards: FDT
//! topology discovery, a reference-counted subdevice pool, a
//! root/group/leaf composition fabric, an event dispatcher, and an
//! opt-in shared-memory ring transport.
//!
//! Concrete leaf behaviour (clock, ICAP, CMC, mailbox, flash, ...), PCIe
//! enumeration, bitstream parsing, and device-file/sysfs glue are all
//! out of scope: each is a client of this crate.

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod error;
pub mod events;
pub mod fabric;
pub mod metadata;
#[cfg(feature = "mock")]
pub mod mock;
pub mod pool;
pub mod prelude;
pub mod ring;
pub mod sync;

pub use error::{DeviceError, DeviceResult};
