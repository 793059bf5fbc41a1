#![doc = include_str!("../README.md")]
#![deny(missing_docs)]

#[cfg_attr(target_arch = "x86_64", path = "arch/x86_64.rs")]
mod arch;
mod config;
mod init;
mod logger;
mod monitor;
mod registry;
mod shim;
mod stack;
mod time;

pub mod event;
pub mod layout;
pub mod tag;

pub use init::{init, reset, shutdown};
