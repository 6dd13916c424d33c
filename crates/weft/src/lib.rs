#![doc = include_str!("../README.md")]

pub mod error;
pub mod flow;
pub mod iface;
pub mod lane;
pub mod pending;
pub mod sysv;
pub mod tcp;

pub use error::Error;
