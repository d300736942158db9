#![forbid(unsafe_code)]

//! Types, configuration and errors shared by the 802.11n MAC crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::{Dot11nConfig, EdcaParams, EdcaTable};
pub use error::{Dot11nError, Dot11nResult};
pub use types::{AccessCategory, MacAddr, SimTime, Tid};
