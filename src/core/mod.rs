//! Core types and constants shared by the GPS, protocol and navigation layers

pub mod types;
pub mod constants;

pub use types::*;
pub use constants::*;
