//! Protocol module for the roaster's text protocol.
//!
//! This module contains the implementations for:
//! - State frame decoding (peripheral to bridge)
//! - Command encoding (bridge to peripheral)

pub mod commands;
pub mod frame;

pub use commands::{encode, Command, CommandKind, CommandSpec, ValueKind, COMMAND_TABLE};
pub use frame::{decode, DecodeError, FrameReading};
