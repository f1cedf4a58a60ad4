// src/protocol/mod.rs

pub mod codec;
pub mod types;

pub use codec::{decode_command, CommandReader, DecodeError, EventWriter};
pub use types::*;
