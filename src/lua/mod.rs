//! The remote view of the Lua 5.3 runtime.

pub mod debug;
pub mod objects;
pub mod opcodes;
