//! Lua stack sampling for remote processes.
//!
//! `lstack` captures the Lua 5.3 call stacks of a foreign process without
//! any cooperation from the target: it attaches with ptrace, finds the
//! live `lua_State*` by briefly hooking the Lua C API entry points, and
//! then periodically pauses the target and reconstructs the interpreter's
//! `CallInfo` chain from remote memory. It currently only supports Linux
//! on x86_64, and requires that the `/proc` pseudo-filesystem be mounted
//! and accessible.
//!
//! # Examples
//!
//! ```no_run
//! use lstack::{Debugger, LuaSampler};
//!
//! let mut debugger = Debugger::attach(4321, false).unwrap();
//! let mut sampler = LuaSampler::new(&mut debugger);
//!
//! let state = sampler.fetch_lua_state(&[]).unwrap();
//! for frame in sampler.dump_stack(state).unwrap() {
//!     println!("{}", lstack::format_frame(&frame));
//! }
//! ```
#![warn(missing_docs)]

pub mod access;
pub mod debugger;
mod error;
#[allow(missing_docs)]
pub mod lua;
pub mod sampler;
pub mod symbols;

pub use crate::debugger::{Breakpoint, Debugger, ProcessStatus, Register};
pub use crate::error::{Error, Result};
pub use crate::sampler::{format_frame, format_stack, FrameKind, LuaSampler, LuaStackFrame};
