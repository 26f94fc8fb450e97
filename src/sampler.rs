//! Locating the target's `lua_State` and sampling its call stack.
//!
//! The locator briefly hooks well-known Lua C API entry points with
//! breakpoints; the first hook to fire carries the `lua_State*` in `%rdi`,
//! the first-argument register of the System V x86_64 ABI. Once located,
//! the handle is reused for every sample: the target is paused, the remote
//! `CallInfo` chain is walked, and the target resumes.

use crate::access::MemoryAccessor;
use crate::debugger::{Debugger, ProcessStatus, Register};
use crate::error::{Error, Result};
use crate::lua::debug as lua_debug;
use libc::{SIGHUP, SIGINT, SIGTERM, SIGTRAP};
use log::{debug, error, info};
use std::sync::atomic::{AtomicI32, Ordering};

/// Classification of a sampled frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameKind {
    /// The frame could not be classified.
    Unknown,
    /// A C function registered with the Lua runtime.
    Native,
    /// A compiled Lua function.
    Lua,
}

/// One frame of a sampled Lua call stack.
#[derive(Debug, Clone)]
pub struct LuaStackFrame {
    /// What kind of function the frame runs.
    pub kind: FrameKind,
    /// Native entry point, for `Native` frames with a known address.
    pub address: u64,
    /// Short-form chunk origin.
    pub source: String,
    /// Symbolic name, possibly empty.
    pub name: String,
    /// Line the function is defined at; 0 when unknown.
    pub line: u32,
}

const GUARDED_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Ignores the cancellation signals while the target is paused, restoring
/// the previous dispositions on drop.
struct IgnoreSignals {
    previous: [libc::sighandler_t; 3],
}

impl IgnoreSignals {
    fn new() -> IgnoreSignals {
        let mut previous = [0; 3];
        for (slot, &signal) in previous.iter_mut().zip(&GUARDED_SIGNALS) {
            *slot = unsafe { libc::signal(signal, libc::SIG_IGN) };
        }
        IgnoreSignals { previous }
    }
}

impl Drop for IgnoreSignals {
    fn drop(&mut self) {
        for (&previous, &signal) in self.previous.iter().zip(&GUARDED_SIGNALS) {
            unsafe {
                libc::signal(signal, previous);
            }
        }
    }
}

static WATCHED_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn forward_to_target(_signum: libc::c_int) {
    // kill(2) is async-signal-safe
    let pid = WATCHED_PID.load(Ordering::Relaxed);
    if pid != 0 {
        unsafe {
            libc::kill(pid, SIGINT);
        }
    }
}

/// Reroutes the cancellation signals into a `SIGINT` delivered to the
/// target, which the locator's wait loop observes as cooperative
/// cancellation.
struct ForwardSignals {
    previous: [libc::sighandler_t; 3],
}

impl ForwardSignals {
    fn new(pid: u32) -> ForwardSignals {
        WATCHED_PID.store(pid as i32, Ordering::Relaxed);
        let mut previous = [0; 3];
        for (slot, &signal) in previous.iter_mut().zip(&GUARDED_SIGNALS) {
            let handler = forward_to_target as extern "C" fn(libc::c_int) as libc::sighandler_t;
            *slot = unsafe { libc::signal(signal, handler) };
        }
        ForwardSignals { previous }
    }
}

impl Drop for ForwardSignals {
    fn drop(&mut self) {
        for (&previous, &signal) in self.previous.iter().zip(&GUARDED_SIGNALS) {
            unsafe {
                libc::signal(signal, previous);
            }
        }
        WATCHED_PID.store(0, Ordering::Relaxed);
    }
}

/// Samples Lua call stacks out of a debugger's target.
pub struct LuaSampler<'a> {
    debugger: &'a mut Debugger,
}

impl<'a> LuaSampler<'a> {
    /// Creates a sampler over an attached debugger.
    pub fn new(debugger: &'a mut Debugger) -> LuaSampler<'a> {
        LuaSampler { debugger }
    }

    /// Runs `f` with the target paused, resuming it afterwards.
    ///
    /// Cancellation signals are ignored for the duration so the profiler
    /// cannot die while it holds the target stopped.
    fn with_paused_target<T>(&mut self, f: impl FnOnce(&mut Debugger) -> Result<T>) -> Result<T> {
        let _guard = IgnoreSignals::new();
        if self.debugger.status() == ProcessStatus::Running {
            self.debugger.interrupt()?;
        }
        let result = f(self.debugger);
        if self.debugger.status() == ProcessStatus::Paused {
            self.debugger.continue_safe();
        }
        result
    }

    /// Captures the address of the target's live `lua_State`.
    ///
    /// Breakpoints are installed on `lua_callk` and `lua_pcallk`
    /// (`lua_call` and `lua_pcall` are macros over these in Lua 5.3) plus
    /// any caller-supplied entry addresses; the first one to fire yields
    /// the state pointer. All hooks are removed again before returning,
    /// whatever the outcome.
    pub fn fetch_lua_state(&mut self, custom_entry_points: &[u64]) -> Result<u64> {
        let hooks = self.install_hooks(custom_entry_points)?;
        let result = self.wait_for_hook(&hooks);
        self.remove_hooks(&hooks);
        result
    }

    fn install_hooks(&mut self, custom_entry_points: &[u64]) -> Result<Vec<u64>> {
        self.with_paused_target(|debugger| {
            let mut hooks = Vec::new();

            for name in ["lua_callk", "lua_pcallk"] {
                info!("hook lua function {}", name);
                // the state argument must still be in %rdi at the trap, so
                // the prologue is not skipped
                match debugger.create_breakpoint_by_name(name, false) {
                    Ok(address) => match debugger.enable_breakpoint(address) {
                        Ok(()) => hooks.push(address),
                        Err(e) => {
                            error!("hook function {} failed: {}", name, e);
                            let _ = debugger.remove_breakpoint(address);
                        }
                    },
                    Err(e) => error!("hook function {} failed: {}", name, e),
                }
            }

            for &entry in custom_entry_points {
                info!("hook lua function {:#x}", entry);
                let address = debugger.create_breakpoint(entry.wrapping_add(debugger.address_offset()));
                match debugger.enable_breakpoint(address) {
                    Ok(()) => hooks.push(address),
                    Err(e) => {
                        error!("hook function {:#x} failed: {}", entry, e);
                        let _ = debugger.remove_breakpoint(address);
                    }
                }
            }

            Ok(hooks)
        })
    }

    fn wait_for_hook(&mut self, hooks: &[u64]) -> Result<u64> {
        if hooks.is_empty() {
            return Err(Error::NotSupported("no hook could be inserted".to_string()));
        }

        let _watch = ForwardSignals::new(self.debugger.pid());
        while self.debugger.wait()? {
            match self.debugger.last_signal() {
                SIGINT => {
                    error!("debugger interrupted by SIGINT, cancelling");
                    return Err(Error::Cancelled("user cancelled".to_string()));
                }
                SIGTRAP => {
                    if let Some(address) = self.debugger.hit_breakpoint()? {
                        if hooks.contains(&address) {
                            let state = self.debugger.get_register(Register::Rdi)?;
                            self.debugger.continue_execution()?;
                            return Ok(state);
                        }
                    }
                    self.debugger.continue_execution()?;
                }
                signal => {
                    return Err(Error::NotSupported(format!(
                        "unexpected signal {} during locate",
                        signal
                    )));
                }
            }
        }
        Err(Error::InvalidCall("target terminated".to_string()))
    }

    fn remove_hooks(&mut self, hooks: &[u64]) {
        if self.debugger.status() == ProcessStatus::Terminated {
            return;
        }

        debug!("clearing {} hooks", hooks.len());
        let result = self.with_paused_target(|debugger| {
            for &address in hooks {
                if let Err(e) = debugger.remove_breakpoint(address) {
                    error!("cannot clear hook at {:#x}: {}", address, e);
                }
            }
            Ok(())
        });
        if let Err(e) = result {
            error!("cannot clear hooks: {}", e);
        }
    }

    /// Snapshots the Lua call stack of the thread at `state_address`,
    /// innermost frame first.
    ///
    /// The dump happens entirely within one pause of the target, so the
    /// `CallInfo` chain cannot change underneath the walk.
    pub fn dump_stack(&mut self, state_address: u64) -> Result<Vec<LuaStackFrame>> {
        self.with_paused_target(|debugger| {
            let accessor = MemoryAccessor::new(debugger);
            let frames = lua_debug::dump_stack(&accessor, state_address)?;
            Ok(frames
                .iter()
                .map(|ar| convert_frame(debugger, ar))
                .collect())
        })
    }
}

fn convert_frame(debugger: &Debugger, ar: &lua_debug::LuaDebug) -> LuaStackFrame {
    let mut frame = LuaStackFrame {
        kind: FrameKind::Unknown,
        address: ar.address,
        source: ar.short_src.clone(),
        name: ar.name.clone(),
        line: if ar.linedefined == -1 {
            0
        } else {
            ar.linedefined as u32
        },
    };

    if ar.what == "C" {
        frame.kind = FrameKind::Native;
        if frame.address != 0 {
            // the walker has no name for native frames; DWARF does
            frame.name = debugger.function_name(frame.address);
        }
    } else {
        frame.kind = FrameKind::Lua;
    }
    frame
}

/// Renders one frame of the folded-stack output.
pub fn format_frame(frame: &LuaStackFrame) -> String {
    match frame.kind {
        FrameKind::Native => {
            if frame.name.is_empty() {
                format!("[0x{:016x}]", frame.address)
            } else {
                format!("[{}]", frame.name)
            }
        }
        FrameKind::Lua => format!(
            "{} @ {}:{}",
            if frame.name.is_empty() { "?" } else { &frame.name },
            frame.source,
            frame.line
        ),
        FrameKind::Unknown => "?".to_string(),
    }
}

/// Folds a dumped stack into one semicolon-separated line, outermost frame
/// first.
pub fn format_stack(frames: &[LuaStackFrame]) -> String {
    let mut out = String::with_capacity(1024);
    out.push_str("(base);");
    for frame in frames.iter().rev() {
        out.push_str(&format_frame(frame));
        out.push(';');
    }
    out
}
