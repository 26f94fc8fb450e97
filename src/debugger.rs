//! Process control over ptrace.
//!
//! A `Debugger` owns the attachment to one traced process: it pauses and
//! resumes the target, reads and writes its registers and memory, and
//! manages software breakpoints. All register and memory operations are
//! only legal while the target is paused.

use crate::error::{Error, Result};
use crate::symbols::{self, Symbolizer};
use goblin::elf::{header, Elf};
use libc::{c_void, pid_t};
use log::{trace, warn};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::ptr;

/// The width of a machine word on the target, in bytes.
pub const WORD_SIZE: usize = mem::size_of::<u64>();

const INT3: u8 = 0xcc;

/// The execution state of a traced process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    /// The process has exited or was killed.
    Terminated,
    /// The process is executing.
    Running,
    /// The process is stopped and can be inspected.
    Paused,
}

/// A general purpose or segment register of the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

/// A software breakpoint installed in the target.
///
/// Enabling replaces the instruction byte at the breakpoint address with an
/// INT3 trap and records the displaced byte so it can be restored.
#[derive(Debug, Copy, Clone)]
pub struct Breakpoint {
    address: u64,
    enabled: bool,
    original_byte: u8,
}

impl Breakpoint {
    /// Returns the address the breakpoint patches.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Determines if the breakpoint is currently installed.
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// A debugger attached to a single process.
///
/// Dropping the debugger restores the target: it is paused if necessary,
/// all breakpoints are removed, and the process is resumed and detached.
pub struct Debugger {
    pid: pid_t,
    status: ProcessStatus,
    last_signal: i32,
    exit_code: i32,
    breakpoints: HashMap<u64, Breakpoint>,
    symbols: Symbolizer,
    load_offset: u64,
}

impl Debugger {
    /// Attaches to a running process.
    ///
    /// The target's executable is loaded for symbolization and the runtime
    /// load offset is computed for position independent images. The attach
    /// is seize-style, so the target keeps running; with `interrupt` the
    /// debugger additionally stops the target and waits for the stop to be
    /// reported before returning.
    pub fn attach(pid: u32, interrupt: bool) -> Result<Debugger> {
        let path = format!("/proc/{}/exe", pid);
        let mut file = File::open(&path)
            .map_err(|e| Error::Api { context: format!("open executable {}", path), source: e })?;
        let mut image = Vec::new();
        file.read_to_end(&mut image)
            .map_err(|e| Error::Api { context: format!("read executable {}", path), source: e })?;
        drop(file);

        let elf = Elf::parse(&image)?;
        let symbols = Symbolizer::new(&elf, &image);
        let load_offset = if elf.header.e_type == header::ET_DYN {
            symbols::base_address(pid)?
        } else {
            0
        };

        let pid = pid as pid_t;
        if unsafe {
            libc::ptrace(
                libc::PTRACE_SEIZE,
                pid,
                ptr::null_mut::<c_void>(),
                ptr::null_mut::<c_void>(),
            )
        } != 0
        {
            return Err(Error::last_os_error(format!("attach to process {}", pid)));
        }

        let mut debugger = Debugger {
            pid,
            status: ProcessStatus::Running,
            last_signal: 0,
            exit_code: 0,
            breakpoints: HashMap::new(),
            symbols,
            load_offset,
        };

        if interrupt {
            if unsafe {
                libc::ptrace(
                    libc::PTRACE_INTERRUPT,
                    pid,
                    ptr::null_mut::<c_void>(),
                    ptr::null_mut::<c_void>(),
                )
            } != 0
            {
                return Err(Error::last_os_error(format!("interrupt process {}", pid)));
            }

            let mut status = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::__WALL) };
            if ret != pid || !libc::WIFSTOPPED(status) {
                return Err(Error::last_os_error(format!(
                    "attach and wait on process {}",
                    pid
                )));
            }

            debugger.status = ProcessStatus::Paused;
            debugger.last_signal = libc::WSTOPSIG(status);
        }

        Ok(debugger)
    }

    /// Returns the id of the traced process.
    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Returns the target's execution state.
    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    /// Returns the signal observed by the last `wait`.
    pub fn last_signal(&self) -> i32 {
        self.last_signal
    }

    /// Returns the target's exit code, once it has terminated.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Returns the runtime load offset of the executable image.
    ///
    /// Zero for non-PIE images.
    pub fn address_offset(&self) -> u64 {
        self.load_offset
    }

    /// Blocks until the target stops or terminates.
    ///
    /// `SIGCHLD` stops are consumed transparently: the target is resumed
    /// and the wait continues. Returns `true` while the process is alive,
    /// and `false` exactly once when it terminates.
    pub fn wait(&mut self) -> Result<bool> {
        if self.status == ProcessStatus::Terminated {
            return Err(Error::InvalidCall(format!(
                "process {} already terminated",
                self.pid
            )));
        }

        loop {
            let mut status = 0;
            let ret = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    trace!("waitpid received EINTR on process {}", self.pid);
                    continue;
                }
                return Err(Error::Api {
                    context: format!("wait on process {}", self.pid),
                    source: err,
                });
            }

            if libc::WIFSTOPPED(status) {
                self.status = ProcessStatus::Paused;
                self.last_signal = libc::WSTOPSIG(status);
                trace!(
                    "process {} stopped on signal {}",
                    self.pid,
                    self.last_signal
                );

                if self.last_signal == libc::SIGCHLD {
                    self.continue_execution()?;
                    continue;
                }
                return Ok(true);
            } else if libc::WIFEXITED(status) {
                self.status = ProcessStatus::Terminated;
                self.exit_code = libc::WEXITSTATUS(status);
                trace!("process {} terminated", self.pid);
                return Ok(false);
            } else if libc::WIFSIGNALED(status) {
                self.status = ProcessStatus::Terminated;
                self.last_signal = libc::WTERMSIG(status);
                trace!(
                    "process {} killed by signal {}",
                    self.pid,
                    self.last_signal
                );
                return Ok(false);
            } else {
                return Err(Error::Api {
                    context: format!(
                        "wait on process {} got unexpected status {:#x}",
                        self.pid, status
                    ),
                    source: io::Error::last_os_error(),
                });
            }
        }
    }

    /// Stops the target and waits for the stop to be observed.
    pub fn interrupt(&mut self) -> Result<()> {
        if unsafe {
            libc::ptrace(
                libc::PTRACE_INTERRUPT,
                self.pid,
                ptr::null_mut::<c_void>(),
                ptr::null_mut::<c_void>(),
            )
        } != 0
        {
            return Err(Error::last_os_error(format!(
                "interrupt process {}",
                self.pid
            )));
        }
        if !self.wait()? {
            return Err(Error::InvalidCall(format!(
                "process {} terminated on interrupt",
                self.pid
            )));
        }
        Ok(())
    }

    /// Like [`interrupt`](Self::interrupt), but failures are logged instead
    /// of propagated. For cleanup paths.
    pub fn interrupt_safe(&mut self) {
        if let Err(e) = self.interrupt() {
            warn!("cannot interrupt process {}: {}", self.pid, e);
        }
    }

    /// Resumes the target.
    ///
    /// If the target is stopped at one of our breakpoints, the original
    /// instruction is executed first via a single step before the trap byte
    /// is reinstalled.
    pub fn continue_execution(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Paused {
            return Err(Error::InvalidCall(format!(
                "invalid call on process {}",
                self.pid
            )));
        }

        if self.last_signal == libc::SIGTRAP {
            self.step_over_breakpoint()?;
        }

        if unsafe {
            libc::ptrace(
                libc::PTRACE_CONT,
                self.pid,
                ptr::null_mut::<c_void>(),
                ptr::null_mut::<c_void>(),
            )
        } != 0
        {
            return Err(Error::last_os_error(format!(
                "continue process {}",
                self.pid
            )));
        }
        self.status = ProcessStatus::Running;
        self.last_signal = 0;
        Ok(())
    }

    /// Like [`continue_execution`](Self::continue_execution), but failures
    /// are logged instead of propagated. For cleanup paths.
    pub fn continue_safe(&mut self) {
        if let Err(e) = self.continue_execution() {
            warn!("cannot continue process {}: {}", self.pid, e);
        }
    }

    /// Executes one instruction of the target.
    pub fn single_step(&mut self) -> Result<()> {
        if self.status != ProcessStatus::Paused {
            return Err(Error::InvalidCall(format!(
                "invalid call on process {}",
                self.pid
            )));
        }

        if self.last_signal == libc::SIGTRAP && self.step_over_breakpoint()? {
            return Ok(());
        }
        self.raw_single_step()
    }

    fn raw_single_step(&mut self) -> Result<()> {
        if unsafe {
            libc::ptrace(
                libc::PTRACE_SINGLESTEP,
                self.pid,
                ptr::null_mut::<c_void>(),
                ptr::null_mut::<c_void>(),
            )
        } != 0
        {
            return Err(Error::last_os_error(format!(
                "single step process {}",
                self.pid
            )));
        }
        self.wait()?;
        Ok(())
    }

    /// If the PC sits one byte past an enabled breakpoint, rewinds it,
    /// executes the displaced instruction and reinstalls the trap.
    ///
    /// Returns whether such a step was performed. The target makes exactly
    /// one instruction of progress when it was.
    fn step_over_breakpoint(&mut self) -> Result<bool> {
        let location = self.pc()?.wrapping_sub(1);
        match self.breakpoints.get(&location) {
            Some(bp) if bp.enabled => {}
            _ => return Ok(false),
        }

        self.set_pc(location)?;
        self.disable_breakpoint(location)?;
        self.raw_single_step()?;
        self.enable_breakpoint(location)?;
        Ok(true)
    }

    fn registers(&self) -> Result<libc::user_regs_struct> {
        if self.status != ProcessStatus::Paused {
            return Err(Error::InvalidCall(format!(
                "invalid call on process {}",
                self.pid
            )));
        }

        let mut regs: libc::user_regs_struct = unsafe { mem::zeroed() };
        if unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGS,
                self.pid,
                ptr::null_mut::<c_void>(),
                &mut regs as *mut libc::user_regs_struct as *mut c_void,
            )
        } != 0
        {
            return Err(Error::last_os_error(format!(
                "get registers of process {}",
                self.pid
            )));
        }
        Ok(regs)
    }

    /// Reads one register of the stopped target.
    pub fn get_register(&self, reg: Register) -> Result<u64> {
        let regs = self.registers()?;
        let val = match reg {
            Register::Rax => regs.rax,
            Register::Rbx => regs.rbx,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rdi => regs.rdi,
            Register::Rsi => regs.rsi,
            Register::Rbp => regs.rbp,
            Register::Rsp => regs.rsp,
            Register::R8 => regs.r8,
            Register::R9 => regs.r9,
            Register::R10 => regs.r10,
            Register::R11 => regs.r11,
            Register::R12 => regs.r12,
            Register::R13 => regs.r13,
            Register::R14 => regs.r14,
            Register::R15 => regs.r15,
            Register::Rip => regs.rip,
            Register::Eflags => regs.eflags,
            Register::Cs => regs.cs,
            Register::OrigRax => regs.orig_rax,
            Register::FsBase => regs.fs_base,
            Register::GsBase => regs.gs_base,
            Register::Fs => regs.fs,
            Register::Gs => regs.gs,
            Register::Ss => regs.ss,
            Register::Ds => regs.ds,
            Register::Es => regs.es,
        };
        Ok(val)
    }

    /// Writes one register of the stopped target.
    ///
    /// The full register bank is read, the field mutated, and the bank
    /// written back.
    pub fn set_register(&self, reg: Register, val: u64) -> Result<()> {
        let mut regs = self.registers()?;
        match reg {
            Register::Rax => regs.rax = val,
            Register::Rbx => regs.rbx = val,
            Register::Rcx => regs.rcx = val,
            Register::Rdx => regs.rdx = val,
            Register::Rdi => regs.rdi = val,
            Register::Rsi => regs.rsi = val,
            Register::Rbp => regs.rbp = val,
            Register::Rsp => regs.rsp = val,
            Register::R8 => regs.r8 = val,
            Register::R9 => regs.r9 = val,
            Register::R10 => regs.r10 = val,
            Register::R11 => regs.r11 = val,
            Register::R12 => regs.r12 = val,
            Register::R13 => regs.r13 = val,
            Register::R14 => regs.r14 = val,
            Register::R15 => regs.r15 = val,
            Register::Rip => regs.rip = val,
            Register::Eflags => regs.eflags = val,
            Register::Cs => regs.cs = val,
            Register::OrigRax => regs.orig_rax = val,
            Register::FsBase => regs.fs_base = val,
            Register::GsBase => regs.gs_base = val,
            Register::Fs => regs.fs = val,
            Register::Gs => regs.gs = val,
            Register::Ss => regs.ss = val,
            Register::Ds => regs.ds = val,
            Register::Es => regs.es = val,
        }

        if unsafe {
            libc::ptrace(
                libc::PTRACE_SETREGS,
                self.pid,
                ptr::null_mut::<c_void>(),
                &regs as *const libc::user_regs_struct as *mut c_void,
            )
        } != 0
        {
            return Err(Error::last_os_error(format!(
                "set registers of process {}",
                self.pid
            )));
        }
        Ok(())
    }

    /// Returns the target's program counter.
    pub fn pc(&self) -> Result<u64> {
        self.get_register(Register::Rip)
    }

    /// Sets the target's program counter.
    pub fn set_pc(&self, pc: u64) -> Result<()> {
        self.set_register(Register::Rip, pc)
    }

    /// Reads one machine word from the target.
    ///
    /// ptrace accepts arbitrary byte addresses on x86_64; alignment is
    /// handled by the kernel.
    pub fn read_word(&self, address: u64) -> Result<u64> {
        if self.status != ProcessStatus::Paused {
            return Err(Error::InvalidCall(format!(
                "invalid call on process {}",
                self.pid
            )));
        }

        unsafe {
            *libc::__errno_location() = 0;
            let data = libc::ptrace(
                libc::PTRACE_PEEKDATA,
                self.pid,
                address as *mut c_void,
                ptr::null_mut::<c_void>(),
            );
            if data == -1 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(0) {
                    return Err(Error::Api {
                        context: format!(
                            "read data of process {} at {:#x}",
                            self.pid, address
                        ),
                        source: err,
                    });
                }
            }
            Ok(data as u64)
        }
    }

    /// Reads one byte from the target.
    pub fn read_byte(&self, address: u64) -> Result<u8> {
        let word = self.read_word(address)?;
        Ok(word.to_ne_bytes()[0])
    }

    /// Reads a NUL-terminated string of at most `maxlen` bytes.
    pub fn read_string(&self, address: u64, maxlen: usize) -> Result<String> {
        let mut ret = Vec::with_capacity(128);

        let mut offset = 0;
        while offset < maxlen {
            let word = self.read_word(address + offset as u64)?;
            for b in word.to_ne_bytes() {
                if b == 0 {
                    return Ok(String::from_utf8_lossy(&ret).into_owned());
                }
                ret.push(b);
            }
            offset += WORD_SIZE;
        }

        ret.truncate(maxlen);
        Ok(String::from_utf8_lossy(&ret).into_owned())
    }

    /// Fills `buffer` from target memory, one word at a time.
    ///
    /// The read length is the buffer length rounded down to a word
    /// multiple; the number of bytes actually read is returned.
    pub fn read_bytes(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        let count = buffer.len() - buffer.len() % WORD_SIZE;

        let mut offset = 0;
        while offset < count {
            let word = self.read_word(address + offset as u64)?;
            buffer[offset..offset + WORD_SIZE].copy_from_slice(&word.to_ne_bytes());
            offset += WORD_SIZE;
        }
        Ok(count)
    }

    /// Writes one machine word into the target.
    pub fn write_word(&self, address: u64, data: u64) -> Result<()> {
        if self.status != ProcessStatus::Paused {
            return Err(Error::InvalidCall(format!(
                "invalid call on process {}",
                self.pid
            )));
        }

        if unsafe {
            libc::ptrace(
                libc::PTRACE_POKEDATA,
                self.pid,
                address as *mut c_void,
                data as *mut c_void,
            )
        } != 0
        {
            return Err(Error::Api {
                context: format!(
                    "poke data of process {} at {:#x}",
                    self.pid, address
                ),
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Writes one byte into the target via read-modify-write of the
    /// containing word.
    pub fn write_byte(&self, address: u64, data: u8) -> Result<()> {
        let word = self.read_word(address)?;
        let mut bytes = word.to_ne_bytes();
        bytes[0] = data;
        self.write_word(address, u64::from_ne_bytes(bytes))
    }

    /// Sends a signal to the target.
    pub fn send_signal(&self, signum: i32) -> Result<()> {
        if self.status == ProcessStatus::Terminated {
            return Err(Error::InvalidCall(format!(
                "invalid call on process {}",
                self.pid
            )));
        }

        if unsafe { libc::kill(self.pid, signum) } != 0 {
            return Err(Error::last_os_error(format!(
                "send signal to process {}",
                self.pid
            )));
        }
        Ok(())
    }

    /// Registers a breakpoint at an absolute address.
    ///
    /// Idempotent; the breakpoint starts out disabled. Returns the address.
    pub fn create_breakpoint(&mut self, address: u64) -> u64 {
        self.breakpoints.entry(address).or_insert(Breakpoint {
            address,
            enabled: false,
            original_byte: 0,
        });
        address
    }

    /// Registers a breakpoint at the entry of a named function.
    ///
    /// The function's address comes from the executable's DWARF; with
    /// `skip_prologue` the breakpoint lands past the compiler-generated
    /// prologue. Returns the absolute breakpoint address.
    pub fn create_breakpoint_by_name(&mut self, func: &str, skip_prologue: bool) -> Result<u64> {
        let entry = self.symbols.find_function_entry(func, skip_prologue)?;
        Ok(self.create_breakpoint(entry + self.load_offset))
    }

    /// Returns the breakpoint registered at `address`, if any.
    pub fn breakpoint(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&address)
    }

    /// Returns the address of the enabled breakpoint the target is stopped
    /// at, if any.
    ///
    /// INT3 traps after the patched byte, so the breakpoint lives at
    /// `PC - 1`.
    pub fn hit_breakpoint(&self) -> Result<Option<u64>> {
        let location = self.pc()?.wrapping_sub(1);
        Ok(self.breakpoints.get(&location).map(|bp| bp.address))
    }

    /// Installs the trap byte for a registered breakpoint.
    ///
    /// Enabling an already-enabled breakpoint whose trap byte is intact is
    /// a no-op.
    pub fn enable_breakpoint(&mut self, address: u64) -> Result<()> {
        let bp = *self
            .breakpoints
            .get(&address)
            .ok_or_else(|| Error::NotFound(format!("no breakpoint at {:#x}", address)))?;

        let code = self.read_byte(address)?;
        if bp.enabled && code == INT3 {
            return Ok(());
        }

        self.write_byte(address, INT3)?;

        let bp = self.breakpoints.get_mut(&address).unwrap();
        bp.enabled = true;
        bp.original_byte = code;
        trace!("breakpoint enabled at {:#x}", address);
        Ok(())
    }

    /// Removes the trap byte for a registered breakpoint.
    ///
    /// If the target has overwritten the trap byte in the meantime the
    /// original byte is *not* written back; the breakpoint is simply marked
    /// disabled and the modification logged.
    pub fn disable_breakpoint(&mut self, address: u64) -> Result<()> {
        let bp = *self
            .breakpoints
            .get(&address)
            .ok_or_else(|| Error::NotFound(format!("no breakpoint at {:#x}", address)))?;
        if !bp.enabled {
            return Ok(());
        }

        let code = self.read_byte(address)?;
        if code != INT3 {
            let bp = self.breakpoints.get_mut(&address).unwrap();
            bp.enabled = false;
            bp.original_byte = code;
            warn!("code modified at breakpoint {:#x}", address);
            return Ok(());
        }

        self.write_byte(address, bp.original_byte)?;
        let bp = self.breakpoints.get_mut(&address).unwrap();
        bp.enabled = false;
        trace!("breakpoint disabled at {:#x}", address);
        Ok(())
    }

    /// Disables and forgets the breakpoint at `address`.
    pub fn remove_breakpoint(&mut self, address: u64) -> Result<()> {
        if self.breakpoints.contains_key(&address) {
            self.disable_breakpoint(address)?;
            self.breakpoints.remove(&address);
        }
        Ok(())
    }

    /// Disables and forgets all breakpoints, logging failures.
    pub fn clear_breakpoints(&mut self) {
        let addresses = self.breakpoints.keys().copied().collect::<Vec<_>>();
        for address in addresses {
            if let Err(e) = self.disable_breakpoint(address) {
                warn!("cannot disable breakpoint at {:#x}: {}", address, e);
            }
        }
        self.breakpoints.clear();
    }

    /// Returns the name of the function containing `address`, or an empty
    /// string when the executable's debug info does not cover it.
    ///
    /// `address` is a runtime address; the load offset is stripped before
    /// the lookup.
    pub fn function_name(&self, address: u64) -> String {
        self.symbols
            .function_name_at(address.wrapping_sub(self.load_offset))
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        if self.status == ProcessStatus::Terminated {
            return;
        }

        if self.status == ProcessStatus::Running {
            trace!("debugger dropped, pausing process {} first", self.pid);
            self.interrupt_safe();
        }

        trace!(
            "cleaning up {} breakpoints from process {}",
            self.breakpoints.len(),
            self.pid
        );
        self.clear_breakpoints();

        trace!("debugger dropped, resuming process {}", self.pid);
        self.continue_safe();

        trace!("detaching from process {}", self.pid);
        unsafe {
            libc::ptrace(
                libc::PTRACE_DETACH,
                self.pid,
                ptr::null_mut::<c_void>(),
                ptr::null_mut::<c_void>(),
            );
        }
    }
}
