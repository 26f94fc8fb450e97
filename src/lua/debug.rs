//! Reconstruction of Lua call stacks from remote memory.
//!
//! This is a reimplementation of the introspection half of the Lua 5.3
//! debug interface (`lua_getstack`, `lua_getinfo` and the symbolic
//! execution behind `getfuncname`/`getobjname`), with every pointer
//! dereference routed through a [`RemoteMemory`] instead of the VM's own
//! address space.

use crate::access::{RemoteMemory, RemotePtr};
use crate::error::{Error, Result};
use crate::lua::objects::*;
use crate::lua::opcodes::{self, OpCode};
use std::mem;

/// Maximum size of a rendered chunk origin, from `luaconf.h`.
pub const LUA_IDSIZE: usize = 60;

/// The activation record produced for one stack frame, mirroring the
/// public fields of `lua_Debug`.
#[derive(Debug, Clone, Default)]
pub struct LuaDebug {
    /// (n) a reasonable name for the function
    pub name: String,
    /// (n) 'global', 'local', 'field', 'method', ...
    pub namewhat: &'static str,
    /// (S) 'Lua', 'C' or 'main'
    pub what: &'static str,
    /// (S) chunk origin
    pub source: String,
    /// (S) printable rendering of `source`
    pub short_src: String,
    /// (l) current line, -1 when unavailable
    pub currentline: i32,
    /// (S)
    pub linedefined: i32,
    /// (S)
    pub lastlinedefined: i32,
    /// (u) number of upvalues
    pub nups: u8,
    /// (u) number of fixed parameters
    pub nparams: u8,
    /// (u)
    pub isvararg: bool,
    /// (t)
    pub istailcall: bool,
    /// native entry point, for C functions
    pub address: u64,
    /// the frame this record describes
    pub i_ci: RemotePtr<CallInfo>,
}

/// Reads the payload of a Lua string object.
///
/// The bytes live immediately after the max-aligned `UTString` header.
fn getstr(mem: &dyn RemoteMemory, s: RemotePtr<TString>) -> Result<String> {
    mem.read_c_string(s.address() + mem::size_of::<UTString>() as u64, 1024)
}

fn no_lua_closure(closure: Option<&Closure>) -> bool {
    match closure {
        None => true,
        Some(closure) => closure.is_c(),
    }
}

/// Renders a chunk origin into its printable form, the way `luaO_chunkid`
/// does.
///
/// `=source` is copied verbatim, `@path` keeps the tail of over-long
/// paths behind a `...` prefix, and anything else is a chunk of source
/// text wrapped as `[string "..."]`, cut at the first newline.
pub fn chunk_id(source: &str) -> String {
    const RETS: &[u8] = b"...";
    const PRE: &[u8] = b"[string \"";
    const POS: &[u8] = b"\"]";

    let src = source.as_bytes();
    let mut out = Vec::with_capacity(LUA_IDSIZE);
    match src.first().copied() {
        Some(b'=') => {
            if src.len() <= LUA_IDSIZE {
                out.extend_from_slice(&src[1..]);
            } else {
                out.extend_from_slice(&src[1..LUA_IDSIZE]);
            }
        }
        Some(b'@') => {
            if src.len() <= LUA_IDSIZE {
                out.extend_from_slice(&src[1..]);
            } else {
                out.extend_from_slice(RETS);
                let keep = LUA_IDSIZE - RETS.len() - 1;
                out.extend_from_slice(&src[src.len() - keep..]);
            }
        }
        _ => {
            let newline = src.iter().position(|&b| b == b'\n');
            out.extend_from_slice(PRE);
            let space = LUA_IDSIZE - PRE.len() - RETS.len() - POS.len() - 1;
            if src.len() < space && newline.is_none() {
                out.extend_from_slice(src);
            } else {
                let mut len = newline.unwrap_or(src.len());
                if len > space {
                    len = space;
                }
                out.extend_from_slice(&src[..len]);
                out.extend_from_slice(RETS);
            }
            out.extend_from_slice(POS);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn funcinfo(mem: &dyn RemoteMemory, ar: &mut LuaDebug, closure: Option<&Closure>) -> Result<()> {
    if no_lua_closure(closure) {
        ar.source = "=[C]".to_string();
        ar.linedefined = -1;
        ar.lastlinedefined = -1;
        ar.what = "C";
    } else {
        let proto = closure.unwrap().lua().p.read(mem)?;
        ar.source = if proto.source.is_null() {
            "=?".to_string()
        } else {
            getstr(mem, proto.source)?
        };
        ar.linedefined = proto.linedefined;
        ar.lastlinedefined = proto.lastlinedefined;
        ar.what = if ar.linedefined == 0 { "main" } else { "Lua" };
    }
    ar.short_src = chunk_id(&ar.source);
    Ok(())
}

/// The bytecode index of the most recently executed instruction of a Lua
/// frame.
fn pc_rel(savedpc: RemotePtr<Instruction>, p: &Proto) -> i64 {
    (savedpc.address() as i64 - p.code.address() as i64)
        / mem::size_of::<Instruction>() as i64
        - 1
}

fn current_line(mem: &dyn RemoteMemory, ci: &CallInfo) -> Result<i32> {
    if !ci.is_lua() {
        return Err(Error::BadState("call info is not a Lua frame".to_string()));
    }

    let func = ci.func.read(mem)?;
    let closure = func.gc().cast::<Closure>().read(mem)?;
    let proto = closure.lua().p.read(mem)?;
    if proto.lineinfo.is_null() {
        return Ok(-1);
    }

    let pc = pc_rel(ci.lua_frame().savedpc, &proto);
    if pc < 0 || pc >= proto.sizelineinfo as i64 {
        return Err(Error::BadState(format!(
            "saved pc {} outside line info",
            pc
        )));
    }
    proto.lineinfo.at(pc).read(mem)
}

fn filterpc(pc: i32, jmptarget: i32) -> i32 {
    if pc < jmptarget {
        /* cannot know who sets that register inside a conditional */
        -1
    } else {
        pc
    }
}

/// Finds the last instruction before `lastpc` that provably sets `reg`,
/// or -1.
///
/// Instructions sitting before an active forward-jump target are
/// conditional and never count.
fn findsetreg(mem: &dyn RemoteMemory, p: &Proto, lastpc: i32, reg: i32) -> Result<i32> {
    let mut setreg = -1;
    let mut jmptarget = 0;
    for pc in 0..lastpc {
        let i = p.code.at(pc as i64).read(mem)?;
        let op = opcodes::get_opcode(i)?;
        let a = opcodes::getarg_a(i);
        match op {
            OpCode::LoadNil => {
                let b = opcodes::getarg_b(i);
                /* sets registers from 'a' to 'a+b' */
                if a <= reg && reg <= a + b {
                    setreg = filterpc(pc, jmptarget);
                }
            }
            OpCode::TForCall => {
                /* affects all registers above its base */
                if reg >= a + 2 {
                    setreg = filterpc(pc, jmptarget);
                }
            }
            OpCode::Call | OpCode::TailCall => {
                if reg >= a {
                    setreg = filterpc(pc, jmptarget);
                }
            }
            OpCode::Jmp => {
                let dest = pc + 1 + opcodes::getarg_sbx(i);
                /* forward jump that does not skip lastpc? */
                if pc < dest && dest <= lastpc && dest > jmptarget {
                    jmptarget = dest;
                }
            }
            _ => {
                if opcodes::test_a_mode(op) && reg == a {
                    setreg = filterpc(pc, jmptarget);
                }
            }
        }
    }
    Ok(setreg)
}

/// Looks up the name of the `local_number`th local variable active at
/// `pc`, the way `luaF_getlocalname` does.
fn local_variable_name(
    mem: &dyn RemoteMemory,
    p: &Proto,
    mut local_number: i32,
    pc: i32,
) -> Result<Option<String>> {
    for i in 0..p.sizelocvars {
        let var = p.locvars.at(i as i64).read(mem)?;
        if var.startpc > pc {
            break;
        }
        if pc < var.endpc {
            /* variable is active */
            local_number -= 1;
            if local_number == 0 {
                return Ok(Some(getstr(mem, var.varname)?));
            }
        }
    }
    Ok(None)
}

fn upvalue_name(mem: &dyn RemoteMemory, p: &Proto, uv: i32) -> Result<String> {
    if uv < 0 || uv >= p.sizeupvalues {
        return Err(Error::BadState(format!(
            "upvalue index {} out of range",
            uv
        )));
    }
    let desc = p.upvalues.at(uv as i64).read(mem)?;
    if desc.name.is_null() {
        Ok("?".to_string())
    } else {
        getstr(mem, desc.name)
    }
}

/// Resolves the name of a table key operand.
///
/// A K operand is its own name when it is a string constant; a register
/// operand is traced back through [`getobjname`] and accepted only when it
/// resolves to a constant.
fn kname(mem: &dyn RemoteMemory, p: &Proto, pc: i32, c: i32) -> Result<String> {
    if opcodes::is_k(c) {
        let kvalue = p.k.at(opcodes::index_k(c) as i64).read(mem)?;
        if kvalue.is_string() {
            return getstr(mem, kvalue.gc().cast());
        }
    } else if let Some((name, what)) = getobjname(mem, p, pc, c)? {
        if what.starts_with('c') {
            return Ok(name);
        }
    }
    Ok("?".to_string())
}

/// Recovers a name and classification for the value in register `reg` at
/// `lastpc`, by symbolic execution of the function's bytecode.
fn getobjname(
    mem: &dyn RemoteMemory,
    p: &Proto,
    lastpc: i32,
    reg: i32,
) -> Result<Option<(String, &'static str)>> {
    if let Some(name) = local_variable_name(mem, p, reg + 1, lastpc)? {
        return Ok(Some((name, "local")));
    }

    /* not a local; try symbolic execution */
    let pc = findsetreg(mem, p, lastpc, reg)?;
    if pc == -1 {
        return Ok(None);
    }

    let i = p.code.at(pc as i64).read(mem)?;
    let op = opcodes::get_opcode(i)?;
    match op {
        OpCode::Move => {
            let b = opcodes::getarg_b(i);
            if b < opcodes::getarg_a(i) {
                /* the moved value has the name, if any */
                return getobjname(mem, p, pc, b);
            }
        }
        OpCode::GetTabUp | OpCode::GetTable => {
            let k = opcodes::getarg_c(i);
            let t = opcodes::getarg_b(i);
            let vn = if op == OpCode::GetTable {
                local_variable_name(mem, p, t + 1, pc)?.unwrap_or_default()
            } else {
                upvalue_name(mem, p, t)?
            };
            let name = kname(mem, p, pc, k)?;
            let what = if vn == "_ENV" { "global" } else { "field" };
            return Ok(Some((name, what)));
        }
        OpCode::GetUpval => {
            let name = upvalue_name(mem, p, opcodes::getarg_b(i))?;
            return Ok(Some((name, "upvalue")));
        }
        OpCode::LoadK | OpCode::LoadKx => {
            let b = if op == OpCode::LoadK {
                opcodes::getarg_bx(i)
            } else {
                let extra = p.code.at(pc as i64 + 1).read(mem)?;
                opcodes::getarg_ax(extra)
            };
            let kvalue = p.k.at(b as i64).read(mem)?;
            if kvalue.is_string() {
                let name = getstr(mem, kvalue.gc().cast())?;
                return Ok(Some((name, "constant")));
            }
        }
        OpCode::Self_ => {
            let name = kname(mem, p, pc, opcodes::getarg_c(i))?;
            return Ok(Some((name, "method")));
        }
        _ => {}
    }
    Ok(None)
}

/// Derives a name for the function a frame is executing, from the calling
/// instruction of its Lua caller.
fn funcnamefromcode(
    mem: &dyn RemoteMemory,
    state: &LuaState,
    ci: &CallInfo,
) -> Result<Option<(String, &'static str)>> {
    let func = ci.func.read(mem)?;
    if !func.is_function() {
        return Err(Error::BadState("caller frame is not a function".to_string()));
    }
    let closure = func.gc().cast::<Closure>().read(mem)?;
    let p = closure.lua().p.read(mem)?;

    let pc = pc_rel(ci.lua_frame().savedpc, &p);
    if pc < 0 || pc >= p.sizecode as i64 {
        return Err(Error::BadState(format!("saved pc {} outside code", pc)));
    }
    let i = p.code.at(pc).read(mem)?;
    let pc = pc as i32;

    if ci.is_hooked() {
        /* called inside a hook; no name to be found */
        return Ok(Some(("?".to_string(), "hook")));
    }

    let op = opcodes::get_opcode(i)?;
    let tm = match op {
        OpCode::Call | OpCode::TailCall => {
            return getobjname(mem, &p, pc, opcodes::getarg_a(i));
        }
        OpCode::TForCall => {
            return Ok(Some(("for iterator".to_string(), "for iterator")));
        }
        /* other instructions can do calls through metamethods */
        OpCode::Self_ | OpCode::GetTabUp | OpCode::GetTable => TM_INDEX,
        OpCode::SetTabUp | OpCode::SetTable => TM_NEWINDEX,
        OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Mod
        | OpCode::Pow
        | OpCode::Div
        | OpCode::IDiv
        | OpCode::BAnd
        | OpCode::BOr
        | OpCode::BXor
        | OpCode::Shl
        | OpCode::Shr => op as usize - OpCode::Add as usize + TM_ADD,
        OpCode::Unm => TM_UNM,
        OpCode::BNot => TM_BNOT,
        OpCode::Len => TM_LEN,
        OpCode::Concat => TM_CONCAT,
        OpCode::Eq => TM_EQ,
        OpCode::Lt => TM_LT,
        OpCode::Le => TM_LE,
        _ => return Ok(None),
    };

    let global = state.l_G.read(mem)?;
    let name = getstr(mem, global.tmname[tm])?;
    Ok(Some((name, "metamethod")))
}

fn getfuncname(
    mem: &dyn RemoteMemory,
    state: &LuaState,
    ci: Option<&CallInfo>,
) -> Result<Option<(String, &'static str)>> {
    let ci = match ci {
        Some(ci) => ci,
        None => return Ok(None),
    };

    if ci.is_finalizer() {
        return Ok(Some(("__gc".to_string(), "metamethod")));
    }

    let previous = ci.previous.read(mem)?;
    if !ci.is_tail_call() && previous.is_lua() {
        /* the calling instruction knows who it called */
        return funcnamefromcode(mem, state, &previous);
    }
    Ok(None)
}

fn aux_get_info(
    mem: &dyn RemoteMemory,
    state: &LuaState,
    what: &str,
    ar: &mut LuaDebug,
    closure: Option<&Closure>,
    ci: Option<&CallInfo>,
) -> Result<()> {
    for opt in what.chars() {
        match opt {
            'S' => {
                funcinfo(mem, ar, closure)?;
                if let Some(closure) = closure {
                    if closure.is_c() {
                        ar.address = closure.c().f;
                    }
                }
            }
            'l' => {
                ar.currentline = match ci {
                    Some(ci) if ci.is_lua() => current_line(mem, ci)?,
                    _ => -1,
                };
            }
            'u' => {
                ar.nups = closure.map_or(0, |closure| closure.nupvalues());
                if no_lua_closure(closure) {
                    ar.isvararg = true;
                    ar.nparams = 0;
                } else {
                    let proto = closure.unwrap().lua().p.read(mem)?;
                    ar.isvararg = proto.is_vararg != 0;
                    ar.nparams = proto.numparams;
                }
            }
            't' => {
                ar.istailcall = ci.map_or(false, |ci| ci.is_tail_call());
            }
            'n' => match getfuncname(mem, state, ci)? {
                Some((name, namewhat)) => {
                    ar.name = name;
                    ar.namewhat = namewhat;
                }
                None => {
                    ar.name.clear();
                    ar.namewhat = "";
                }
            },
            _ => {
                return Err(Error::BadArgument(format!(
                    "invalid getinfo option '{}'",
                    opt
                )));
            }
        }
    }
    Ok(())
}

/// The `lua_getstack` analogue: finds the activation record `level` frames
/// below the top of the thread at `state_address`.
pub fn get_stack(mem: &dyn RemoteMemory, state_address: u64, level: u32) -> Result<LuaDebug> {
    let state = RemotePtr::<LuaState>::new(state_address).read(mem)?;
    let sentinel = RemotePtr::<CallInfo>::new(base_ci_address(state_address));

    let mut remaining = level;
    let mut ci = state.ci;
    while remaining > 0 && ci != sentinel {
        ci = ci.read(mem)?.previous;
        remaining -= 1;
    }

    if remaining == 0 && ci != sentinel {
        Ok(LuaDebug {
            i_ci: ci,
            ..Default::default()
        })
    } else {
        Err(Error::NotFound(format!("stack level {} not found", level)))
    }
}

/// The `lua_getinfo` analogue.
///
/// `what` is a string of option characters (`n`, `S`, `l`, `t`, `u`); the
/// `>` prefix inspects the function value sitting below the thread's top
/// instead of the frame in `ar.i_ci`, without altering the remote stack.
pub fn get_info(
    mem: &dyn RemoteMemory,
    state: &LuaState,
    what: &str,
    ar: &mut LuaDebug,
) -> Result<()> {
    let mut what = what;
    let mut ci = None;

    let func = if let Some(rest) = what.strip_prefix('>') {
        what = rest;
        let func = state.top.at(-1).read(mem)?;
        if !func.is_function() {
            return Err(Error::BadState("function expected".to_string()));
        }
        func
    } else {
        let info = ar.i_ci.read(mem)?;
        let func = info.func.read(mem)?;
        if !func.is_function() {
            return Err(Error::BadState("frame function is not a function".to_string()));
        }
        ci = Some(info);
        func
    };

    let closure = if func.is_closure() {
        Some(func.gc().cast::<Closure>().read(mem)?)
    } else {
        if func.is_light_c_function() {
            ar.address = func.light_c_function();
        }
        None
    };

    aux_get_info(mem, state, what, ar, closure.as_ref(), ci.as_ref())
}

/// Walks the whole call stack of the thread at `state_address`, innermost
/// frame first.
///
/// The walk follows `ci.previous` and stops at the thread's inlined
/// `base_ci`, which is recognized by address identity and never
/// dereferenced as a frame.
pub fn dump_stack(mem: &dyn RemoteMemory, state_address: u64) -> Result<Vec<LuaDebug>> {
    let state = RemotePtr::<LuaState>::new(state_address).read(mem)?;
    let sentinel = RemotePtr::<CallInfo>::new(base_ci_address(state_address));

    let mut frames = Vec::new();
    let mut ci = state.ci;
    while !ci.is_null() && ci != sentinel {
        let mut ar = LuaDebug {
            i_ci: ci,
            ..Default::default()
        };
        get_info(mem, &state, "nSlt", &mut ar)?;
        ci = ci.read(mem)?.previous;
        frames.push(ar);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::testing::ImageMemory;
    use crate::access::Remote;
    use crate::lua::opcodes::{encode_abc, encode_abx, encode_asbx, rk_constant};

    const BASE: u64 = 0x100000;

    const TM_NAMES: [&str; TM_N] = [
        "__index", "__newindex", "__gc", "__mode", "__len", "__eq", "__add", "__sub", "__mul",
        "__mod", "__pow", "__div", "__idiv", "__band", "__bor", "__bxor", "__shl", "__shr",
        "__unm", "__bnot", "__lt", "__le", "__concat", "__call",
    ];

    /// Builds a synthetic Lua heap the walker can read.
    struct Image {
        mem: ImageMemory,
        next: u64,
    }

    impl Image {
        fn new() -> Image {
            Image {
                mem: ImageMemory::new(BASE, 0x10000),
                next: BASE,
            }
        }

        fn alloc(&mut self, size: usize) -> u64 {
            let addr = self.next;
            self.next += ((size + 15) & !15) as u64;
            addr
        }

        fn reserve<T: Remote>(&mut self) -> u64 {
            self.alloc(mem::size_of::<T>())
        }

        fn write_at<T: Remote>(&mut self, addr: u64, value: &T) {
            self.mem.write(addr, value);
        }

        fn put<T: Remote>(&mut self, value: T) -> u64 {
            let addr = self.alloc(mem::size_of::<T>());
            self.mem.write(addr, &value);
            addr
        }

        fn string(&mut self, s: &str) -> RemotePtr<TString> {
            let addr = self.alloc(mem::size_of::<UTString>() + s.len() + 1);
            let mut header: TString = unsafe { mem::zeroed() };
            header.tt = LUA_TSHRSTR as u8;
            header.shrlen = s.len() as u8;
            self.mem.write(addr, &header);
            let mut payload = s.as_bytes().to_vec();
            payload.push(0);
            self.mem
                .write_bytes(addr + mem::size_of::<UTString>() as u64, &payload);
            RemotePtr::new(addr)
        }

        fn string_value(&mut self, s: &str) -> TValue {
            let ptr = self.string(s);
            TValue {
                value_: Value { gc: ptr.cast() },
                tt_: collectable(LUA_TSHRSTR),
            }
        }

        fn integer_value(&mut self, i: i64) -> TValue {
            TValue {
                value_: Value { i },
                tt_: LUA_TNUMINT,
            }
        }

        fn array<T: Remote>(&mut self, items: &[T]) -> RemotePtr<T> {
            let addr = self.alloc(items.len() * mem::size_of::<T>());
            for (index, item) in items.iter().enumerate() {
                self.mem
                    .write(addr + (index * mem::size_of::<T>()) as u64, item);
            }
            RemotePtr::new(addr)
        }

        fn proto(
            &mut self,
            code: &[Instruction],
            constants: &[TValue],
            locvars: &[(&str, i32, i32)],
            upvalues: &[Option<&str>],
        ) -> RemotePtr<Proto> {
            let code_ptr = self.array(code);

            let k_ptr = if constants.is_empty() {
                RemotePtr::null()
            } else {
                self.array(constants)
            };

            let mut locs = Vec::new();
            for &(name, startpc, endpc) in locvars {
                let varname = self.string(name);
                locs.push(LocVar {
                    varname,
                    startpc,
                    endpc,
                });
            }
            let locvars_ptr = if locs.is_empty() {
                RemotePtr::null()
            } else {
                self.array(&locs)
            };

            let mut ups = Vec::new();
            for name in upvalues {
                let name = match name {
                    Some(name) => self.string(name),
                    None => RemotePtr::null(),
                };
                ups.push(Upvaldesc {
                    name,
                    instack: 1,
                    idx: 0,
                });
            }
            let upvalues_ptr = if ups.is_empty() {
                RemotePtr::null()
            } else {
                self.array(&ups)
            };

            let mut proto: Proto = unsafe { mem::zeroed() };
            proto.code = code_ptr;
            proto.sizecode = code.len() as i32;
            proto.k = k_ptr;
            proto.sizek = constants.len() as i32;
            proto.locvars = locvars_ptr;
            proto.sizelocvars = locs.len() as i32;
            proto.upvalues = upvalues_ptr;
            proto.sizeupvalues = ups.len() as i32;
            RemotePtr::new(self.put(proto))
        }

        fn lua_closure(&mut self, proto: RemotePtr<Proto>) -> TValue {
            let mut closure: LClosure = unsafe { mem::zeroed() };
            closure.tt = LUA_TLCL as u8;
            closure.p = proto;
            // allocations are padded, so the 48 byte union read stays in
            // bounds
            let addr = self.put(closure);
            TValue {
                value_: Value {
                    gc: RemotePtr::new(addr),
                },
                tt_: collectable(LUA_TLCL),
            }
        }

        fn c_closure(&mut self, f: u64, nupvalues: u8) -> TValue {
            let mut closure: CClosure = unsafe { mem::zeroed() };
            closure.tt = LUA_TCCL as u8;
            closure.nupvalues = nupvalues;
            closure.f = f;
            let addr = self.put(closure);
            TValue {
                value_: Value {
                    gc: RemotePtr::new(addr),
                },
                tt_: collectable(LUA_TCCL),
            }
        }

        fn call_info(
            &mut self,
            func: TValue,
            savedpc: RemotePtr<Instruction>,
            callstatus: u16,
            previous: RemotePtr<CallInfo>,
        ) -> RemotePtr<CallInfo> {
            let func_slot = self.put(func);
            let mut ci: CallInfo = unsafe { mem::zeroed() };
            ci.func = RemotePtr::new(func_slot);
            ci.previous = previous;
            ci.callstatus = callstatus;
            ci.u = CallFrame {
                l: LuaCallFrame {
                    base: RemotePtr::null(),
                    savedpc,
                },
            };
            RemotePtr::new(self.put(ci))
        }

        fn global_state(&mut self) -> RemotePtr<GlobalState> {
            let mut global: GlobalState = unsafe { mem::zeroed() };
            for (index, name) in TM_NAMES.iter().enumerate() {
                global.tmname[index] = self.string(name);
            }
            RemotePtr::new(self.put(global))
        }
    }

    /// A frame whose Lua caller is stopped at `calling_index`, plus the
    /// thread both belong to.
    struct CallFixture {
        state_address: u64,
        callee: CallInfo,
    }

    fn call_fixture(
        img: &mut Image,
        caller_code: &[Instruction],
        constants: &[TValue],
        upvalues: &[Option<&str>],
        calling_index: usize,
        caller_status: u16,
        callee_status: u16,
    ) -> CallFixture {
        let global = img.global_state();
        let proto_ptr = img.proto(caller_code, constants, &[], upvalues);
        let proto = proto_ptr.read(&img.mem).unwrap();
        let caller_fn = img.lua_closure(proto_ptr);
        // savedpc points one past the instruction being executed
        let savedpc = proto.code.at(calling_index as i64 + 1);

        let state_address = img.reserve::<LuaState>();
        let caller_ci = img.call_info(
            caller_fn,
            savedpc,
            caller_status,
            RemotePtr::new(base_ci_address(state_address)),
        );
        let callee_fn = img.c_closure(0xdead_0000, 0);
        let callee_ci = img.call_info(callee_fn, RemotePtr::null(), callee_status, caller_ci);

        let mut state: LuaState = unsafe { mem::zeroed() };
        state.tt = LUA_TTHREAD as u8;
        state.ci = callee_ci;
        state.l_G = global;
        img.write_at(state_address, &state);

        CallFixture {
            state_address,
            callee: callee_ci.read(&img.mem).unwrap(),
        }
    }

    fn state_of(img: &Image, fixture: &CallFixture) -> LuaState {
        RemotePtr::<LuaState>::new(fixture.state_address)
            .read(&img.mem)
            .unwrap()
    }

    #[test]
    fn short_source_literal() {
        assert_eq!(chunk_id("=mysrc"), "mysrc");

        let long = format!("={}", "x".repeat(70));
        let out = chunk_id(&long);
        assert_eq!(out.len(), LUA_IDSIZE - 1);
        assert_eq!(out, "x".repeat(59));
    }

    #[test]
    fn short_source_file() {
        assert_eq!(chunk_id("@fixture.lua"), "fixture.lua");

        let path = format!("/tmp/{}/file.lua", "d".repeat(64));
        let long = format!("@{}", path);
        assert!(long.len() > LUA_IDSIZE);
        let out = chunk_id(&long);
        assert!(out.starts_with("..."));
        assert_eq!(out.len(), LUA_IDSIZE - 1);
        assert!(out.ends_with(&path[path.len() - 56..]));
    }

    #[test]
    fn short_source_string_chunk() {
        assert_eq!(chunk_id("print('hello')"), "[string \"print('hello')\"]");
        assert_eq!(chunk_id("line1\nline2"), "[string \"line1...\"]");

        let long = "y".repeat(50);
        let out = chunk_id(&long);
        assert_eq!(out, format!("[string \"{}...\"]", "y".repeat(45)));
        assert!(out.len() <= LUA_IDSIZE);
    }

    #[test]
    fn local_name() {
        let mut img = Image::new();
        let code = [encode_abc(OpCode::Call, 0, 1, 1)];
        let proto = img.proto(&code, &[], &[("x", 0, 5), ("y", 0, 5)], &[]);
        let proto = proto.read(&img.mem).unwrap();

        let (name, what) = getobjname(&img.mem, &proto, 1, 1).unwrap().unwrap();
        assert_eq!(name, "y");
        assert_eq!(what, "local");
    }

    #[test]
    fn global_name() {
        let mut img = Image::new();
        let print_k = img.string_value("print");
        let code = [
            encode_abc(OpCode::GetTabUp, 0, 0, rk_constant(0)),
            encode_abc(OpCode::Call, 0, 1, 1),
        ];
        let proto = img.proto(&code, &[print_k], &[], &[Some("_ENV")]);
        let proto = proto.read(&img.mem).unwrap();

        let (name, what) = getobjname(&img.mem, &proto, 1, 0).unwrap().unwrap();
        assert_eq!(name, "print");
        assert_eq!(what, "global");
    }

    #[test]
    fn field_name() {
        let mut img = Image::new();
        let f_k = img.string_value("f");
        let code = [encode_abc(OpCode::GetTable, 1, 0, rk_constant(0))];
        let proto = img.proto(&code, &[f_k], &[("t", 0, 5)], &[]);
        let proto = proto.read(&img.mem).unwrap();

        let (name, what) = getobjname(&img.mem, &proto, 1, 1).unwrap().unwrap();
        assert_eq!(name, "f");
        assert_eq!(what, "field");
    }

    #[test]
    fn method_name() {
        let mut img = Image::new();
        let f_k = img.string_value("f");
        let code = [encode_abc(OpCode::Self_, 0, 0, rk_constant(0))];
        let proto = img.proto(&code, &[f_k], &[], &[]);
        let proto = proto.read(&img.mem).unwrap();

        let (name, what) = getobjname(&img.mem, &proto, 1, 0).unwrap().unwrap();
        assert_eq!(name, "f");
        assert_eq!(what, "method");
    }

    #[test]
    fn upvalue_and_constant_names() {
        let mut img = Image::new();
        let num = img.integer_value(42);
        let hello = img.string_value("hello");
        let code = [
            encode_abc(OpCode::GetUpval, 0, 1, 0),
            encode_abx(OpCode::LoadK, 1, 1),
        ];
        let proto = img.proto(&code, &[num, hello], &[], &[Some("_ENV"), Some("counter")]);
        let proto = proto.read(&img.mem).unwrap();

        let (name, what) = getobjname(&img.mem, &proto, 1, 0).unwrap().unwrap();
        assert_eq!(name, "counter");
        assert_eq!(what, "upvalue");

        let (name, what) = getobjname(&img.mem, &proto, 2, 1).unwrap().unwrap();
        assert_eq!(name, "hello");
        assert_eq!(what, "constant");
    }

    #[test]
    fn move_traces_the_source_register() {
        let mut img = Image::new();
        let print_k = img.string_value("print");
        let code = [
            encode_abc(OpCode::GetTabUp, 0, 0, rk_constant(0)),
            encode_abc(OpCode::Move, 1, 0, 0),
        ];
        let proto = img.proto(&code, &[print_k], &[], &[Some("_ENV")]);
        let proto = proto.read(&img.mem).unwrap();

        let (name, what) = getobjname(&img.mem, &proto, 2, 1).unwrap().unwrap();
        assert_eq!(name, "print");
        assert_eq!(what, "global");
    }

    #[test]
    fn conditional_set_is_not_trusted() {
        let mut img = Image::new();
        let hello = img.string_value("hello");
        // the LoadK sits before the jump target, so it is conditional
        let code = [
            encode_asbx(OpCode::Jmp, 0, 1),
            encode_abx(OpCode::LoadK, 0, 0),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let proto = img.proto(&code, &[hello], &[], &[]);
        let proto = proto.read(&img.mem).unwrap();

        assert!(getobjname(&img.mem, &proto, 2, 0).unwrap().is_none());
    }

    #[test]
    fn upvalue_index_out_of_range_is_bad_state() {
        let mut img = Image::new();
        let code = [encode_abc(OpCode::GetUpval, 0, 5, 0)];
        let proto = img.proto(&code, &[], &[], &[Some("_ENV")]);
        let proto = proto.read(&img.mem).unwrap();

        assert!(matches!(
            getobjname(&img.mem, &proto, 1, 0),
            Err(Error::BadState(_))
        ));
    }

    #[test]
    fn call_name_through_caller_instruction() {
        let mut img = Image::new();
        let print_k = img.string_value("print");
        let code = [
            encode_abc(OpCode::GetTabUp, 0, 0, rk_constant(0)),
            encode_abc(OpCode::Call, 0, 1, 1),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[print_k], &[Some("_ENV")], 1, CIST_LUA, 0);
        let state = state_of(&img, &fixture);

        let (name, what) = getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .unwrap();
        assert_eq!(name, "print");
        assert_eq!(what, "global");
    }

    #[test]
    fn metamethod_names() {
        let mut img = Image::new();
        let code = [
            encode_abc(OpCode::Add, 0, 1, 2),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[], &[], 0, CIST_LUA, 0);
        let state = state_of(&img, &fixture);
        let (name, what) = getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .unwrap();
        assert_eq!(name, "__add");
        assert_eq!(what, "metamethod");

        let mut img = Image::new();
        let code = [
            encode_abc(OpCode::Le, 0, 1, 2),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[], &[], 0, CIST_LUA, 0);
        let state = state_of(&img, &fixture);
        let (name, what) = getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .unwrap();
        assert_eq!(name, "__le");
        assert_eq!(what, "metamethod");

        let mut img = Image::new();
        let code = [
            encode_abc(OpCode::GetTable, 0, 1, 2),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[], &[], 0, CIST_LUA, 0);
        let state = state_of(&img, &fixture);
        let (name, what) = getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .unwrap();
        assert_eq!(name, "__index");
        assert_eq!(what, "metamethod");
    }

    #[test]
    fn for_iterator_name() {
        let mut img = Image::new();
        let code = [
            encode_abc(OpCode::TForCall, 0, 0, 1),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[], &[], 0, CIST_LUA, 0);
        let state = state_of(&img, &fixture);

        let (name, what) = getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .unwrap();
        assert_eq!(name, "for iterator");
        assert_eq!(what, "for iterator");
    }

    #[test]
    fn finalizer_is_reported_as_gc_metamethod() {
        let mut img = Image::new();
        let code = [encode_abc(OpCode::Return, 0, 1, 0)];
        let fixture = call_fixture(&mut img, &code, &[], &[], 0, CIST_LUA, CIST_FIN);
        let state = state_of(&img, &fixture);

        let (name, what) = getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .unwrap();
        assert_eq!(name, "__gc");
        assert_eq!(what, "metamethod");
    }

    #[test]
    fn tail_call_suppresses_the_name() {
        let mut img = Image::new();
        let code = [
            encode_abc(OpCode::TailCall, 0, 1, 0),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[], &[], 0, CIST_LUA, CIST_TAIL | CIST_LUA);
        let state = state_of(&img, &fixture);

        assert!(getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .is_none());

        let mut ar = LuaDebug {
            i_ci: state.ci,
            ..Default::default()
        };
        get_info(&img.mem, &state, "t", &mut ar).unwrap();
        assert!(ar.istailcall);
    }

    #[test]
    fn hook_frames_have_no_recoverable_name() {
        let mut img = Image::new();
        let code = [
            encode_abc(OpCode::Call, 0, 1, 1),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[], &[], 0, CIST_LUA | CIST_HOOKED, 0);
        let state = state_of(&img, &fixture);

        let (name, what) = getfuncname(&img.mem, &state, Some(&fixture.callee))
            .unwrap()
            .unwrap();
        assert_eq!(name, "?");
        assert_eq!(what, "hook");
    }

    #[test]
    fn stack_walk_terminates_at_the_sentinel() {
        let mut img = Image::new();
        let print_k = img.string_value("print");
        let code = [
            encode_abc(OpCode::GetTabUp, 0, 0, rk_constant(0)),
            encode_abc(OpCode::Call, 0, 1, 1),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let fixture = call_fixture(&mut img, &code, &[print_k], &[Some("_ENV")], 1, CIST_LUA, 0);

        let level0 = get_stack(&img.mem, fixture.state_address, 0).unwrap();
        let level1 = get_stack(&img.mem, fixture.state_address, 1).unwrap();
        assert_ne!(level0.i_ci, level1.i_ci);
        assert!(matches!(
            get_stack(&img.mem, fixture.state_address, 2),
            Err(Error::NotFound(_))
        ));
    }

    fn dump_fixture(img: &mut Image) -> u64 {
        let global = img.global_state();
        let print_k = img.string_value("print");
        let code = [
            encode_abc(OpCode::GetTabUp, 0, 0, rk_constant(0)),
            encode_abc(OpCode::Call, 0, 1, 1),
            encode_abc(OpCode::Return, 0, 1, 0),
        ];
        let proto_ptr = img.proto(&code, &[print_k], &[], &[Some("_ENV")]);
        let mut proto = proto_ptr.read(&img.mem).unwrap();
        proto.source = img.string("@fixture.lua");
        proto.linedefined = 1;
        proto.lastlinedefined = 3;
        proto.lineinfo = img.array(&[1i32, 2, 2]);
        proto.sizelineinfo = 3;
        img.write_at(proto_ptr.address(), &proto);

        let caller_fn = img.lua_closure(proto_ptr);
        let savedpc = proto.code.at(2); // executing the Call at pc 1

        let state_address = img.reserve::<LuaState>();
        let caller_ci = img.call_info(
            caller_fn,
            savedpc,
            CIST_LUA,
            RemotePtr::new(base_ci_address(state_address)),
        );
        let callee_fn = img.c_closure(0xdead_0000, 2);
        let callee_ci = img.call_info(callee_fn, RemotePtr::null(), 0, caller_ci);

        let mut state: LuaState = unsafe { mem::zeroed() };
        state.tt = LUA_TTHREAD as u8;
        state.ci = callee_ci;
        state.l_G = global;
        img.write_at(state_address, &state);
        state_address
    }

    #[test]
    fn dump_stack_reports_both_frames() {
        let mut img = Image::new();
        let state_address = dump_fixture(&mut img);

        let frames = dump_stack(&img.mem, state_address).unwrap();
        assert_eq!(frames.len(), 2);

        let native = &frames[0];
        assert_eq!(native.what, "C");
        assert_eq!(native.source, "=[C]");
        assert_eq!(native.short_src, "[C]");
        assert_eq!(native.address, 0xdead_0000);
        assert_eq!(native.currentline, -1);
        assert_eq!(native.linedefined, -1);
        assert_eq!(native.name, "print");
        assert_eq!(native.namewhat, "global");
        assert!(!native.istailcall);

        let lua = &frames[1];
        assert_eq!(lua.what, "Lua");
        assert_eq!(lua.source, "@fixture.lua");
        assert_eq!(lua.short_src, "fixture.lua");
        assert_eq!(lua.linedefined, 1);
        assert_eq!(lua.lastlinedefined, 3);
        assert_eq!(lua.currentline, 2);
        assert_eq!(lua.namewhat, "");
    }

    #[test]
    fn dumps_are_independent() {
        let mut img = Image::new();
        let state_address = dump_fixture(&mut img);

        let first = dump_stack(&img.mem, state_address).unwrap();
        let second = dump_stack(&img.mem, state_address).unwrap();
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.what, b.what);
            assert_eq!(a.short_src, b.short_src);
            assert_eq!(a.currentline, b.currentline);
        }
    }

    #[test]
    fn main_chunk_is_classified_as_main() {
        let mut img = Image::new();
        let global = img.global_state();
        let code = [encode_abc(OpCode::Return, 0, 1, 0)];
        let proto_ptr = img.proto(&code, &[], &[], &[]);
        let mut proto = proto_ptr.read(&img.mem).unwrap();
        proto.source = img.string("@fixture.lua");
        proto.linedefined = 0;
        img.write_at(proto_ptr.address(), &proto);
        let main_fn = img.lua_closure(proto_ptr);

        let state_address = img.reserve::<LuaState>();
        let ci = img.call_info(
            main_fn,
            proto.code.at(1),
            CIST_LUA,
            RemotePtr::new(base_ci_address(state_address)),
        );
        let mut state: LuaState = unsafe { mem::zeroed() };
        state.ci = ci;
        state.l_G = global;
        img.write_at(state_address, &state);

        let frames = dump_stack(&img.mem, state_address).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].what, "main");
    }

    #[test]
    fn missing_line_info_yields_unknown_line() {
        let mut img = Image::new();
        let state_address = dump_fixture(&mut img);
        // strip the caller's line info
        let state = RemotePtr::<LuaState>::new(state_address)
            .read(&img.mem)
            .unwrap();
        let callee = state.ci.read(&img.mem).unwrap();
        let caller = callee.previous.read(&img.mem).unwrap();
        let func = caller.func.read(&img.mem).unwrap();
        let closure = func.gc().cast::<Closure>().read(&img.mem).unwrap();
        let proto_ptr = closure.lua().p;
        let mut proto = proto_ptr.read(&img.mem).unwrap();
        proto.lineinfo = RemotePtr::null();
        proto.sizelineinfo = 0;
        img.write_at(proto_ptr.address(), &proto);

        assert_eq!(current_line(&img.mem, &caller).unwrap(), -1);
    }

    #[test]
    fn vararg_info_for_lua_and_c_frames() {
        let mut img = Image::new();
        let state_address = dump_fixture(&mut img);
        let state = RemotePtr::<LuaState>::new(state_address)
            .read(&img.mem)
            .unwrap();
        let callee_ptr = state.ci;
        let caller_ptr = callee_ptr.read(&img.mem).unwrap().previous;

        let mut ar = LuaDebug {
            i_ci: callee_ptr,
            ..Default::default()
        };
        get_info(&img.mem, &state, "u", &mut ar).unwrap();
        assert_eq!(ar.nups, 2);
        assert_eq!(ar.nparams, 0);
        assert!(ar.isvararg);

        let mut ar = LuaDebug {
            i_ci: caller_ptr,
            ..Default::default()
        };
        get_info(&img.mem, &state, "u", &mut ar).unwrap();
        assert_eq!(ar.nups, 0);
        assert_eq!(ar.nparams, 0);
        assert!(!ar.isvararg);
    }

    #[test]
    fn function_form_inspects_the_value_below_top() {
        let mut img = Image::new();
        let global = img.global_state();
        let code = [encode_abc(OpCode::Return, 0, 1, 0)];
        let proto_ptr = img.proto(&code, &[], &[], &[]);
        let mut proto = proto_ptr.read(&img.mem).unwrap();
        proto.source = img.string("=loaded");
        proto.linedefined = 7;
        proto.lastlinedefined = 9;
        img.write_at(proto_ptr.address(), &proto);
        let func = img.lua_closure(proto_ptr);
        let slot = img.put(func);

        let mut state: LuaState = unsafe { mem::zeroed() };
        state.top = RemotePtr::new(slot + mem::size_of::<TValue>() as u64);
        state.l_G = global;

        let mut ar = LuaDebug::default();
        get_info(&img.mem, &state, ">S", &mut ar).unwrap();
        assert_eq!(ar.what, "Lua");
        assert_eq!(ar.source, "=loaded");
        assert_eq!(ar.short_src, "loaded");
        assert_eq!(ar.linedefined, 7);
    }

    #[test]
    fn non_function_frame_is_bad_state() {
        let mut img = Image::new();
        let global = img.global_state();
        let number = img.integer_value(3);
        let state_address = img.reserve::<LuaState>();
        let ci = img.call_info(
            number,
            RemotePtr::null(),
            0,
            RemotePtr::new(base_ci_address(state_address)),
        );
        let mut state: LuaState = unsafe { mem::zeroed() };
        state.ci = ci;
        state.l_G = global;
        img.write_at(state_address, &state);

        assert!(matches!(
            dump_stack(&img.mem, state_address),
            Err(Error::BadState(_))
        ));
    }

    #[test]
    fn unknown_option_is_rejected() {
        let mut img = Image::new();
        let state_address = dump_fixture(&mut img);
        let state = RemotePtr::<LuaState>::new(state_address)
            .read(&img.mem)
            .unwrap();

        let mut ar = LuaDebug {
            i_ci: state.ci,
            ..Default::default()
        };
        assert!(matches!(
            get_info(&img.mem, &state, "nSx", &mut ar),
            Err(Error::BadArgument(_))
        ));
    }
}
