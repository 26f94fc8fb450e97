//! Lua 5.3 bytecode decoding.
//!
//! Instructions are 32 bits: OP in bits 0..6, A in 6..14, C in 14..23 and
//! B in 23..32. `Bx` fuses B and C (18 bits), `sBx` is `Bx` with an excess
//! bias, and `Ax` fuses A, B and C (26 bits). A 9-bit B or C operand whose
//! high bit (the K bit) is set indexes the constant table instead of a
//! register.

use crate::error::{Error, Result};
use crate::lua::objects::Instruction;
use num_enum::TryFromPrimitive;

#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum OpCode {
    Move,     /* A B    R(A) := R(B) */
    LoadK,    /* A Bx   R(A) := Kst(Bx) */
    LoadKx,   /* A      R(A) := Kst(extra arg) */
    LoadBool, /* A B C  R(A) := (Bool)B; if (C) pc++ */
    LoadNil,  /* A B    R(A), R(A+1), ..., R(A+B) := nil */
    GetUpval, /* A B    R(A) := UpValue[B] */
    GetTabUp, /* A B C  R(A) := UpValue[B][RK(C)] */
    GetTable, /* A B C  R(A) := R(B)[RK(C)] */
    SetTabUp, /* A B C  UpValue[A][RK(B)] := RK(C) */
    SetUpval, /* A B    UpValue[B] := R(A) */
    SetTable, /* A B C  R(A)[RK(B)] := RK(C) */
    NewTable, /* A B C  R(A) := {} (size = B,C) */
    Self_,    /* A B C  R(A+1) := R(B); R(A) := R(B)[RK(C)] */
    Add,      /* A B C  R(A) := RK(B) + RK(C) */
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,    /* A B    R(A) := -R(B) */
    BNot,   /* A B    R(A) := ~R(B) */
    Not,    /* A B    R(A) := not R(B) */
    Len,    /* A B    R(A) := length of R(B) */
    Concat, /* A B C  R(A) := R(B).. ... ..R(C) */
    Jmp,    /* A sBx  pc+=sBx; if (A) close upvalues >= R(A - 1) */
    Eq,     /* A B C  if ((RK(B) == RK(C)) ~= A) then pc++ */
    Lt,
    Le,
    Test,    /* A C    if not (R(A) <=> C) then pc++ */
    TestSet, /* A B C  if (R(B) <=> C) then R(A) := R(B) else pc++ */
    Call,    /* A B C  R(A), ... := R(A)(R(A+1), ... ,R(A+B-1)) */
    TailCall, /* A B C  return R(A)(R(A+1), ... ,R(A+B-1)) */
    Return,  /* A B    return R(A), ... ,R(A+B-2) */
    ForLoop,
    ForPrep,
    TForCall, /* A C    R(A+3), ... := R(A)(R(A+1), R(A+2)) */
    TForLoop,
    SetList,
    Closure, /* A Bx   R(A) := closure(KPROTO[Bx]) */
    Vararg,
    ExtraArg, /* Ax     extra (larger) argument for previous opcode */
}

const SIZE_OP: u32 = 6;
const SIZE_A: u32 = 8;
const SIZE_B: u32 = 9;
const SIZE_C: u32 = 9;
const SIZE_BX: u32 = SIZE_B + SIZE_C;
const SIZE_AX: u32 = SIZE_A + SIZE_B + SIZE_C;

const POS_OP: u32 = 0;
const POS_A: u32 = POS_OP + SIZE_OP;
const POS_C: u32 = POS_A + SIZE_A;
const POS_B: u32 = POS_C + SIZE_C;
const POS_BX: u32 = POS_C;
const POS_AX: u32 = POS_A;

pub const MAXARG_BX: i32 = (1 << SIZE_BX) - 1;
pub const MAXARG_SBX: i32 = MAXARG_BX >> 1;

const BITRK: i32 = 1 << (SIZE_B - 1);

fn getarg(i: Instruction, pos: u32, size: u32) -> i32 {
    ((i >> pos) & !(!0u32 << size)) as i32
}

/// Decodes the opcode field, failing on bytecode the VM could not have
/// produced.
pub fn get_opcode(i: Instruction) -> Result<OpCode> {
    let op = getarg(i, POS_OP, SIZE_OP) as u8;
    OpCode::try_from(op).map_err(|_| Error::BadState(format!("invalid opcode {}", op)))
}

pub fn getarg_a(i: Instruction) -> i32 {
    getarg(i, POS_A, SIZE_A)
}

pub fn getarg_b(i: Instruction) -> i32 {
    getarg(i, POS_B, SIZE_B)
}

pub fn getarg_c(i: Instruction) -> i32 {
    getarg(i, POS_C, SIZE_C)
}

pub fn getarg_bx(i: Instruction) -> i32 {
    getarg(i, POS_BX, SIZE_BX)
}

pub fn getarg_ax(i: Instruction) -> i32 {
    getarg(i, POS_AX, SIZE_AX)
}

pub fn getarg_sbx(i: Instruction) -> i32 {
    getarg_bx(i) - MAXARG_SBX
}

/// Determines if a B/C operand references the constant table.
pub fn is_k(x: i32) -> bool {
    x & BITRK != 0
}

/// Strips the K bit, yielding a constant-table index.
pub fn index_k(x: i32) -> i32 {
    x & !BITRK
}

/* operand kinds for the mode table */
const OP_ARG_N: u8 = 0; /* argument is not used */
const OP_ARG_U: u8 = 1; /* argument is used */
const OP_ARG_R: u8 = 2; /* argument is a register or a jump offset */
const OP_ARG_K: u8 = 3; /* argument is a constant or register/constant */

/* instruction formats */
const I_ABC: u8 = 0;
const I_ABX: u8 = 1;
const I_ASBX: u8 = 2;
const I_AX: u8 = 3;

const fn opmode(t: u8, a: u8, b: u8, c: u8, m: u8) -> u8 {
    t << 7 | a << 6 | b << 4 | c << 2 | m
}

/// The per-opcode mode table from the Lua 5.3 VM, bit 6 flagging opcodes
/// that write register A.
#[rustfmt::skip]
pub const OPMODES: [u8; 47] = [
    /*      T  A  B         C         mode      opcode    */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ABC),  /* Move */
    opmode(0, 1, OP_ARG_K, OP_ARG_N, I_ABX),  /* LoadK */
    opmode(0, 1, OP_ARG_N, OP_ARG_N, I_ABX),  /* LoadKx */
    opmode(0, 1, OP_ARG_U, OP_ARG_U, I_ABC),  /* LoadBool */
    opmode(0, 1, OP_ARG_U, OP_ARG_N, I_ABC),  /* LoadNil */
    opmode(0, 1, OP_ARG_U, OP_ARG_N, I_ABC),  /* GetUpval */
    opmode(0, 1, OP_ARG_U, OP_ARG_K, I_ABC),  /* GetTabUp */
    opmode(0, 1, OP_ARG_R, OP_ARG_K, I_ABC),  /* GetTable */
    opmode(0, 0, OP_ARG_K, OP_ARG_K, I_ABC),  /* SetTabUp */
    opmode(0, 0, OP_ARG_U, OP_ARG_N, I_ABC),  /* SetUpval */
    opmode(0, 0, OP_ARG_K, OP_ARG_K, I_ABC),  /* SetTable */
    opmode(0, 1, OP_ARG_U, OP_ARG_U, I_ABC),  /* NewTable */
    opmode(0, 1, OP_ARG_R, OP_ARG_K, I_ABC),  /* Self_ */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Add */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Sub */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Mul */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Mod */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Pow */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Div */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* IDiv */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* BAnd */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* BOr */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* BXor */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Shl */
    opmode(0, 1, OP_ARG_K, OP_ARG_K, I_ABC),  /* Shr */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ABC),  /* Unm */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ABC),  /* BNot */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ABC),  /* Not */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ABC),  /* Len */
    opmode(0, 1, OP_ARG_R, OP_ARG_R, I_ABC),  /* Concat */
    opmode(0, 0, OP_ARG_R, OP_ARG_N, I_ASBX), /* Jmp */
    opmode(1, 0, OP_ARG_K, OP_ARG_K, I_ABC),  /* Eq */
    opmode(1, 0, OP_ARG_K, OP_ARG_K, I_ABC),  /* Lt */
    opmode(1, 0, OP_ARG_K, OP_ARG_K, I_ABC),  /* Le */
    opmode(1, 0, OP_ARG_N, OP_ARG_U, I_ABC),  /* Test */
    opmode(1, 1, OP_ARG_R, OP_ARG_U, I_ABC),  /* TestSet */
    opmode(0, 1, OP_ARG_U, OP_ARG_U, I_ABC),  /* Call */
    opmode(0, 1, OP_ARG_U, OP_ARG_U, I_ABC),  /* TailCall */
    opmode(0, 0, OP_ARG_U, OP_ARG_N, I_ABC),  /* Return */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ASBX), /* ForLoop */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ASBX), /* ForPrep */
    opmode(0, 0, OP_ARG_N, OP_ARG_U, I_ABC),  /* TForCall */
    opmode(0, 1, OP_ARG_R, OP_ARG_N, I_ASBX), /* TForLoop */
    opmode(0, 0, OP_ARG_U, OP_ARG_U, I_ABC),  /* SetList */
    opmode(0, 1, OP_ARG_U, OP_ARG_N, I_ABX),  /* Closure */
    opmode(0, 1, OP_ARG_U, OP_ARG_N, I_ABC),  /* Vararg */
    opmode(0, 0, OP_ARG_U, OP_ARG_U, I_AX),   /* ExtraArg */
];

/// Determines if `op` writes register A, per the mode table.
pub fn test_a_mode(op: OpCode) -> bool {
    OPMODES[op as usize] & (1 << 6) != 0
}

#[cfg(test)]
pub(crate) fn encode_abc(op: OpCode, a: i32, b: i32, c: i32) -> Instruction {
    op as Instruction | (a as Instruction) << POS_A | (b as Instruction) << POS_B
        | (c as Instruction) << POS_C
}

#[cfg(test)]
pub(crate) fn encode_abx(op: OpCode, a: i32, bx: i32) -> Instruction {
    op as Instruction | (a as Instruction) << POS_A | (bx as Instruction) << POS_BX
}

#[cfg(test)]
pub(crate) fn encode_asbx(op: OpCode, a: i32, sbx: i32) -> Instruction {
    encode_abx(op, a, sbx + MAXARG_SBX)
}

#[cfg(test)]
pub(crate) fn rk_constant(index: i32) -> i32 {
    index | BITRK
}
