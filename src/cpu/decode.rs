//! Instruction decoder.
//!
//! Every instruction occupies one word holding its opcode. Instructions
//! that take an operand read it from the following word of the same zone.

use crate::cpu::memory::Word;
use crate::cpu::mode::Mode;
use serde::{Serialize, Deserialize};
use thiserror::Error;

/// Reserved opcode. Halts in user mode, returns from interrupt otherwise.
pub const SENTINEL: Word = 0;

/// How a load or store forms its effective address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddrMode {
    /// `[operand]`
    Direct,
    /// `[[operand]]`
    Indirect,
    /// `[operand + X]`
    IndexedX,
    /// `[operand + Y]`
    IndexedY,
    /// `[SP + X]`, no operand
    StackX,
}

impl AddrMode {
    /// Whether the address calculation consumes an operand word.
    pub fn has_operand(self) -> bool {
        !matches!(self, AddrMode::StackX)
    }
}

/// Decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    // ==================== Data Transfer ====================

    /// AC := operand
    LoadImmediate,

    /// AC := [effective address]
    Load { mode: AddrMode },

    /// [operand] := AC
    Store,

    /// AC := random value in 0..10
    Random,

    /// Write AC to the port named by the operand
    Output,

    // ==================== Arithmetic ====================

    AddX,
    AddY,
    SubX,
    SubY,

    // ==================== Register Copies ====================

    CopyToX,
    CopyFromX,
    CopyToY,
    CopyFromY,
    CopyToSp,
    CopyFromSp,

    // ==================== Control Flow ====================

    /// PC := operand
    Jump,

    /// PC := operand if AC == 0
    JumpIfZero,

    /// PC := operand if AC != 0
    JumpIfNotZero,

    /// Push PC, then PC := operand
    Call,

    /// PC := pop
    Return,

    IncX,
    DecX,

    // ==================== Stack ====================

    Push,
    Pop,

    // ==================== Privilege ====================

    /// Enter the system-call handler
    Interrupt,

    /// Restore the saved frame and drop back to user mode
    InterruptReturn,

    /// Stop the CPU
    Halt,
}

impl Instruction {
    /// Look up an opcode without regard to mode.
    ///
    /// The sentinel is not in the table since its meaning depends on mode;
    /// see [`decode`].
    pub fn from_opcode(opcode: Word) -> Option<Self> {
        let instr = match opcode {
            1 => Instruction::LoadImmediate,
            2 => Instruction::Load { mode: AddrMode::Direct },
            3 => Instruction::Load { mode: AddrMode::Indirect },
            4 => Instruction::Load { mode: AddrMode::IndexedX },
            5 => Instruction::Load { mode: AddrMode::IndexedY },
            6 => Instruction::Load { mode: AddrMode::StackX },
            7 => Instruction::Store,
            8 => Instruction::Random,
            9 => Instruction::Output,
            10 => Instruction::AddX,
            11 => Instruction::AddY,
            12 => Instruction::SubX,
            13 => Instruction::SubY,
            14 => Instruction::CopyToX,
            15 => Instruction::CopyFromX,
            16 => Instruction::CopyToY,
            17 => Instruction::CopyFromY,
            18 => Instruction::CopyToSp,
            19 => Instruction::CopyFromSp,
            20 => Instruction::Jump,
            21 => Instruction::JumpIfZero,
            22 => Instruction::JumpIfNotZero,
            23 => Instruction::Call,
            24 => Instruction::Return,
            25 => Instruction::IncX,
            26 => Instruction::DecX,
            27 => Instruction::Push,
            28 => Instruction::Pop,
            29 => Instruction::Interrupt,
            30 => Instruction::InterruptReturn,
            50 => Instruction::Halt,
            _ => return None,
        };
        Some(instr)
    }

    /// The opcode that encodes this instruction.
    pub fn opcode(self) -> Word {
        match self {
            Instruction::LoadImmediate => 1,
            Instruction::Load { mode } => match mode {
                AddrMode::Direct => 2,
                AddrMode::Indirect => 3,
                AddrMode::IndexedX => 4,
                AddrMode::IndexedY => 5,
                AddrMode::StackX => 6,
            },
            Instruction::Store => 7,
            Instruction::Random => 8,
            Instruction::Output => 9,
            Instruction::AddX => 10,
            Instruction::AddY => 11,
            Instruction::SubX => 12,
            Instruction::SubY => 13,
            Instruction::CopyToX => 14,
            Instruction::CopyFromX => 15,
            Instruction::CopyToY => 16,
            Instruction::CopyFromY => 17,
            Instruction::CopyToSp => 18,
            Instruction::CopyFromSp => 19,
            Instruction::Jump => 20,
            Instruction::JumpIfZero => 21,
            Instruction::JumpIfNotZero => 22,
            Instruction::Call => 23,
            Instruction::Return => 24,
            Instruction::IncX => 25,
            Instruction::DecX => 26,
            Instruction::Push => 27,
            Instruction::Pop => 28,
            Instruction::Interrupt => 29,
            Instruction::InterruptReturn => 30,
            Instruction::Halt => 50,
        }
    }

    /// Whether the instruction reads an operand word after its opcode.
    pub fn has_operand(self) -> bool {
        match self {
            Instruction::Load { mode } => mode.has_operand(),
            Instruction::LoadImmediate
            | Instruction::Store
            | Instruction::Output
            | Instruction::Jump
            | Instruction::JumpIfZero
            | Instruction::JumpIfNotZero
            | Instruction::Call => true,
            _ => false,
        }
    }

    /// Short assembly-style name.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Instruction::LoadImmediate => "LDI",
            Instruction::Load { mode } => match mode {
                AddrMode::Direct => "LD",
                AddrMode::Indirect => "LDIND",
                AddrMode::IndexedX => "LDX",
                AddrMode::IndexedY => "LDY",
                AddrMode::StackX => "LDSPX",
            },
            Instruction::Store => "ST",
            Instruction::Random => "RND",
            Instruction::Output => "OUT",
            Instruction::AddX => "ADDX",
            Instruction::AddY => "ADDY",
            Instruction::SubX => "SUBX",
            Instruction::SubY => "SUBY",
            Instruction::CopyToX => "TAX",
            Instruction::CopyFromX => "TXA",
            Instruction::CopyToY => "TAY",
            Instruction::CopyFromY => "TYA",
            Instruction::CopyToSp => "TAS",
            Instruction::CopyFromSp => "TSA",
            Instruction::Jump => "JMP",
            Instruction::JumpIfZero => "JZ",
            Instruction::JumpIfNotZero => "JNZ",
            Instruction::Call => "CALL",
            Instruction::Return => "RET",
            Instruction::IncX => "INCX",
            Instruction::DecX => "DECX",
            Instruction::Push => "PUSH",
            Instruction::Pop => "POP",
            Instruction::Interrupt => "INT",
            Instruction::InterruptReturn => "IRET",
            Instruction::Halt => "HLT",
        }
    }
}

/// Decode an opcode fetched while running in `mode`.
pub fn decode(opcode: Word, mode: Mode) -> Result<Instruction, DecodeError> {
    if opcode == SENTINEL {
        return Ok(match mode {
            Mode::User => Instruction::Halt,
            Mode::TimerHandler | Mode::SystemCall => Instruction::InterruptReturn,
        });
    }

    Instruction::from_opcode(opcode).ok_or(DecodeError::UnknownOpcode(opcode))
}

/// Errors that can occur during instruction decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown instruction: {0}")]
    UnknownOpcode(Word),
}
