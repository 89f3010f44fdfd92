//! CPU emulation.
//!
//! - A 2000-cell memory image split into user, timer-handler and
//!   system-call zones
//! - 6 registers: PC, AC, SP, X, Y, IR
//! - 31 opcodes plus the mode-dependent sentinel 0
//! - A timer interrupt polled between user-mode instructions

pub mod decode;
pub mod diagnostic;
pub mod execute;
pub mod memory;
pub mod mode;
pub mod registers;

pub use decode::{AddrMode, DecodeError, Instruction};
pub use execute::{CpuState, Engine, EngineConfig, Fault, RunOutcome, Snapshot};
pub use memory::{Memory, MemoryError, Word};
pub use mode::Mode;
pub use registers::Registers;
