//! # privcpu
//!
//! A single-threaded virtual CPU with three privilege modes: user code, a
//! timer interrupt handler and a system-call handler.
//!
//! Programs are plain text, one number per line. The engine runs the user
//! program, drops into the timer handler every N user instructions and
//! enters the system-call handler on `INT`. Faults end the run with a
//! structured result and can be turned into a small program that prints
//! the fault message.

pub mod cpu;
pub mod loader;

// Re-export commonly used types
pub use cpu::{CpuState, Engine, EngineConfig, Fault, Instruction, Memory, Mode, Registers, RunOutcome, Word};
pub use loader::{disassemble, load_program, parse_program, LoadError, Program};
