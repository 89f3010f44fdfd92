//! Program loading.
//!
//! This module provides:
//! - A parser for the line-oriented program format (text → memory image)
//! - A disassembler (memory image → readable listing)

pub mod disasm;
pub mod program;

pub use disasm::disassemble;
pub use program::{load_program, parse_program, LoadError, Program, Section, Segment};
