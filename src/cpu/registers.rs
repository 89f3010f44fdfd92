//! CPU registers.
//!
//! Six integer registers:
//! - PC: next fetch offset, relative to the current mode's code base
//! - AC: accumulator
//! - SP: number of words on the current stack (never a raw address)
//! - X, Y: general purpose
//! - IR: last fetched opcode, kept for diagnostics

use crate::cpu::memory::Word;
use serde::{Serialize, Deserialize};

/// The register file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub pc: Word,
    pub ac: Word,
    pub sp: Word,
    pub x: Word,
    pub y: Word,
    pub ir: Word,
}

impl Registers {
    /// Create a new register file with all values zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset all registers to zero.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Increment the program counter by 1.
    pub fn advance_pc(&mut self) {
        self.pc = self.pc.wrapping_add(1);
    }
}
