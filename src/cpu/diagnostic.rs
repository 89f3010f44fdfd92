//! Diagnostic programs.
//!
//! After a fault the image can be replaced with a tiny user program that
//! prints the fault message one character at a time and halts.

use crate::cpu::decode::Instruction;
use crate::cpu::memory::{Memory, MemoryError, Word};

/// Port number that prints AC as a character.
const CHAR_PORT: Word = 2;

/// Encode `message` as `LDI c; OUT 2` pairs followed by a halt.
pub fn encode_message(message: &str) -> Vec<Word> {
    let mut program = Vec::with_capacity(message.chars().count() * 4 + 1);
    for c in message.chars() {
        program.extend_from_slice(&[
            Instruction::LoadImmediate.opcode(),
            c as Word,
            Instruction::Output.opcode(),
            CHAR_PORT,
        ]);
    }
    program.push(Instruction::Halt.opcode());
    program
}

/// Clear `mem` and write the diagnostic program for `message` at address 0.
pub fn stage(mem: &mut Memory, message: &str) -> Result<(), MemoryError> {
    mem.reset();
    mem.load(0, &encode_message(message))
}
