//! Disassembler.
//!
//! Renders loaded programs as an address-annotated listing.

use crate::cpu::decode::decode;
use crate::cpu::memory::Word;
use crate::cpu::mode::Mode;
use crate::loader::program::{Program, Segment};

/// Disassemble one instruction. `operand` is the following word, if any.
///
/// Returns the text and the number of words consumed.
pub fn disassemble_instruction(opcode: Word, operand: Option<Word>, mode: Mode) -> (String, usize) {
    match decode(opcode, mode) {
        Ok(instr) if instr.has_operand() => match operand {
            Some(value) => (format!("{} {}", instr.mnemonic(), value), 2),
            None => (format!("{} ???", instr.mnemonic()), 1),
        },
        Ok(instr) => (instr.mnemonic().to_string(), 1),
        Err(_) => (format!("DATA {}", opcode), 1),
    }
}

/// Disassemble a whole program, one section header per segment.
pub fn disassemble(program: &Program) -> String {
    let mut output = String::new();
    output.push_str("; privcpu listing\n");
    output.push_str("; ---------------\n");

    for segment in &program.segments {
        output.push('\n');
        output.push_str(&format!("; {} @ {}\n", segment.section, segment.start));
        disassemble_segment(segment, &mut output);
    }

    output
}

fn disassemble_segment(segment: &Segment, output: &mut String) {
    let mode = segment.section.mode();
    let mut i = 0;
    while i < segment.words.len() {
        let operand = segment.words.get(i + 1).copied();
        let (text, width) = disassemble_instruction(segment.words[i], operand, mode);
        let address = segment.start + i as Word;
        output.push_str(&format!("{:04}: {:<12} ; line {}\n", address, text, segment.lines[i]));
        i += width;
    }
}
