//! Execution engine.
//!
//! Implements the fetch-decode-execute cycle, the privilege-mode state
//! machine, per-zone stacks and fault reporting.

use crate::cpu::decode::{self, AddrMode, DecodeError, Instruction};
use crate::cpu::diagnostic;
use crate::cpu::memory::{Memory, MemoryError, Word};
use crate::cpu::mode::Mode;
use crate::cpu::Registers;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Serialize, Deserialize};
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Number of words saved on handler entry: SP, PC, AC, X, Y.
pub const FRAME_LEN: Word = 5;

/// Interrupt interval used by [`EngineConfig::default`].
pub const DEFAULT_INTERRUPT_INTERVAL: u32 = 100;

/// Output port that prints AC as a decimal number. Any other port prints a
/// character.
pub const NUMBER_PORT: Word = 1;

/// Exclusive upper bound of the random-value instruction.
const RANDOM_RANGE: Word = 10;

/// CPU execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuState {
    /// CPU is running normally.
    Running,
    /// CPU has halted.
    Halted,
    /// A fault ended the run.
    Faulted,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// User-mode instructions retired between timer interrupts.
    pub interrupt_interval: u32,
    /// Seed for the random-value instruction. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
    /// Replace the image with a diagnostic program when a run faults.
    pub stage_diagnostics: bool,
    /// Stop after this many retired instructions.
    pub max_steps: Option<u64>,
}

impl EngineConfig {
    pub fn new(interrupt_interval: u32) -> Self {
        Self {
            interrupt_interval,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            interrupt_interval: DEFAULT_INTERRUPT_INTERVAL,
            rng_seed: None,
            stage_diagnostics: true,
            max_steps: None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// A halt instruction (or the user-mode sentinel) stopped the CPU.
    Halted { retired: u64 },
    /// An unrecovered fault stopped the CPU.
    Faulted { fault: Fault, retired: u64 },
    /// The configured step budget ran out.
    StepLimit { retired: u64 },
}

impl RunOutcome {
    pub fn retired(&self) -> u64 {
        match self {
            RunOutcome::Halted { retired }
            | RunOutcome::Faulted { retired, .. }
            | RunOutcome::StepLimit { retired } => *retired,
        }
    }

    pub fn fault(&self) -> Option<&Fault> {
        match self {
            RunOutcome::Faulted { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// Result of effective-address resolution.
///
/// Outer addresses that violate the zone ceiling fail outright. The inner
/// address of an indirect load is different: the violation is reported as
/// `Recovered`, the diagnostic program is staged on the spot and the load
/// still goes ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolved {
    Address(Word),
    Recovered { address: Word, fault: Fault },
}

/// Serializable view of the engine state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub regs: Registers,
    pub mode: Mode,
    pub state: CpuState,
    pub retired: u64,
    pub timer_counter: u32,
    pub last_instruction: Option<Instruction>,
    pub recovered: Vec<Fault>,
    /// `(address, value)` of each word on the current stack.
    pub stack: Vec<(usize, Word)>,
}

/// The virtual CPU.
///
/// Owns the register file and memory image for the duration of a run.
/// Generic over the sink that receives output-port writes.
pub struct Engine<W: Write = io::Stdout> {
    /// CPU registers.
    pub regs: Registers,
    /// Main memory.
    pub mem: Memory,
    /// Current privilege mode.
    pub mode: Mode,
    /// Current execution state.
    pub state: CpuState,
    /// Instructions retired since the run started.
    pub retired: u64,
    /// User-mode instructions since the last timer interrupt.
    counter: u32,
    config: EngineConfig,
    rng: StdRng,
    out: W,
    last_instr: Option<Instruction>,
    recovered: Vec<Fault>,
}

impl Engine<io::Stdout> {
    /// Create an engine that writes port output to stdout.
    pub fn new(mem: Memory, config: EngineConfig) -> Self {
        Self::with_output(mem, config, io::stdout())
    }
}

impl<W: Write> Engine<W> {
    /// Create an engine writing port output to `out`.
    pub fn with_output(mem: Memory, config: EngineConfig, out: W) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            regs: Registers::new(),
            mem,
            mode: Mode::User,
            state: CpuState::Running,
            retired: 0,
            counter: 0,
            config,
            rng,
            out,
            last_instr: None,
            recovered: Vec::new(),
        }
    }

    /// The output sink.
    pub fn output(&self) -> &W {
        &self.out
    }

    /// Consume the engine and return the output sink.
    pub fn into_output(self) -> W {
        self.out
    }

    /// Faults that were handled in place during the run.
    pub fn recovered_faults(&self) -> &[Fault] {
        &self.recovered
    }

    /// Get the last executed instruction.
    pub fn last_instruction(&self) -> Option<Instruction> {
        self.last_instr
    }

    pub fn is_running(&self) -> bool {
        self.state == CpuState::Running
    }

    pub fn is_halted(&self) -> bool {
        self.state == CpuState::Halted
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            regs: self.regs,
            mode: self.mode,
            state: self.state,
            retired: self.retired,
            timer_counter: self.counter,
            last_instruction: self.last_instr,
            recovered: self.recovered.clone(),
            stack: self.stack_contents(),
        }
    }

    /// Start from the top of the user program and run to completion.
    ///
    /// Registers are zeroed and the mode is set to user; memory is left as
    /// loaded.
    pub fn run(&mut self) -> RunOutcome {
        self.regs.reset();
        self.mode = Mode::User;
        self.state = CpuState::Running;
        self.retired = 0;
        self.counter = 0;
        self.last_instr = None;
        self.recovered.clear();

        self.resume()
    }

    /// Keep running from the current state until halt, fault or step limit.
    pub fn resume(&mut self) -> RunOutcome {
        let start = self.retired;

        while self.state == CpuState::Running {
            if let Some(max) = self.config.max_steps {
                if self.retired - start >= max {
                    info!(retired = self.retired, "step limit reached");
                    self.flush();
                    return RunOutcome::StepLimit { retired: self.retired };
                }
            }

            if let Err(fault) = self.step() {
                return self.abort(fault);
            }
        }

        info!(retired = self.retired, "halted");
        self.flush();
        RunOutcome::Halted { retired: self.retired }
    }

    /// Execute a single instruction, then poll the timer.
    ///
    /// Returns the instruction that was executed, or the fault that stopped
    /// it. A fault leaves the engine state as it was at the point of failure.
    pub fn step(&mut self) -> Result<Instruction, Fault> {
        if self.state != CpuState::Running {
            return Err(Fault::NotRunning(self.state));
        }

        // Fetch
        let mode = self.mode;
        let pc = self.regs.pc;
        let opcode = self.fetch().map_err(|err| match err {
            MemoryError::OutOfBounds(address) => Fault::FetchOutOfBounds { address },
            other => Fault::Memory(other),
        })?;
        self.regs.ir = opcode;

        // Decode
        let instr = decode::decode(opcode, self.mode)?;

        // Execute
        self.execute(instr)?;

        trace!(
            %mode,
            pc,
            op = instr.mnemonic(),
            ac = self.regs.ac,
            x = self.regs.x,
            y = self.regs.y,
            sp = self.regs.sp,
            "retired"
        );
        self.retired += 1;
        self.last_instr = Some(instr);

        if !mode.is_privileged() {
            self.poll_timer()?;
        }

        Ok(instr)
    }

    /// Replace the image with a program that prints `fault` and halts.
    ///
    /// PC and mode point at the new program; nothing is executed.
    pub fn stage_diagnostic(&mut self, fault: &Fault) -> Result<(), MemoryError> {
        diagnostic::stage(&mut self.mem, &fault.to_string())?;
        self.regs.pc = 0;
        self.mode = Mode::User;
        Ok(())
    }

    /// Push onto the current mode's stack.
    pub fn push(&mut self, value: Word) -> Result<(), Fault> {
        if self.mode.stack_full(self.regs.pc, self.regs.sp) {
            return Err(Fault::StackOverflow);
        }

        let address = self.stack_slot(self.regs.sp)?;
        let opcode = self.regs.ir;
        self.mem
            .write(address, value)
            .map_err(|err| Fault::memory(opcode, err))?;
        self.regs.sp = self.regs.sp.wrapping_add(1);
        Ok(())
    }

    /// Pop from the current mode's stack.
    pub fn pop(&mut self) -> Result<Word, Fault> {
        if self.regs.sp <= 0 {
            return Err(Fault::StackEmpty);
        }

        let address = self.stack_slot(self.regs.sp - 1)?;
        self.regs.sp -= 1;
        self.mem
            .read(address)
            .map_err(|err| Fault::memory(self.regs.ir, err))
    }

    /// Address of the slot `depth` words below the current stack top.
    ///
    /// SP is writable from AC, so the slot can land outside the stack zone.
    /// That is an access violation rather than a write into another zone.
    fn stack_slot(&self, depth: Word) -> Result<Word, Fault> {
        let address = self.mode.stack_top().wrapping_sub(depth);
        if self.mode.stack_zone().contains(&address) {
            Ok(address)
        } else {
            Err(Fault::InvalidAccess {
                opcode: self.regs.ir,
                address,
            })
        }
    }

    /// Live words on the current stack, deepest first.
    fn stack_contents(&self) -> Vec<(usize, Word)> {
        let depth = usize::try_from(self.regs.sp).unwrap_or(0);
        let top = usize::try_from(self.mode.stack_top()).unwrap_or(0);
        let depth = depth.min(top + 1);
        self.mem.dump(top + 1 - depth, depth)
    }

    /// Restore the saved frame and return to user mode.
    pub fn return_from_interrupt(&mut self) -> Result<(), Fault> {
        if !self.mode.is_privileged() {
            return Err(Fault::IllegalPrivilegedReturn);
        }

        // Discard anything the handler left above its frame.
        self.regs.sp = FRAME_LEN;
        let y = self.pop()?;
        let x = self.pop()?;
        let ac = self.pop()?;
        let pc = self.pop()?;
        let sp = self.pop()?;

        debug!(from = %self.mode, pc, sp, "returning to user mode");
        self.regs = Registers { pc, ac, sp, x, y, ..self.regs };
        self.mode = Mode::User;
        Ok(())
    }

    /// Switch to a handler mode, saving SP, PC, AC, X and Y.
    ///
    /// SP always restarts at 0 on the shared privileged stack, so entering a
    /// handler from another handler overwrites the outer frame.
    fn enter_handler(&mut self, target: Mode) -> Result<(), Fault> {
        let Registers { pc, ac, sp, x, y, .. } = self.regs;
        debug!(from = %self.mode, to = %target, pc, sp, "entering handler");

        self.mode = target;
        self.regs.sp = 0;
        self.push(sp)?;
        self.push(pc)?;
        self.regs.pc = 0;
        self.push(ac)?;
        self.push(x)?;
        self.push(y)?;
        Ok(())
    }

    /// Count a retired user-mode instruction and fire the timer when due.
    ///
    /// Instructions that leave user mode (`INT`) or were fetched in a handler
    /// (including the return to user mode) do not count.
    fn poll_timer(&mut self) -> Result<(), Fault> {
        if self.mode != Mode::User || self.state != CpuState::Running {
            return Ok(());
        }

        self.counter = self.counter.saturating_add(1);
        if self.counter >= self.config.interrupt_interval {
            self.counter = 0;
            self.enter_handler(Mode::TimerHandler)?;
        }
        Ok(())
    }

    /// Read the word at PC in the current zone and advance PC.
    fn fetch(&mut self) -> Result<Word, MemoryError> {
        let address = self.mode.code_base().wrapping_add(self.regs.pc);
        self.regs.advance_pc();
        self.mem.read(address)
    }

    fn operand(&mut self) -> Result<Word, Fault> {
        let opcode = self.regs.ir;
        self.fetch().map_err(|err| Fault::memory(opcode, err))
    }

    /// Reject addresses above the current mode's data ceiling.
    fn check_zone(&self, address: Word) -> Result<Word, Fault> {
        match self.mode.data_ceiling() {
            Some(ceiling) if address > ceiling => Err(Fault::InvalidAccess {
                opcode: self.regs.ir,
                address,
            }),
            _ => Ok(address),
        }
    }

    fn resolve(&mut self, mode: AddrMode) -> Result<Resolved, Fault> {
        let address = match mode {
            AddrMode::Direct => self.operand()?,
            AddrMode::IndexedX => self.operand()?.wrapping_add(self.regs.x),
            AddrMode::IndexedY => self.operand()?.wrapping_add(self.regs.y),
            AddrMode::StackX => self.regs.sp.wrapping_add(self.regs.x),
            AddrMode::Indirect => {
                let pointer = self.operand()?;
                let pointer = self.check_zone(pointer)?;
                let inner = self
                    .mem
                    .read(pointer)
                    .map_err(|err| Fault::memory(self.regs.ir, err))?;
                return Ok(match self.check_zone(inner) {
                    Ok(address) => Resolved::Address(address),
                    Err(fault) => Resolved::Recovered { address: inner, fault },
                });
            }
        };

        self.check_zone(address).map(Resolved::Address)
    }

    fn load(&mut self, mode: AddrMode) -> Result<Word, Fault> {
        let address = match self.resolve(mode)? {
            Resolved::Address(address) => address,
            Resolved::Recovered { address, fault } => {
                warn!(%fault, "recovering in place");
                self.stage_diagnostic(&fault)?;
                self.recovered.push(fault);
                address
            }
        };

        self.mem
            .read(address)
            .map_err(|err| Fault::memory(self.regs.ir, err))
    }

    fn write_port(&mut self, port: Word) -> Result<(), Fault> {
        let ac = self.regs.ac;
        let written = if port == NUMBER_PORT {
            writeln!(self.out, "{}", ac)
        } else {
            let c = u32::try_from(ac)
                .ok()
                .and_then(char::from_u32)
                .unwrap_or(char::REPLACEMENT_CHARACTER);
            write!(self.out, "{}", c)
        };
        written.map_err(|err| Fault::Output(err.to_string()))
    }

    fn flush(&mut self) {
        if let Err(err) = self.out.flush() {
            warn!(%err, "failed to flush output");
        }
    }

    /// Terminal fault handling: mark the run faulted and, if configured,
    /// stage the diagnostic image. The diagnostic is never executed here.
    fn abort(&mut self, fault: Fault) -> RunOutcome {
        warn!(%fault, mode = %self.mode, pc = self.regs.pc, "run faulted");
        self.state = CpuState::Faulted;

        if self.config.stage_diagnostics {
            if let Err(err) = self.stage_diagnostic(&fault) {
                warn!(%err, "could not stage diagnostic program");
            }
        }

        self.flush();
        RunOutcome::Faulted { fault, retired: self.retired }
    }

    /// Execute a decoded instruction.
    fn execute(&mut self, instr: Instruction) -> Result<(), Fault> {
        match instr {
            // ==================== Data Transfer ====================

            Instruction::LoadImmediate => {
                self.regs.ac = self.operand()?;
            }

            Instruction::Load { mode } => {
                self.regs.ac = self.load(mode)?;
            }

            Instruction::Store => {
                let address = self.operand()?;
                let address = self.check_zone(address)?;
                let opcode = self.regs.ir;
                self.mem
                    .write(address, self.regs.ac)
                    .map_err(|err| Fault::memory(opcode, err))?;
            }

            Instruction::Random => {
                self.regs.ac = self.rng.gen_range(0..RANDOM_RANGE);
            }

            Instruction::Output => {
                let port = self.operand()?;
                self.write_port(port)?;
            }

            // ==================== Arithmetic ====================

            Instruction::AddX => self.regs.ac = self.regs.ac.wrapping_add(self.regs.x),
            Instruction::AddY => self.regs.ac = self.regs.ac.wrapping_add(self.regs.y),
            Instruction::SubX => self.regs.ac = self.regs.ac.wrapping_sub(self.regs.x),
            Instruction::SubY => self.regs.ac = self.regs.ac.wrapping_sub(self.regs.y),

            // ==================== Register Copies ====================

            Instruction::CopyToX => self.regs.x = self.regs.ac,
            Instruction::CopyFromX => self.regs.ac = self.regs.x,
            Instruction::CopyToY => self.regs.y = self.regs.ac,
            Instruction::CopyFromY => self.regs.ac = self.regs.y,
            Instruction::CopyToSp => self.regs.sp = self.regs.ac,
            Instruction::CopyFromSp => self.regs.ac = self.regs.sp,

            // ==================== Control Flow ====================

            Instruction::Jump => {
                self.regs.pc = self.operand()?;
            }

            Instruction::JumpIfZero => {
                let target = self.operand()?;
                if self.regs.ac == 0 {
                    self.regs.pc = target;
                }
            }

            Instruction::JumpIfNotZero => {
                let target = self.operand()?;
                if self.regs.ac != 0 {
                    self.regs.pc = target;
                }
            }

            Instruction::Call => {
                let target = self.operand()?;
                self.push(self.regs.pc)?;
                self.regs.pc = target;
            }

            Instruction::Return => {
                self.regs.pc = self.pop()?;
            }

            Instruction::IncX => self.regs.x = self.regs.x.wrapping_add(1),
            Instruction::DecX => self.regs.x = self.regs.x.wrapping_sub(1),

            // ==================== Stack ====================

            Instruction::Push => {
                self.push(self.regs.ac)?;
            }

            Instruction::Pop => {
                self.regs.ac = self.pop()?;
            }

            // ==================== Privilege ====================

            Instruction::Interrupt => {
                self.enter_handler(Mode::SystemCall)?;
            }

            Instruction::InterruptReturn => {
                self.return_from_interrupt()?;
            }

            Instruction::Halt => {
                self.state = CpuState::Halted;
            }
        }

        Ok(())
    }
}

impl<W: Write> std::fmt::Debug for Engine<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("retired", &self.retired)
            .field("regs", &self.regs)
            .finish()
    }
}

/// Faults raised while executing.
///
/// The `Display` text is what the diagnostic program prints.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum Fault {
    #[error("CPU not running: {0:?}")]
    NotRunning(CpuState),

    #[error("Index out of bound when access memory")]
    FetchOutOfBounds { address: Word },

    #[error("Index out of bound when access memory-Error in command id : {opcode} index out of range")]
    OutOfBounds { opcode: Word, address: Word },

    #[error("Error in command id : {opcode} invalid access to memory")]
    InvalidAccess { opcode: Word, address: Word },

    #[error("Stack is empty")]
    StackEmpty,

    #[error("Stack is full")]
    StackOverflow,

    #[error("Can not call IRet when user mode")]
    IllegalPrivilegedReturn,

    #[error("Unknown instruction: {opcode}")]
    UnknownInstruction { opcode: Word },

    #[error("memory error: {0}")]
    Memory(MemoryError),

    #[error("failed to write output: {0}")]
    Output(String),
}

impl Fault {
    /// Tag a memory error with the opcode that caused it.
    fn memory(opcode: Word, err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfBounds(address) => Fault::OutOfBounds { opcode, address },
            other => Fault::Memory(other),
        }
    }
}

impl From<DecodeError> for Fault {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::UnknownOpcode(opcode) => Fault::UnknownInstruction { opcode },
        }
    }
}

impl From<MemoryError> for Fault {
    fn from(err: MemoryError) -> Self {
        Fault::Memory(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::memory::{BOTTOM_SYSTEM, BOTTOM_USER, TOP_SYSTEM, TOP_TIMER};
    use proptest::prelude::*;

    fn config(interval: u32) -> EngineConfig {
        EngineConfig {
            interrupt_interval: interval,
            rng_seed: Some(7),
            ..EngineConfig::default()
        }
    }

    fn engine_with(program: &[Word], interval: u32) -> Engine<Vec<u8>> {
        let mut mem = Memory::new();
        mem.load(0, program).unwrap();
        Engine::with_output(mem, config(interval), Vec::new())
    }

    fn engine(program: &[Word]) -> Engine<Vec<u8>> {
        engine_with(program, 1000)
    }

    fn output(engine: &Engine<Vec<u8>>) -> String {
        String::from_utf8(engine.output().clone()).unwrap()
    }

    #[test]
    fn test_halt_only() {
        let mut cpu = engine(&[50]);

        let outcome = cpu.run();

        assert_eq!(outcome, RunOutcome::Halted { retired: 1 });
        assert!(cpu.is_halted());
        assert_eq!(Registers { ir: 0, ..cpu.regs }, Registers { pc: 1, ..Registers::new() });
    }

    #[test]
    fn test_add_and_print() {
        let mut cpu = engine(&[1, 5, 14, 10, 9, 1, 50]);

        cpu.run();

        assert_eq!(output(&cpu), "10\n");
        assert_eq!(cpu.regs.ac, 10);
        assert_eq!(cpu.regs.x, 5);
    }

    #[test]
    fn test_output_character_port() {
        let mut cpu = engine(&[1, 72, 9, 2, 1, 105, 9, 7, 50]);
        cpu.run();
        assert_eq!(output(&cpu), "Hi");
    }

    #[test]
    fn test_user_sentinel_halts() {
        let mut cpu = engine(&[1, 3]);
        assert!(matches!(cpu.run(), RunOutcome::Halted { retired: 2 }));
        assert_eq!(cpu.regs.ac, 3);
    }

    #[test]
    fn test_arithmetic_and_copies() {
        // AC=7 -> Y, AC=2 -> X, AC=Y, AC-=X, DECX, AC+=X
        let mut cpu = engine(&[1, 7, 16, 1, 2, 14, 17, 12, 26, 10, 50]);
        cpu.run();
        assert_eq!(cpu.regs.ac, 6);
        assert_eq!(cpu.regs.x, 1);
        assert_eq!(cpu.regs.y, 7);
    }

    #[test]
    fn test_conditional_jumps() {
        // AC=0; JZ 6 (taken); HLT; at 6: JNZ 0 (not taken); LDI 9; HLT
        let mut cpu = engine(&[1, 0, 21, 6, 50, 50, 22, 0, 1, 9, 50]);
        cpu.run();
        assert_eq!(cpu.regs.ac, 9);
        assert_eq!(cpu.retired, 5);
    }

    #[test]
    fn test_load_addressing_modes() {
        let mut cpu = engine(&[
            2, 100, 14, // AC=[100]=3, X=3
            1, 1, 16, // Y=1
            4, 100, 7, 200, // AC=[103]=40, [200]=AC
            5, 101, 16, // AC=[102]=30, Y=30
            3, 104, // AC=[[104]]=[200]=40
            50,
        ]);
        cpu.mem.load(100, &[3, 20, 30, 40, 200]).unwrap();

        cpu.run();

        assert_eq!(cpu.mem.read(200).unwrap(), 40);
        assert_eq!(cpu.regs.y, 30);
        assert_eq!(cpu.regs.ac, 40);
    }

    #[test]
    fn test_load_stack_indexed_uses_raw_address() {
        let mut cpu = engine(&[1, 20, 18, 1, 3, 14, 6, 50]);
        cpu.mem.write(23, 77).unwrap();
        cpu.run();
        assert_eq!(cpu.regs.ac, 77);
    }

    #[test]
    fn test_random_stays_in_range() {
        let mut cpu = engine(&[8; 64]);
        for _ in 0..64 {
            cpu.step().unwrap();
            assert!((0..RANDOM_RANGE).contains(&cpu.regs.ac));
        }
    }

    #[test]
    fn test_random_is_reproducible_with_seed() {
        let program = [8, 14, 8, 16, 8, 50];
        let mut a = engine(&program);
        let mut b = engine(&program);
        a.run();
        b.run();
        assert_eq!(a.regs, b.regs);
    }

    #[test]
    fn test_call_and_return() {
        let mut cpu = engine(&[23, 5, 50, 0, 0, 24]);

        cpu.step().unwrap();
        assert_eq!((cpu.regs.pc, cpu.regs.sp), (5, 1));
        assert_eq!(cpu.mem.read(BOTTOM_USER).unwrap(), 2);

        cpu.step().unwrap();
        assert_eq!((cpu.regs.pc, cpu.regs.sp), (2, 0));
    }

    #[test]
    fn test_outer_address_above_user_zone_faults() {
        let mut cpu = engine(&[2, 1000, 50]);

        let outcome = cpu.run();

        assert_eq!(
            outcome.fault(),
            Some(&Fault::InvalidAccess { opcode: 2, address: 1000 })
        );
        assert_eq!(cpu.state, CpuState::Faulted);
    }

    #[test]
    fn test_store_above_user_zone_does_not_write() {
        let mut cpu = engine(&[1, 9, 7, TOP_TIMER, 50]);
        cpu.config.stage_diagnostics = false;

        let outcome = cpu.run();

        assert_eq!(
            outcome.fault(),
            Some(&Fault::InvalidAccess { opcode: 7, address: TOP_TIMER })
        );
        assert_eq!(cpu.mem.read(TOP_TIMER).unwrap(), 0);
    }

    #[test]
    fn test_handler_may_touch_any_address() {
        let mut cpu = engine(&[29, 50]);
        cpu.mem.load(TOP_SYSTEM, &[2, BOTTOM_SYSTEM - 10, 30]).unwrap();
        cpu.mem.write(BOTTOM_SYSTEM - 10, 12).unwrap();

        cpu.step().unwrap();
        cpu.step().unwrap();

        assert_eq!(cpu.mode, Mode::SystemCall);
        assert_eq!(cpu.regs.ac, 12);
    }

    #[test]
    fn test_indirect_inner_violation_recovers_in_place() {
        let mut cpu = engine(&[3, 50, 50]);
        cpu.mem.write(50, 1200).unwrap();

        let outcome = cpu.run();

        let expected = Fault::InvalidAccess { opcode: 3, address: 1200 };
        assert!(matches!(outcome, RunOutcome::Halted { .. }));
        assert_eq!(cpu.recovered_faults(), &[expected.clone()]);
        assert_eq!(output(&cpu), expected.to_string());
    }

    #[test]
    fn test_indirect_outer_violation_propagates() {
        let mut cpu = engine(&[3, 1200, 50]);
        let outcome = cpu.run();
        assert_eq!(
            outcome.fault(),
            Some(&Fault::InvalidAccess { opcode: 3, address: 1200 })
        );
        assert!(cpu.recovered_faults().is_empty());
    }

    #[test]
    fn test_unknown_instruction_faults() {
        let mut cpu = engine(&[1, 1, 42]);
        let outcome = cpu.run();
        assert_eq!(outcome.fault(), Some(&Fault::UnknownInstruction { opcode: 42 }));
        assert_eq!(outcome.retired(), 1);
    }

    #[test]
    fn test_fault_stages_diagnostic_without_running_it() {
        let mut cpu = engine(&[28]);

        let outcome = cpu.run();

        assert_eq!(outcome.fault(), Some(&Fault::StackEmpty));
        assert_eq!(cpu.mem.read(0).unwrap(), 1);
        assert_eq!(cpu.mem.read(1).unwrap(), 'S' as Word);
        assert_eq!(cpu.regs.pc, 0);
        assert_eq!(cpu.mode, Mode::User);
        assert!(output(&cpu).is_empty());

        // Re-running executes the staged program.
        assert!(matches!(cpu.run(), RunOutcome::Halted { .. }));
        assert_eq!(output(&cpu), "Stack is empty");
    }

    #[test]
    fn test_fault_without_staging_keeps_image() {
        let mut cpu = engine(&[28]);
        cpu.config.stage_diagnostics = false;

        cpu.run();

        assert_eq!(cpu.mem.read(0).unwrap(), 28);
        assert_eq!(cpu.step(), Err(Fault::NotRunning(CpuState::Faulted)));
    }

    #[test]
    fn test_fetch_past_capacity() {
        let mut cpu = Engine::with_output(Memory::with_capacity(2), config(1000), Vec::new());
        cpu.mem.load(0, &[25, 25]).unwrap();
        assert_eq!(cpu.run().fault(), Some(&Fault::FetchOutOfBounds { address: 2 }));
    }

    #[test]
    fn test_pop_on_empty_stack() {
        let mut cpu = engine(&[]);
        assert_eq!(cpu.pop(), Err(Fault::StackEmpty));
        assert_eq!(cpu.regs.sp, 0);
    }

    #[test]
    fn test_iret_in_user_mode_leaves_registers() {
        let mut cpu = engine(&[]);
        cpu.regs.pc = 7;
        cpu.regs.sp = 3;
        let before = cpu.regs;

        assert_eq!(cpu.return_from_interrupt(), Err(Fault::IllegalPrivilegedReturn));
        assert_eq!(cpu.regs, before);
        assert_eq!(cpu.mode, Mode::User);
    }

    #[test]
    fn test_system_call_round_trip() {
        // User: AC=4, X=4, SP 2 deep, INT, then halt.
        let mut cpu = engine(&[1, 4, 14, 27, 27, 29, 50]);
        // Handler clobbers AC and X, pushes junk, then returns.
        cpu.mem.load(TOP_SYSTEM, &[1, 99, 14, 27, 27, 30]).unwrap();

        for _ in 0..4 {
            cpu.step().unwrap();
        }
        assert_eq!(cpu.step(), Ok(Instruction::Interrupt));
        assert_eq!(cpu.mode, Mode::SystemCall);
        assert_eq!(cpu.regs.sp, FRAME_LEN);
        assert_eq!(cpu.regs.pc, 0);
        assert_eq!(cpu.mem.read(BOTTOM_SYSTEM).unwrap(), 2);
        assert_eq!(cpu.mem.read(BOTTOM_SYSTEM - 1).unwrap(), 6);

        for _ in 0..5 {
            cpu.step().unwrap();
        }
        assert_eq!(cpu.mode, Mode::User);
        assert_eq!(cpu.regs.pc, 6);
        assert_eq!(cpu.regs.sp, 2);
        assert_eq!(cpu.regs.ac, 4);
        assert_eq!(cpu.regs.x, 4);

        assert_eq!(cpu.step(), Ok(Instruction::Halt));
    }

    #[test]
    fn test_handler_sentinel_returns() {
        let mut cpu = engine(&[29, 50]);
        cpu.step().unwrap();
        assert_eq!(cpu.step(), Ok(Instruction::InterruptReturn));
        assert_eq!(cpu.mode, Mode::User);
        assert_eq!(cpu.regs.pc, 1);
    }

    #[test]
    fn test_nested_entry_overwrites_frame() {
        // The system-call handler traps again. SP restarts at 0, so the
        // second frame overwrites the first and the user's SP is lost.
        let mut cpu = engine(&[29, 50]);
        cpu.mem.load(TOP_SYSTEM, &[29]).unwrap();

        cpu.step().unwrap();
        cpu.step().unwrap();
        assert_eq!(cpu.mode, Mode::SystemCall);
        assert_eq!(cpu.regs.sp, FRAME_LEN);
        assert_eq!(cpu.mem.read(BOTTOM_SYSTEM).unwrap(), FRAME_LEN);
        assert_eq!(cpu.mem.read(BOTTOM_SYSTEM - 1).unwrap(), 1);
    }

    #[test]
    fn test_timer_interrupt_and_return() {
        // Four INCX in user code; timer every 2 instructions; the timer
        // handler is empty so the sentinel returns straight away.
        let mut cpu = engine_with(&[25, 25, 25, 25, 50], 2);

        let outcome = cpu.run();

        assert!(matches!(outcome, RunOutcome::Halted { .. }));
        assert_eq!(cpu.regs.x, 4);
        assert_eq!(cpu.regs.sp, 0);
        // 4 INCX, 2 returns from the empty handler, HLT
        assert_eq!(cpu.retired, 7);
    }

    #[test]
    fn test_interval_one_still_makes_progress() {
        let mut cpu = engine_with(&[25, 25, 25, 50], 1);
        cpu.config.max_steps = Some(100);

        let outcome = cpu.run();

        assert_eq!(outcome, RunOutcome::Halted { retired: 7 });
        assert_eq!(cpu.regs.x, 3);
    }

    #[test]
    fn test_timer_not_polled_in_handler() {
        let mut cpu = engine_with(&[29, 50], 1);
        cpu.mem.load(TOP_SYSTEM, &[25, 25, 25, 30]).unwrap();

        cpu.step().unwrap();
        assert_eq!(cpu.mode, Mode::SystemCall);
        for _ in 0..3 {
            cpu.step().unwrap();
            assert_eq!(cpu.mode, Mode::SystemCall);
        }
    }

    #[test]
    fn test_undersized_image_faults_on_handler_entry() {
        let mut mem = Memory::with_capacity(240);
        mem.load(0, &[29, 50]).unwrap();
        let mut cpu = Engine::with_output(mem, config(1000), Vec::new());

        let outcome = cpu.run();

        assert_eq!(
            outcome.fault(),
            Some(&Fault::OutOfBounds { opcode: 29, address: BOTTOM_SYSTEM })
        );
    }

    #[test]
    fn test_step_limit() {
        let mut cpu = engine(&[20, 0]);
        cpu.config.max_steps = Some(10);
        assert_eq!(cpu.run(), RunOutcome::StepLimit { retired: 10 });
        assert!(cpu.is_running());
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut cpu = engine(&[1, 3, 50]);
        cpu.run();

        let json = serde_json::to_string(&cpu.snapshot()).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cpu.snapshot());
        assert_eq!(back.regs.ac, 3);
        assert!(back.stack.is_empty());
    }

    #[test]
    fn test_snapshot_lists_live_stack() {
        let mut cpu = engine(&[]);
        cpu.push(4).unwrap();
        cpu.push(9).unwrap();

        let snap = cpu.snapshot();
        assert_eq!(snap.stack, vec![(998, 9), (999, 4)]);
    }

    #[test]
    fn test_negative_sp_cannot_push_into_timer_zone() {
        // LDI -1; TAS; LDI 77; PUSH; HLT
        let mut cpu = engine(&[1, -1, 18, 1, 77, 27, 50]);
        cpu.config.stage_diagnostics = false;
        cpu.mem.write(TOP_TIMER, 30).unwrap();

        let outcome = cpu.run();

        assert_eq!(
            outcome.fault(),
            Some(&Fault::InvalidAccess { opcode: 27, address: TOP_TIMER })
        );
        assert_eq!(cpu.mem.read(TOP_TIMER).unwrap(), 30);
        assert_eq!(cpu.regs.sp, -1);
    }

    #[test]
    fn test_call_with_negative_sp_faults() {
        // LDI -5; TAS; CALL 0
        let mut cpu = engine(&[1, -5, 18, 23, 0]);
        cpu.config.stage_diagnostics = false;

        let outcome = cpu.run();

        assert_eq!(
            outcome.fault(),
            Some(&Fault::InvalidAccess { opcode: 23, address: BOTTOM_USER + 5 })
        );
        assert_eq!(cpu.mem.read(BOTTOM_USER + 5).unwrap(), 0);
    }

    #[test]
    fn test_pop_below_stack_zone_faults() {
        let mut cpu = engine(&[]);
        cpu.regs.sp = BOTTOM_USER + 2;

        assert_eq!(
            cpu.pop(),
            Err(Fault::InvalidAccess { opcode: 0, address: -1 })
        );
        assert_eq!(cpu.regs.sp, BOTTOM_USER + 2);
    }

    proptest! {
        #[test]
        fn prop_pop_reverses_push(values in prop::collection::vec(any::<Word>(), 0..100), start in 0..10i32) {
            let mut cpu = engine(&[]);
            cpu.regs.sp = start;

            for &v in &values {
                cpu.push(v).unwrap();
            }
            let mut popped = Vec::new();
            for _ in 0..values.len() {
                popped.push(cpu.pop().unwrap());
            }
            popped.reverse();

            prop_assert_eq!(popped, values);
            prop_assert_eq!(cpu.regs.sp, start);
        }

        #[test]
        fn prop_overflow_does_not_mutate(pc in 0..200i32, extra in 0..50i32, privileged in any::<bool>()) {
            let mut cpu = engine(&[]);
            cpu.mode = if privileged { Mode::TimerHandler } else { Mode::User };
            let limit = if privileged { 499 } else { 119 };
            cpu.regs.pc = pc;
            cpu.regs.sp = (limit - pc).max(0) + 1 + extra;
            let mem_before = cpu.mem.clone();
            let regs_before = cpu.regs;

            prop_assert_eq!(cpu.push(1), Err(Fault::StackOverflow));
            prop_assert_eq!(&cpu.mem, &mem_before);
            prop_assert_eq!(cpu.regs, regs_before);
        }

        #[test]
        fn prop_timer_fires_after_interval(k in 1u32..60) {
            let mut program = vec![25; 80];
            program.push(50);
            let mut cpu = engine_with(&program, k);
            // Marker the handler runs first.
            cpu.mem.write(TOP_TIMER, 8).unwrap();

            for _ in 0..k - 1 {
                cpu.step().unwrap();
                prop_assert_eq!(cpu.mode, Mode::User);
            }
            cpu.step().unwrap();

            prop_assert_eq!(cpu.mode, Mode::TimerHandler);
            prop_assert_eq!(cpu.regs.sp, FRAME_LEN);
            prop_assert_eq!(cpu.step(), Ok(Instruction::Random));
        }
    }
}
