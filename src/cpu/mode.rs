//! Privilege modes and the zones they execute from.

use crate::cpu::memory::{Word, BOTTOM_SYSTEM, BOTTOM_USER, TOP_SYSTEM, TOP_TIMER};
use serde::{Serialize, Deserialize};
use std::ops::RangeInclusive;

/// Stack overflow threshold for `PC + SP` in user mode.
pub const USER_STACK_LIMIT: Word = 119;

/// Stack overflow threshold for `PC + SP` in either handler mode.
pub const PRIVILEGED_STACK_LIMIT: Word = 499;

/// Ceiling for SP alone on the privileged stack.
pub const PRIVILEGED_SP_CEILING: Word = 499;

/// Privilege mode of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Ordinary program execution.
    #[default]
    User,
    /// Running the timer interrupt handler.
    TimerHandler,
    /// Running the system-call handler.
    SystemCall,
}

impl Mode {
    /// Address added to PC when fetching in this mode.
    pub fn code_base(self) -> Word {
        match self {
            Mode::User => 0,
            Mode::TimerHandler => TOP_TIMER,
            Mode::SystemCall => TOP_SYSTEM,
        }
    }

    /// Top of the stack this mode pushes onto.
    ///
    /// Both handler modes share the privileged stack. Entering either one
    /// resets SP, so a nested entry overwrites the frame below it.
    pub fn stack_top(self) -> Word {
        match self {
            Mode::User => BOTTOM_USER,
            Mode::TimerHandler | Mode::SystemCall => BOTTOM_SYSTEM,
        }
    }

    /// Highest effective address an instruction may touch, if restricted.
    pub fn data_ceiling(self) -> Option<Word> {
        match self {
            Mode::User => Some(BOTTOM_USER),
            Mode::TimerHandler | Mode::SystemCall => None,
        }
    }

    /// Addresses the stack may occupy in this mode.
    ///
    /// The handler modes share the system-call zone.
    pub fn stack_zone(self) -> RangeInclusive<Word> {
        match self {
            Mode::User => 0..=BOTTOM_USER,
            Mode::TimerHandler | Mode::SystemCall => TOP_SYSTEM..=BOTTOM_SYSTEM,
        }
    }

    /// Whether a push with the given PC and SP would overflow the stack.
    pub fn stack_full(self, pc: Word, sp: Word) -> bool {
        let used = pc.wrapping_add(sp);
        match self {
            Mode::User => used > USER_STACK_LIMIT,
            Mode::TimerHandler | Mode::SystemCall => {
                used > PRIVILEGED_STACK_LIMIT || sp > PRIVILEGED_SP_CEILING
            }
        }
    }

    /// True for the two handler modes.
    pub fn is_privileged(self) -> bool {
        self != Mode::User
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::User => "user",
            Mode::TimerHandler => "timer",
            Mode::SystemCall => "syscall",
        };
        f.write_str(name)
    }
}
