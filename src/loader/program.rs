//! Textual program format.
//!
//! One word per line:
//! - A line whose first character is a digit, or a minus sign followed by a
//!   digit, holds a number. Characters after the number are a comment.
//! - Every other line is a comment. Blank lines are ignored.
//! - `.1000` moves the load cursor to the timer handler zone and `.1500` to
//!   the system-call zone. Anything after the marker is a comment.

use crate::cpu::memory::{Memory, MemoryError, Word, BOTTOM_SYSTEM, BOTTOM_USER, TOP_SYSTEM};
use crate::cpu::mode::Mode;
use serde::{Serialize, Deserialize};
use std::path::Path;
use thiserror::Error;

/// Marker that starts the timer handler section.
pub const TIMER_MARKER: &str = ".1000";

/// Marker that starts the system-call handler section.
pub const SYSTEM_MARKER: &str = ".1500";

/// Region of the image a run of lines is loaded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Section {
    User,
    Timer,
    System,
}

impl Section {
    /// First address of the section.
    pub fn base(self) -> Word {
        self.mode().code_base()
    }

    /// First address the section may not load into.
    ///
    /// User code stops short of the user stack top. Timer code stops one
    /// cell before the system-call zone. System-call code stops short of the
    /// privileged stack top.
    pub fn limit(self) -> Word {
        match self {
            Section::User => BOTTOM_USER,
            Section::Timer => TOP_SYSTEM - 1,
            Section::System => BOTTOM_SYSTEM,
        }
    }

    /// Mode that executes code from this section.
    pub fn mode(self) -> Mode {
        match self {
            Section::User => Mode::User,
            Section::Timer => Mode::TimerHandler,
            Section::System => Mode::SystemCall,
        }
    }

    fn from_marker(line: &str) -> Option<Self> {
        [(TIMER_MARKER, Section::Timer), (SYSTEM_MARKER, Section::System)]
            .into_iter()
            .find(|(marker, _)| {
                line.strip_prefix(marker)
                    .is_some_and(|rest| !rest.starts_with(|c: char| c.is_ascii_digit()))
            })
            .map(|(_, section)| section)
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Section::User => "User",
            Section::Timer => "Timer",
            Section::System => "System",
        };
        f.write_str(name)
    }
}

/// A contiguous run of words loaded at one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub section: Section,
    pub start: Word,
    pub words: Vec<Word>,
    /// Source line (1-based) of each word.
    pub lines: Vec<usize>,
}

impl Segment {
    fn new(section: Section) -> Self {
        Self {
            section,
            start: section.base(),
            words: Vec::new(),
            lines: Vec::new(),
        }
    }

    /// Address the next word would be written to.
    fn cursor(&self) -> Word {
        self.start + self.words.len() as Word
    }
}

/// A parsed program, ready to be placed in memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    pub segments: Vec<Segment>,
}

impl Program {
    /// Total number of words across all segments.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.words.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every segment into `mem`. Later segments win on overlap.
    pub fn load_into(&self, mem: &mut Memory) -> Result<(), MemoryError> {
        for segment in &self.segments {
            mem.load(segment.start, &segment.words)?;
        }
        Ok(())
    }

    /// Build a fresh full-size memory image.
    pub fn to_memory(&self) -> Result<Memory, LoadError> {
        let mut mem = Memory::new();
        self.load_into(&mut mem)?;
        Ok(mem)
    }
}

/// Parse program text.
pub fn parse_program(source: &str) -> Result<Program, LoadError> {
    let mut segments = Vec::new();
    let mut current = Segment::new(Section::User);

    for (index, raw) in source.lines().enumerate() {
        let line_num = index + 1;
        let line = raw.trim();

        if let Some(section) = Section::from_marker(line) {
            let next = Segment::new(section);
            let done = std::mem::replace(&mut current, next);
            if !done.words.is_empty() {
                segments.push(done);
            }
            continue;
        }

        let Some(token) = numeric_token(line) else {
            continue;
        };

        if current.cursor() >= current.section.limit() {
            return Err(LoadError::ZoneFull {
                section: current.section,
                line: line_num,
            });
        }

        let word = token.parse::<Word>().map_err(|e| LoadError::Parse {
            line: line_num,
            message: format!("{}: {}", token, e),
        })?;
        current.words.push(word);
        current.lines.push(line_num);
    }

    if !current.words.is_empty() {
        segments.push(current);
    }

    Ok(Program { segments })
}

/// Load a program file from disk.
pub fn load_program<P: AsRef<Path>>(path: P) -> Result<Program, LoadError> {
    let source = std::fs::read_to_string(path.as_ref()).map_err(|e| LoadError::Io {
        path: path.as_ref().display().to_string(),
        message: e.to_string(),
    })?;
    parse_program(&source)
}

/// Leading `-?[0-9]+` of a line, if the line is a number line at all.
fn numeric_token(line: &str) -> Option<&str> {
    let digits_from = usize::from(line.starts_with('-'));
    let digits = line[digits_from..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();

    if digits == 0 {
        return None;
    }
    Some(&line[..digits_from + digits])
}

/// Errors that can occur while loading a program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("Can not read file! ({path}: {message})")]
    Io { path: String, message: String },

    #[error("File is too big-In {section} mode (line {line})")]
    ZoneFull { section: Section, line: usize },

    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
}
