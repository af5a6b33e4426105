#![cfg_attr(
    not(test),
    deny(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::todo,
        clippy::unimplemented,
        clippy::indexing_slicing,
        clippy::string_slice,
        clippy::arithmetic_side_effects,
        clippy::panicking_unwrap,
        clippy::out_of_bounds_indexing,
        clippy::panic_in_result_fn,
        clippy::unwrap_in_result,
    )
)]
#![cfg_attr(not(test), warn(clippy::missing_panics_doc))]

use core::fmt;
use std::io;

use thiserror_no_std::Error;
use variant_count::VariantCount;

pub mod assembler;
pub mod disassembler;
pub mod image;
pub mod machine;
pub mod tokenizer;

pub use assembler::{assemble_source, Assembler, AssemblerError, AssemblerErrorKind};
pub use machine::{Machine, MachineConfig};
pub use tokenizer::Tokenizer;

#[cfg(test)]
mod assembler_test;

/// The stack machine.
///
/// A machine owns one flat region of memory holding both instructions
/// and their inline operands, a data stack and a return-address stack.
/// Every value the machine handles is a `Word`: opcodes, literals,
/// character codes and addresses all share the one scalar type.
///
/// The instruction pointer moves one word per fetch. There is no halt
/// instruction; a program stops by jumping to the address of the jump
/// itself:
///
/// ```text
///     PUSH <address of JMP>
///     JMP
/// ```
pub type Word = i32;

/// Words in a freshly reset memory.
pub const NOP_WORD: Word = Opcode::Nop as Word;

/// Pushed by `IN` once the input stream is exhausted.
pub const END_OF_INPUT: Word = -1;

/// Bytes per word in a saved image.
pub const WORD_BYTES: usize = size_of::<Word>();

/// Instruction table.
///
/// Discriminants are the bytecode values and must not be reordered.
#[repr(i32)] // Must match Word
#[derive(VariantCount, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Nop,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Not,
    In,
    Out,
    Load,
    Stor,
    Jmp,
    Jz,
    Push,
    Dup,
    Swap,
    Rol3,
    OutNum,
    Jnz,
    Drop,
    PushIp,
    PopIp,
    DropIp,
    Compl,
}

impl Opcode {
    /// Every opcode in bytecode order.
    pub const ALL: [Opcode; Opcode::VARIANT_COUNT] = [
        Opcode::Nop,
        Opcode::Add,
        Opcode::Sub,
        Opcode::And,
        Opcode::Or,
        Opcode::Xor,
        Opcode::Not,
        Opcode::In,
        Opcode::Out,
        Opcode::Load,
        Opcode::Stor,
        Opcode::Jmp,
        Opcode::Jz,
        Opcode::Push,
        Opcode::Dup,
        Opcode::Swap,
        Opcode::Rol3,
        Opcode::OutNum,
        Opcode::Jnz,
        Opcode::Drop,
        Opcode::PushIp,
        Opcode::PopIp,
        Opcode::DropIp,
        Opcode::Compl,
    ];

    /// Canonical upper case mnemonic.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Nop => "NOP",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Not => "NOT",
            Opcode::In => "IN",
            Opcode::Out => "OUT",
            Opcode::Load => "LOAD",
            Opcode::Stor => "STOR",
            Opcode::Jmp => "JMP",
            Opcode::Jz => "JZ",
            Opcode::Push => "PUSH",
            Opcode::Dup => "DUP",
            Opcode::Swap => "SWAP",
            Opcode::Rol3 => "ROL3",
            Opcode::OutNum => "OUTNUM",
            Opcode::Jnz => "JNZ",
            Opcode::Drop => "DROP",
            Opcode::PushIp => "PUSHIP",
            Opcode::PopIp => "POPIP",
            Opcode::DropIp => "DROPIP",
            Opcode::Compl => "COMPL",
        }
    }

    /// Case-insensitive lookup. `None` when the token names no opcode.
    pub fn from_mnemonic(token: &str) -> Option<Opcode> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| op.mnemonic().eq_ignore_ascii_case(token))
    }

    /// Opcodes followed by one inline operand word.
    pub const fn has_operand(self) -> bool {
        matches!(self, Opcode::Push | Opcode::PushIp)
    }
}

impl From<Opcode> for Word {
    fn from(op: Opcode) -> Word {
        op as Word
    }
}

impl TryFrom<Word> for Opcode {
    type Error = MachineError;
    fn try_from(value: Word) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Opcode::ALL.get(index))
            .copied()
            .ok_or(MachineError::InvalidOp(value))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// A memory index known to be inside the machine it was checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// Validates `word` against a memory of `memory_size` words.
    pub fn new(word: Word, memory_size: usize) -> Option<Self> {
        usize::try_from(word)
            .ok()
            .filter(|index| *index < memory_size)
            .map(Address)
    }

    pub fn index(self) -> usize {
        self.0
    }

    pub fn to_word(self) -> Result<Word, MachineError> {
        index_to_word(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MachineError {
    #[error("memory size {0} must be between 1 and {max} words", max = Word::MAX)]
    InvalidMemorySize(usize),
    #[error("the value {0} is an invalid opcode")]
    InvalidOp(Word),
    #[error("instruction pointer {0:#x} is outside program memory")]
    FetchOutOfBounds(usize),
    #[error("{op}: address {address} is outside program memory")]
    AddressOutOfBounds { op: Opcode, address: Word },
    #[error("{0}: pop on empty stack")]
    StackUnderflow(Opcode),
    #[error("{0}: pop on empty IP stack")]
    ReturnStackUnderflow(Opcode),
    #[error("program does not fit in {capacity} words of memory")]
    ProgramTooLarge { capacity: usize },
    #[error("index {0} does not fit in a word")]
    AddressOverflow(usize),
    #[error("image of {words} words does not fit in {capacity} words of memory")]
    ImageTooLarge { words: usize, capacity: usize },
    #[error("image length of {0} bytes is not a whole number of words")]
    TruncatedImage(usize),
    #[error("{op}: i/o error: {kind}")]
    Io { op: &'static str, kind: io::ErrorKind },
}

impl MachineError {
    fn io(op: &'static str, err: &io::Error) -> Self {
        MachineError::Io {
            op,
            kind: err.kind(),
        }
    }
}

fn index_to_word(index: usize) -> Result<Word, MachineError> {
    Word::try_from(index).map_err(|_| MachineError::AddressOverflow(index))
}
