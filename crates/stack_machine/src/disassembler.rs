use core::fmt;
use std::io::{self, Write};

use crate::machine::Machine;
use crate::{Opcode, Word};

/// One decoded instruction, with its inline operand when it has one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub address: usize,
    pub word: Word,
    pub opcode: Option<Opcode>,
    pub operand: Option<Word>,
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode {
            Some(op) => write!(f, "{:#x} {op}", self.address)?,
            None => write!(f, "{:#x} <?> {:#x}", self.address, self.word)?,
        }
        if let Some(operand) = self.operand {
            write!(f, " {operand:#x}")?;
            if let Some(text) = printable(operand) {
                write!(f, " ('{text}')")?;
            }
        }
        Ok(())
    }
}

/// Walks memory from address zero to the end of the program.
pub struct Disassembler<'a> {
    words: &'a [Word],
    address: usize,
}

impl<'a> Disassembler<'a> {
    pub fn new(machine: &'a Machine<'_>) -> Self {
        let words = machine.memory();
        Self::from_words(words.get(..machine.program_len()).unwrap_or(words))
    }

    pub fn from_words(words: &'a [Word]) -> Self {
        Self { words, address: 0 }
    }
}

impl Iterator for Disassembler<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        let address = self.address;
        let word = *self.words.get(address)?;
        let opcode = Opcode::try_from(word).ok();
        let mut next = address.saturating_add(1);

        let operand = match opcode {
            Some(op) if op.has_operand() => {
                let operand = self.words.get(next).copied();
                if operand.is_some() {
                    next = next.saturating_add(1);
                }
                operand
            }
            _ => None,
        };

        self.address = next;
        Some(Instruction {
            address,
            word,
            opcode,
            operand,
        })
    }
}

pub fn write_listing(machine: &Machine<'_>, out: &mut impl Write) -> io::Result<()> {
    writeln!(out, "; {} words", machine.program_len())?;
    for instruction in Disassembler::new(machine) {
        writeln!(out, "{instruction}")?;
    }
    Ok(())
}

fn printable(word: Word) -> Option<&'static str> {
    const ASCII: &str = " !\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";
    match word {
        9 => Some("\\t"),
        10 => Some("\\n"),
        13 => Some("\\r"),
        32..=126 => {
            let start = usize::try_from(word).ok()?.checked_sub(32)?;
            ASCII.get(start..start.checked_add(1)?)
        }
        _ => None,
    }
}
