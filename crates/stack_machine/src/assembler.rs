// Token driven assembler. Words go straight into the machine's memory
// as tokens are read; labels used before their definition are patched
// once the whole source has been seen.

use std::io::Read;

use log::debug;
use thiserror_no_std::Error;

use crate::machine::{Machine, MachineConfig};
use crate::tokenizer::{Tokenizer, TokenizerError};
use crate::{Address, MachineError, Opcode, Word};

/// Resolves to the current write position instead of a table entry.
pub const HERE: &str = "HERE";
const HALT: &str = "HALT";

/// Stands in for a label address until the label is known.
pub const PLACEHOLDER: Word = -1;

/// `PUSH <target> JMP` plus the operand slot of the `PUSHIP` itself.
const CALL_RETURN_OFFSET: Word = 4;

/// Label and call names, stored upper case.
type Name = String;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblerError {
    #[error("{0}")]
    Kind(AssemblerErrorKind),
    #[error("line {line}: {kind}")]
    WithLine { line: u32, kind: AssemblerErrorKind },
}

impl AssemblerError {
    fn with_line(self, line: u32) -> Self {
        match self {
            AssemblerError::WithLine { .. } => self,
            AssemblerError::Kind(kind) => AssemblerError::WithLine { line, kind },
        }
    }

    pub fn line_number(&self) -> Option<u32> {
        match self {
            Self::Kind(_) => None,
            Self::WithLine { line, .. } => Some(*line),
        }
    }

    pub fn error_kind(&self) -> &AssemblerErrorKind {
        match self {
            Self::Kind(kind) => kind,
            Self::WithLine { kind, .. } => kind,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssemblerErrorKind {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error("unknown character literal: {0}")]
    UnknownEscape(String),
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("label is reserved: HERE")]
    ReservedLabel,
    #[error("empty label")]
    EmptyLabel,
    #[error("code label not found: {0}")]
    UnresolvedLabel(String),
    #[error("{0}")]
    Tokenizer(TokenizerError),
    #[error("{0}")]
    Machine(MachineError),
}

impl From<AssemblerErrorKind> for AssemblerError {
    fn from(kind: AssemblerErrorKind) -> Self {
        AssemblerError::Kind(kind)
    }
}

impl From<MachineError> for AssemblerError {
    fn from(err: MachineError) -> Self {
        AssemblerError::Kind(AssemblerErrorKind::Machine(err))
    }
}

impl From<TokenizerError> for AssemblerError {
    fn from(err: TokenizerError) -> Self {
        AssemblerError::Kind(AssemblerErrorKind::Tokenizer(err))
    }
}

/// A label definition. When a name is defined twice the first
/// definition wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    name: Name,
    address: Address,
}

impl Label {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn address(&self) -> Address {
        self.address
    }
}

/// A placeholder word waiting for the address of `name`.
#[derive(Debug, Clone)]
pub struct Fixup {
    name: Name,
    at: Address,
    line: u32,
}

impl Fixup {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    pub fn at(&self) -> Address {
        self.at
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Finished,
}

pub struct Assembler<'io> {
    machine: Machine<'io>,
    labels: Vec<Label>,
    fixups: Vec<Fixup>,
}

impl<'io> Assembler<'io> {
    /// Emission starts at the machine's current position.
    pub fn new(machine: Machine<'io>) -> Self {
        Self {
            machine,
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Forward references not yet patched.
    pub fn forwards(&self) -> &[Fixup] {
        &self.fixups
    }

    pub fn machine(&self) -> &Machine<'io> {
        &self.machine
    }

    pub fn into_machine(self) -> Machine<'io> {
        self.machine
    }

    /// Assembles tokens until end of input, then resolves forward
    /// references. The first error stops assembly.
    pub fn assemble<R: Read>(&mut self, tokenizer: &mut Tokenizer<R>) -> Result<(), AssemblerError> {
        loop {
            let token = tokenizer.next_token()?;
            let line = tokenizer.line();
            let flow = self
                .compile_token(token.as_deref(), tokenizer)
                .map_err(|err| err.with_line(line))?;
            if flow == Flow::Finished {
                return Ok(());
            }
        }
    }

    /// Compiles one token. `None` or an empty token marks end of input:
    /// the halt idiom is emitted and forward references are resolved.
    pub fn compile_token<R: Read>(
        &mut self,
        token: Option<&str>,
        tokenizer: &mut Tokenizer<R>,
    ) -> Result<Flow, AssemblerError> {
        let Some(token) = token.filter(|token| !token.is_empty()) else {
            self.machine.load_halt()?;
            self.resolve_forwards()?;
            return Ok(Flow::Finished);
        };

        if token.eq_ignore_ascii_case(HALT) {
            self.machine.load_halt()?;
        } else if token.starts_with(';') {
            tokenizer.skip_line()?;
        } else if is_literal(token) {
            self.compile_literal(token, tokenizer.line())?;
        } else if let Some(name) = token.strip_suffix(':') {
            self.add_label(name)?;
        } else {
            let op = Opcode::from_mnemonic(token)
                .ok_or_else(|| AssemblerErrorKind::UnknownOperation(token.to_owned()))?;
            self.machine.load_op(op)?;
        }
        Ok(Flow::Continue)
    }

    /// Patches every recorded forward reference. Unknown names are link
    /// errors reported against the line of the reference.
    pub fn resolve_forwards(&mut self) -> Result<(), AssemblerError> {
        let fixups = core::mem::take(&mut self.fixups);
        for fixup in fixups {
            let Some(address) = self.lookup(&fixup.name)? else {
                return Err(AssemblerError::WithLine {
                    line: fixup.line,
                    kind: AssemblerErrorKind::UnresolvedLabel(fixup.name),
                });
            };
            debug!("patch {} -> {} at {}", fixup.name, address, fixup.at);
            self.machine.poke(fixup.at.to_word()?, address)?;
        }
        Ok(())
    }

    fn add_label(&mut self, name: &str) -> Result<(), AssemblerError> {
        let name = to_name(name);
        if name.is_empty() {
            return Err(AssemblerErrorKind::EmptyLabel.into());
        }
        if name == HERE {
            return Err(AssemblerErrorKind::ReservedLabel.into());
        }
        let address = self.here()?;
        debug!("label {name} = {address}");
        self.labels.push(Label { name, address });
        Ok(())
    }

    fn compile_literal(&mut self, token: &str, line: u32) -> Result<(), AssemblerError> {
        if let Some(name) = token.strip_prefix('&') {
            return self.compile_label_ref(name, line);
        }

        if let Some(value) = parse_literal(token)? {
            self.machine.load_op(Opcode::Push)?;
            self.machine.load(value)?;
            return Ok(());
        }

        self.compile_call(token, line)
    }

    fn compile_label_ref(&mut self, name: &str, line: u32) -> Result<(), AssemblerError> {
        let name = to_name(name);
        if name.is_empty() {
            return Err(AssemblerErrorKind::EmptyLabel.into());
        }
        let address = self.lookup(&name)?;
        self.machine.load_op(Opcode::Push)?;
        match address {
            Some(address) => self.machine.load(address)?,
            None => self.load_placeholder(name, line)?,
        }
        Ok(())
    }

    /// `PUSHIP <return> PUSH <function> JMP`, returning just past the JMP.
    fn compile_call(&mut self, token: &str, line: u32) -> Result<(), AssemblerError> {
        let name = to_name(token);
        if name == HERE {
            return Err(AssemblerErrorKind::ReservedLabel.into());
        }
        self.machine.load_op(Opcode::PushIp)?;
        let return_to = self
            .machine
            .position_word()?
            .checked_add(CALL_RETURN_OFFSET)
            .ok_or(MachineError::AddressOverflow(self.machine.position()))?;
        self.machine.load(return_to)?;
        self.machine.load_op(Opcode::Push)?;
        self.load_placeholder(name, line)?;
        self.machine.load_op(Opcode::Jmp)?;
        Ok(())
    }

    fn load_placeholder(&mut self, name: Name, line: u32) -> Result<(), AssemblerError> {
        let at = self.here()?;
        self.fixups.push(Fixup { name, at, line });
        self.machine.load(PLACEHOLDER)?;
        Ok(())
    }

    fn lookup(&self, name: &Name) -> Result<Option<Word>, MachineError> {
        if name == HERE {
            return self.machine.position_word().map(Some);
        }
        self.labels
            .iter()
            .find(|label| label.name == *name)
            .map(|label| label.address.to_word())
            .transpose()
    }

    /// The write position as an address; fails once memory is full.
    fn here(&self) -> Result<Address, MachineError> {
        let position = self.machine.position_word()?;
        self.machine
            .address(position)
            .ok_or(MachineError::ProgramTooLarge {
                capacity: self.machine.memory_size(),
            })
    }
}

/// Assembles `source` into a fresh machine bound to stdin and stdout.
pub fn assemble_source(source: &str, config: MachineConfig) -> Result<Machine<'static>, AssemblerError> {
    let mut assembler = Assembler::new(Machine::new(config)?);
    assembler.assemble(&mut Tokenizer::new(source.as_bytes()))?;
    Ok(assembler.into_machine())
}

/// Anything that is neither a label definition nor a mnemonic.
fn is_literal(token: &str) -> bool {
    !token.ends_with(':') && Opcode::from_mnemonic(token).is_none()
}

/// Decimal or character literal. `None` for any other token.
fn parse_literal(token: &str) -> Result<Option<Word>, AssemblerErrorKind> {
    if !token.is_empty() && token.bytes().all(|byte| byte.is_ascii_digit()) {
        return token
            .parse::<Word>()
            .map(Some)
            .map_err(|_| AssemblerErrorKind::InvalidNumber(token.to_owned()));
    }

    // Character literals are exactly three or four bytes; anything else,
    // multi-byte characters included, is not a literal.
    match token.as_bytes() {
        [b'\'', c, b'\''] if *c != b'\\' => Ok(Some(Word::from(*c))),
        [b'\'', b'\\', escape, b'\''] => match escape {
            b't' => Ok(Some(Word::from(b'\t'))),
            b'r' => Ok(Some(Word::from(b'\r'))),
            b'n' => Ok(Some(Word::from(b'\n'))),
            b'0' => Ok(Some(0)),
            _ => Err(AssemblerErrorKind::UnknownEscape(token.to_owned())),
        },
        _ => Ok(None),
    }
}

/// Upper cased; any length.
fn to_name(name: &str) -> Name {
    name.to_ascii_uppercase()
}
