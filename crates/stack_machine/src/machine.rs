use core::fmt;
use std::io::{self, Read, Write};

use log::{debug, trace, warn};

use crate::{index_to_word, Address, MachineError, Opcode, Word, END_OF_INPUT, NOP_WORD};

/// 1000 KiB of four byte words.
pub const DEFAULT_MEMORY_SIZE: usize = 1024 * 1000 / size_of::<Word>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub memory_size: usize,
}

impl MachineConfig {
    pub fn new(memory_size: usize) -> Self {
        Self { memory_size }
    }

    /// Every address, including one past the last cell, must fit in a word.
    pub fn validate(&self) -> Result<(), MachineError> {
        if self.memory_size == 0 || index_to_word(self.memory_size).is_err() {
            return Err(MachineError::InvalidMemorySize(self.memory_size));
        }
        Ok(())
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_SIZE)
    }
}

pub struct Machine<'io> {
    memory: Box<[Word]>,
    stack: Vec<Word>,
    return_stack: Vec<Word>,
    ip: usize,
    running: bool,
    input: Box<dyn Read + 'io>,
    output: Box<dyn Write + 'io>,
}

impl fmt::Debug for Machine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("memory_size", &self.memory.len())
            .field("program_len", &self.program_len())
            .field("stack", &self.stack)
            .field("return_stack", &self.return_stack)
            .field("ip", &self.ip)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}

impl Machine<'static> {
    /// A machine reading `IN` from stdin and writing `OUT` to stdout.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        Machine::with_io(config, io::stdin(), io::stdout())
    }
}

impl<'io> Machine<'io> {
    pub fn with_io(
        config: MachineConfig,
        input: impl Read + 'io,
        output: impl Write + 'io,
    ) -> Result<Self, MachineError> {
        config.validate()?;
        let mut machine = Self {
            memory: vec![NOP_WORD; config.memory_size].into_boxed_slice(),
            stack: Vec::new(),
            return_stack: Vec::new(),
            ip: 0,
            running: true,
            input: Box::new(input),
            output: Box::new(output),
        };
        machine.reset();
        Ok(machine)
    }

    pub fn set_input(&mut self, input: impl Read + 'io) {
        self.input = Box::new(input);
    }

    pub fn set_output(&mut self, output: impl Write + 'io) {
        self.output = Box::new(output);
    }

    /// Blank memory, empty stacks, `ip` at zero.
    pub fn reset(&mut self) {
        self.memory.fill(NOP_WORD);
        self.stack.clear();
        self.return_stack.clear();
        self.ip = 0;
        self.running = true;
        debug!("machine reset with {} words of memory", self.memory.len());
    }

    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    pub fn memory(&self) -> &[Word] {
        &self.memory
    }

    pub fn stack(&self) -> &[Word] {
        &self.stack
    }

    pub fn return_stack(&self) -> &[Word] {
        &self.return_stack
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// The instruction pointer, which doubles as the write position
    /// while a program is being loaded.
    pub fn position(&self) -> usize {
        self.ip
    }

    pub fn position_word(&self) -> Result<Word, MachineError> {
        index_to_word(self.ip)
    }

    pub fn set_position(&mut self, address: Address) {
        self.ip = address.index();
    }

    pub fn rewind(&mut self) {
        self.ip = 0;
    }

    /// The word under the instruction pointer.
    pub fn current(&self) -> Result<Word, MachineError> {
        read_memory(&self.memory, self.ip)
    }

    pub fn address(&self, word: Word) -> Option<Address> {
        Address::new(word, self.memory.len())
    }

    pub fn peek(&self, address: Word) -> Result<Word, MachineError> {
        let address = self.check_bounds(address, Opcode::Load)?;
        read_memory(&self.memory, address.index())
    }

    pub fn poke(&mut self, address: Word, value: Word) -> Result<(), MachineError> {
        let address = self.check_bounds(address, Opcode::Stor)?;
        self.write(address, value)
    }

    pub fn push(&mut self, value: Word) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Option<Word> {
        self.stack.pop()
    }

    /// Writes `word` at the current position and advances past it.
    pub fn load(&mut self, word: Word) -> Result<(), MachineError> {
        let capacity = self.memory.len();
        let slot = self
            .memory
            .get_mut(self.ip)
            .ok_or(MachineError::ProgramTooLarge { capacity })?;
        *slot = word;
        self.ip = next_ip(self.ip)?;
        Ok(())
    }

    pub fn load_op(&mut self, op: Opcode) -> Result<(), MachineError> {
        self.load(Word::from(op))
    }

    /// Emits `PUSH <address of the JMP> JMP`.
    pub fn load_halt(&mut self) -> Result<(), MachineError> {
        self.load_op(Opcode::Push)?;
        let jump_at = next_ip(self.ip)?;
        self.load(index_to_word(jump_at)?)?;
        self.load_op(Opcode::Jmp)
    }

    /// One past the last word that is not a NOP, zero for blank memory.
    pub fn program_len(&self) -> usize {
        self.memory
            .iter()
            .rposition(|word| *word != NOP_WORD)
            .map_or(0, |last| last.saturating_add(1))
    }

    pub fn run(&mut self) -> Result<(), MachineError> {
        self.run_from(Address(0))
    }

    /// Executes from `start` until the program jumps to itself or
    /// faults. A fault stops the machine with `ip` on the faulting
    /// instruction.
    pub fn run_from(&mut self, start: Address) -> Result<(), MachineError> {
        self.ip = start.index();
        self.running = true;

        while self.running {
            if let Err(err) = self.step() {
                self.running = false;
                if let Err(flush) = self.output.flush() {
                    warn!("flush after fault failed: {flush}");
                }
                return Err(err);
            }
        }

        self.output
            .flush()
            .map_err(|err| MachineError::io("flush", &err))
    }

    /// Fetches, decodes and executes a single instruction.
    pub fn step(&mut self) -> Result<(), MachineError> {
        let word = self.fetch()?;
        let op = Opcode::try_from(word)?;
        trace!("{:#08x} {} {:?}", self.ip, op, self.stack);

        match op {
            Opcode::Nop => {}
            Opcode::Add => {
                let (a, b) = self.pop2(op)?;
                self.stack.push(a.wrapping_add(b));
            }
            Opcode::Sub => {
                let (a, b) = self.pop2(op)?;
                self.stack.push(b.wrapping_sub(a));
            }
            Opcode::And => {
                let (a, b) = self.pop2(op)?;
                self.stack.push(a & b);
            }
            Opcode::Or => {
                let (a, b) = self.pop2(op)?;
                self.stack.push(a | b);
            }
            Opcode::Xor => {
                let (a, b) = self.pop2(op)?;
                self.stack.push(a ^ b);
            }
            Opcode::Not => {
                let a = self.pop_data(op)?;
                self.stack.push(Word::from(a == 0));
            }
            Opcode::Compl => {
                let a = self.pop_data(op)?;
                self.stack.push(!a);
            }
            Opcode::In => {
                let value = self.read_byte()?;
                self.stack.push(value);
            }
            Opcode::Out => {
                let a = self.pop_data(op)?;
                let [low, ..] = a.to_le_bytes();
                self.output
                    .write_all(&[low])
                    .and_then(|()| self.output.flush())
                    .map_err(|err| MachineError::io("OUT", &err))?;
            }
            Opcode::OutNum => {
                let a = self.pop_data(op)?;
                let unsigned = u32::from_ne_bytes(a.to_ne_bytes());
                write!(self.output, "{unsigned}").map_err(|err| MachineError::io("OUTNUM", &err))?;
            }
            Opcode::Load => {
                let target = self.peek_data(op)?;
                let address = self.check_bounds(target, op)?;
                let value = read_memory(&self.memory, address.index())?;
                self.stack.pop();
                self.stack.push(value);
            }
            Opcode::Stor => {
                self.require(op, 2)?;
                let target = self.peek_data(op)?;
                let address = self.check_bounds(target, op)?;
                let (_, value) = self.pop2(op)?;
                self.write(address, value)?;
            }
            Opcode::Jmp => {
                let target = self.peek_data(op)?;
                let address = self.check_bounds(target, op)?;
                self.stack.pop();
                if address.index() == self.ip {
                    debug!("halt at {address}");
                    self.running = false;
                } else {
                    self.ip = address.index();
                }
                return Ok(());
            }
            Opcode::Jz | Opcode::Jnz => {
                self.require(op, 2)?;
                let (a, b) = self.pop2_unchecked();
                let jump = match op {
                    Opcode::Jz => a == 0,
                    _ => a != 0,
                };
                if jump {
                    let Some(address) = self.address(b) else {
                        self.stack.push(b);
                        self.stack.push(a);
                        return Err(MachineError::AddressOutOfBounds { op, address: b });
                    };
                    self.ip = address.index();
                    return Ok(());
                }
            }
            Opcode::Push => {
                let operand = self.fetch_operand()?;
                self.stack.push(operand);
            }
            Opcode::PushIp => {
                let operand = self.fetch_operand()?;
                self.return_stack.push(operand);
            }
            Opcode::PopIp => {
                let target = *self
                    .return_stack
                    .last()
                    .ok_or(MachineError::ReturnStackUnderflow(op))?;
                let address = self.check_bounds(target, op)?;
                self.return_stack.pop();
                self.ip = address.index();
                return Ok(());
            }
            Opcode::DropIp => {
                self.return_stack
                    .pop()
                    .ok_or(MachineError::ReturnStackUnderflow(op))?;
            }
            Opcode::Dup => {
                let a = self.peek_data(op)?;
                self.stack.push(a);
            }
            Opcode::Swap => {
                let (a, b) = self.pop2(op)?;
                self.stack.push(a);
                self.stack.push(b);
            }
            Opcode::Rol3 => {
                self.require(op, 3)?;
                let (c, b) = self.pop2_unchecked();
                let a = self.pop_data(op)?;
                self.stack.push(b);
                self.stack.push(c);
                self.stack.push(a);
            }
            Opcode::Drop => {
                self.pop_data(op)?;
            }
        }

        self.ip = next_ip(self.ip)?;
        Ok(())
    }

    fn fetch(&self) -> Result<Word, MachineError> {
        self.memory
            .get(self.ip)
            .copied()
            .ok_or(MachineError::FetchOutOfBounds(self.ip))
    }

    /// Moves `ip` onto the inline operand and reads it. `ip` is left on
    /// the operand so the common advance steps past it.
    fn fetch_operand(&mut self) -> Result<Word, MachineError> {
        let at = next_ip(self.ip)?;
        let operand = read_memory(&self.memory, at)?;
        self.ip = at;
        Ok(operand)
    }

    fn check_bounds(&self, word: Word, op: Opcode) -> Result<Address, MachineError> {
        self.address(word)
            .ok_or(MachineError::AddressOutOfBounds { op, address: word })
    }

    fn write(&mut self, address: Address, value: Word) -> Result<(), MachineError> {
        let index = address.index();
        let slot = self
            .memory
            .get_mut(index)
            .ok_or(MachineError::FetchOutOfBounds(index))?;
        *slot = value;
        Ok(())
    }

    fn read_byte(&mut self) -> Result<Word, MachineError> {
        let mut byte = [0u8; 1];
        loop {
            match self.input.read(&mut byte) {
                Ok(0) => return Ok(END_OF_INPUT),
                Ok(_) => {
                    let [value] = byte;
                    return Ok(Word::from(value));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(MachineError::io("IN", &err)),
            }
        }
    }

    fn require(&self, op: Opcode, depth: usize) -> Result<(), MachineError> {
        if self.stack.len() < depth {
            return Err(MachineError::StackUnderflow(op));
        }
        Ok(())
    }

    fn peek_data(&self, op: Opcode) -> Result<Word, MachineError> {
        self.stack
            .last()
            .copied()
            .ok_or(MachineError::StackUnderflow(op))
    }

    fn pop_data(&mut self, op: Opcode) -> Result<Word, MachineError> {
        self.stack.pop().ok_or(MachineError::StackUnderflow(op))
    }

    /// Pops the top of stack `a`, then `b`. The stack is untouched when
    /// it holds fewer than two words.
    fn pop2(&mut self, op: Opcode) -> Result<(Word, Word), MachineError> {
        self.require(op, 2)?;
        Ok(self.pop2_unchecked())
    }

    fn pop2_unchecked(&mut self) -> (Word, Word) {
        let a = self.stack.pop().unwrap_or(NOP_WORD);
        let b = self.stack.pop().unwrap_or(NOP_WORD);
        (a, b)
    }
}

fn next_ip(ip: usize) -> Result<usize, MachineError> {
    ip.checked_add(1).ok_or(MachineError::AddressOverflow(ip))
}

fn read_memory(memory: &[Word], index: usize) -> Result<Word, MachineError> {
    match memory.get(index) {
        None => Err(MachineError::FetchOutOfBounds(index)),
        Some(word) => Ok(*word),
    }
}
