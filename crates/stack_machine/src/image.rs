//! Flat bytecode images.
//!
//! An image is the raw sequence of little-endian words from address zero
//! up to the last word that is not a NOP. There is no header; trailing
//! NOPs are never written, so a program whose meaningful tail is a NOP
//! cannot be stored.

use std::io::{Read, Write};

use log::debug;

use crate::machine::Machine;
use crate::{MachineError, Word, WORD_BYTES};

impl Machine<'_> {
    /// Writes memory up to `program_len` and returns the number of
    /// words written.
    pub fn save_image(&self, out: &mut impl Write) -> Result<usize, MachineError> {
        let words = self
            .memory()
            .get(..self.program_len())
            .ok_or(MachineError::FetchOutOfBounds(self.program_len()))?;
        let mut bytes = Vec::with_capacity(words.len().saturating_mul(WORD_BYTES));
        for word in words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        out.write_all(&bytes)
            .and_then(|()| out.flush())
            .map_err(|err| MachineError::io("save image", &err))?;
        debug!("saved image of {} words", words.len());
        Ok(words.len())
    }

    /// Resets the machine and fills memory from `image`, leaving `ip`
    /// at zero. Returns the number of words read.
    pub fn load_image(&mut self, image: &mut impl Read) -> Result<usize, MachineError> {
        let mut bytes = Vec::new();
        image
            .read_to_end(&mut bytes)
            .map_err(|err| MachineError::io("load image", &err))?;
        self.load_image_bytes(&bytes)
    }

    pub fn load_image_bytes(&mut self, bytes: &[u8]) -> Result<usize, MachineError> {
        let chunks = bytes.chunks_exact(WORD_BYTES);
        if !chunks.remainder().is_empty() {
            return Err(MachineError::TruncatedImage(bytes.len()));
        }
        let words = chunks.len();
        if words > self.memory_size() {
            return Err(MachineError::ImageTooLarge {
                words,
                capacity: self.memory_size(),
            });
        }

        self.reset();
        for chunk in chunks {
            let mut word = [0u8; WORD_BYTES];
            word.copy_from_slice(chunk);
            self.load(Word::from_le_bytes(word))?;
        }
        self.rewind();
        debug!("loaded image of {words} words");
        Ok(words)
    }
}
