use std::io::{self, BufReader, Bytes, Read};

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenizerError {
    #[error("line {line}: token is not valid UTF-8")]
    InvalidUtf8 { line: u32 },
    #[error("line {line}: read failed: {kind}")]
    Io { line: u32, kind: io::ErrorKind },
}

/// Splits a character stream into whitespace separated tokens.
///
/// One byte of pushback lets whitespace skipping stop on the first byte
/// of the next token without losing it.
pub struct Tokenizer<R> {
    bytes: Bytes<BufReader<R>>,
    pushback: Option<u8>,
    line: u32,
}

impl<R: Read> Tokenizer<R> {
    pub fn new(source: R) -> Self {
        Self {
            bytes: BufReader::new(source).bytes(),
            pushback: None,
            line: 1,
        }
    }

    /// The line of the most recently consumed byte, starting at 1.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Next maximal run of non-whitespace, `None` at end of input.
    pub fn next_token(&mut self) -> Result<Option<String>, TokenizerError> {
        let mut token = Vec::new();

        loop {
            match self.next_byte()? {
                None => break,
                Some(byte) if is_whitespace(byte) && token.is_empty() => {}
                Some(byte) if is_whitespace(byte) => {
                    self.push_back(byte);
                    break;
                }
                Some(byte) => token.push(byte),
            }
        }

        if token.is_empty() {
            return Ok(None);
        }
        String::from_utf8(token)
            .map(Some)
            .map_err(|_| TokenizerError::InvalidUtf8 { line: self.line })
    }

    /// Discards everything up to and including the next line feed.
    pub fn skip_line(&mut self) -> Result<(), TokenizerError> {
        while let Some(byte) = self.next_byte()? {
            if byte == b'\n' {
                break;
            }
        }
        Ok(())
    }

    fn next_byte(&mut self) -> Result<Option<u8>, TokenizerError> {
        let byte = match self.pushback.take() {
            Some(byte) => byte,
            None => match self.bytes.next() {
                None => return Ok(None),
                Some(Ok(byte)) => byte,
                Some(Err(err)) => {
                    return Err(TokenizerError::Io {
                        line: self.line,
                        kind: err.kind(),
                    });
                }
            },
        };
        if byte == b'\n' {
            self.line = self.line.saturating_add(1);
        }
        Ok(Some(byte))
    }

    fn push_back(&mut self, byte: u8) {
        if byte == b'\n' {
            self.line = self.line.saturating_sub(1);
        }
        self.pushback = Some(byte);
    }
}

fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\r' | b'\n')
}

#[cfg(test)]
mod test;
