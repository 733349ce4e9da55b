//! Synchronized console device
//!
//! One reader and one writer at a time; character, string and integer
//! transfers for the console syscalls and the shell. Defaults to the
//! host stdin/stdout, with pluggable streams for tests.

use std::io::{BufRead, BufReader, Write};
use std::sync::Mutex;

pub struct Console {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            input: Mutex::new(Box::new(BufReader::new(std::io::stdin()))),
            output: Mutex::new(Box::new(std::io::stdout())),
        }
    }

    pub fn with_io(input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    pub fn put_char(&self, ch: u8) {
        let mut out = self.output.lock().unwrap();
        let _ = out.write_all(&[ch]);
        let _ = out.flush();
    }

    pub fn put_string(&self, s: &str) {
        let mut out = self.output.lock().unwrap();
        let _ = out.write_all(s.as_bytes());
        let _ = out.flush();
    }

    pub fn put_int(&self, value: i32) {
        self.put_string(&value.to_string());
    }

    /// Next input byte, or `None` at end of input.
    pub fn get_char(&self) -> Option<u8> {
        let mut input = self.input.lock().unwrap();
        let byte = {
            let buf = input.fill_buf().ok()?;
            *buf.first()?
        };
        input.consume(1);
        Some(byte)
    }

    /// Read one line, or `None` at end of input. The newline is
    /// consumed but not returned.
    pub fn get_line(&self) -> Option<String> {
        let mut input = self.input.lock().unwrap();
        let mut line = String::new();
        match input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                Some(line)
            }
        }
    }

    /// Read up to `max` bytes, stopping after a newline. The newline is
    /// consumed but not returned.
    pub fn get_string(&self, max: usize) -> String {
        let mut input = self.input.lock().unwrap();
        let mut line = String::new();
        let _ = input.read_line(&mut line);
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        line.truncate(max);
        line
    }

    /// Read a line and parse a leading decimal integer; 0 if malformed.
    pub fn get_int(&self) -> i32 {
        let line = self.get_string(64);
        let trimmed = line.trim();
        let digits: String = trimmed
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '-' || *c == '+')
            .collect();
        digits.parse().unwrap_or(0)
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn string_and_int_input() {
        let console = Console::with_io(
            Box::new(Cursor::new(b"hello\n42\n".to_vec())),
            Box::new(Vec::new()),
        );
        assert_eq!(console.get_string(32), "hello");
        assert_eq!(console.get_int(), 42);
    }

    #[test]
    fn char_input_sequences() {
        let console = Console::with_io(Box::new(Cursor::new(b"ab".to_vec())), Box::new(Vec::new()));
        assert_eq!(console.get_char(), Some(b'a'));
        assert_eq!(console.get_char(), Some(b'b'));
        assert_eq!(console.get_char(), None);
    }
}
