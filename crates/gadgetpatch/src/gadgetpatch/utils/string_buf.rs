use std::io::Write;

/// In-memory sink for ADB shell output.
#[derive(Debug, Default)]
pub struct StringBuf {
    buffer: Vec<u8>,
}

impl StringBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the captured output as text.
    ///
    /// # Errors
    /// Returns an error if the device wrote invalid UTF-8
    pub fn as_string(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.buffer)
    }

    /// First non-empty line with surrounding whitespace (and the `\r` some
    /// devices emit) removed.
    pub fn first_line(&self) -> Option<&str> {
        self.as_string()
            .ok()?
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
    }
}

impl Write for StringBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
