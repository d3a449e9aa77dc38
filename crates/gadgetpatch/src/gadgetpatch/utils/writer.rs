use indicatif::MultiProgress;
use std::io::{self, Write};
use std::sync::Arc;

/// Routes log lines through the shared `MultiProgress` so they print above
/// active bars instead of tearing them.
pub struct MultiProgressWriter {
    mp: Arc<MultiProgress>,
}

impl MultiProgressWriter {
    pub fn new(mp: Arc<MultiProgress>) -> Self {
        Self { mp }
    }
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A hidden target (not a terminal) swallows println, so go straight to stderr
        if self.mp.is_hidden() {
            return io::stderr().write(buf);
        }

        let line = String::from_utf8_lossy(buf);
        self.mp.println(line.trim_end_matches('\n'))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}
