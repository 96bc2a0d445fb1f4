use crate::job::LogLine;
use crate::traits::Console;

use std::io::Write;

/// Writes job output to stdout and everything else to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct Terminal;

impl Console for Terminal {
    fn status(&self, message: &str) {
        eprintln!("{message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("\x1b[33m{message}\x1b[0m");
    }

    fn log_line(&self, line: &LogLine) {
        println!("[batch] {line}");
        let _ = std::io::stdout().flush();
    }
}
