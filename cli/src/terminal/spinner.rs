use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// The spinner currently on screen, if any. Log lines are printed above it.
static ACTIVE: Mutex<Option<ProgressBar>> = Mutex::new(None);

pub struct Spinner {
    pb: ProgressBar,
}

impl Spinner {
    pub fn start(message: impl Into<String>) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&[
                "▁▁▁▁▁",
                "▁▂▂▂▁",
                "▁▄▂▄▁",
                "▂▄▆▄▂",
                "▄▆█▆▄",
                "▂▄▆▄▂",
                "▁▄▂▄▁",
                "▁▂▂▂▁",
            ]);

        pb.set_style(style);
        pb.set_message(message.into());
        pb.enable_steady_tick(Duration::from_millis(100));

        *ACTIVE.lock().unwrap_or_else(PoisonError::into_inner) = Some(pb.clone());
        Self { pb }
    }

    pub fn set_message(&self, msg: String) {
        self.pb.set_message(msg);
    }
}

impl Drop for Spinner {
    fn drop(&mut self) {
        ACTIVE.lock().unwrap_or_else(PoisonError::into_inner).take();
        self.pb.finish_and_clear();
    }
}

/// Writes log lines to stdout, or above the spinner while one is running.
pub struct TerminalWriter;

impl Write for TerminalWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let active: Option<ProgressBar> = ACTIVE
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match active {
            Some(pb) => {
                let msg = String::from_utf8_lossy(buf);
                pb.println(msg.trim_end());
                Ok(buf.len())
            }
            None => io::stdout().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}
