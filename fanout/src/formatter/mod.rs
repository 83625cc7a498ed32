// This module contains the `Output` record and the presenters that consume
// it: `ansi` (real-time), `json` (aggregate) and `window` (interactive).
mod ansi;
mod json;
mod window;

// Re-exports.
pub use ansi::AnsiFormatter;
pub use json::JsonFormatter;
pub use window::WindowFormatter;

use serde::{Deserialize, Serialize};

/// Final per-host record. Exactly one is produced for every host in the
/// input list: success, nonzero exit, or `error` set. A nonzero exit code
/// or a nonempty `error` marks the host as failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Output {
    pub index: usize,
    pub alias: String,
    pub hostname: String,
    pub stdout: String,
    pub stderr: String,
    pub error: String,
    #[serde(rename = "exitcode")]
    pub exit_code: i32,
}

impl Output {
    pub fn failed(&self) -> bool {
        self.exit_code != 0 || !self.error.is_empty()
    }
}

/// Consumes per-host outputs. The executor delivers them serialized and in
/// arrival order; `print` runs once after the output channel closed.
/// Real-time presenters react in `add` and make `print` a no-op; aggregate
/// presenters buffer in `add` and emit in `print`.
pub trait Formatter: Send {
    fn add(&mut self, output: &Output);
    fn print(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_when_exit_or_error() {
        let ok = Output::default();
        assert!(!ok.failed());

        let exit = Output {
            exit_code: 3,
            ..Default::default()
        };
        assert!(exit.failed());

        let error = Output {
            error: "dial refused".to_string(),
            ..Default::default()
        };
        assert!(error.failed());
    }
}
