use super::{Formatter, Output};
use owo_colors::OwoColorize;

// header lines are padded with '=' up to this width
const FILL: usize = 72;

/// Real-time presenter: prints each output as it arrives, one header line
/// per host, colored by severity. `print` is a no-op.
pub struct AnsiFormatter {
    user: String,
    index: usize,
    count: usize,
    digit_width: usize,
}

impl AnsiFormatter {
    pub fn new(user: &str, count: usize) -> Self {
        Self {
            user: user.to_string(),
            index: 0,
            count,
            digit_width: count.to_string().len(),
        }
    }

    fn generate_header(&self, alias: &str) -> String {
        let mut header = format!(
            "{:>width$} / {:>width$} : ",
            self.index,
            self.count,
            width = self.digit_width
        );
        let text = if self.user.is_empty() {
            alias.to_string()
        } else {
            format!("{}@{}", self.user, alias)
        };
        let space = FILL.saturating_sub(header.len());
        let mut sym_count = space.saturating_sub(text.len() + 2) / 2;
        if sym_count <= 3 {
            sym_count = 3;
        }
        header.push_str(&"=".repeat(sym_count));
        header.push(' ');
        header.push_str(&text);
        header.push(' ');
        header.push_str(&"=".repeat(sym_count));
        while header.len() < FILL {
            header.push('=');
        }
        header
    }
}

impl Formatter for AnsiFormatter {
    fn add(&mut self, output: &Output) {
        self.index += 1;
        let header = self.generate_header(&output.alias);
        if self.user == "root" {
            println!("{}", header.red().bold());
        } else {
            println!("{}", header.yellow().bold());
        }
        if !output.stdout.is_empty() {
            println!("{}", output.stdout);
        }
        if !output.stderr.is_empty() {
            println!("{}", output.stderr.red());
        }
        if !output.error.is_empty() {
            println!("{}", output.error.red().on_white());
        }
    }

    fn print(&mut self) {}
}
