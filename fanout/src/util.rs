use color_eyre::eyre::WrapErr;
use color_eyre::Report;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};

static SPACE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s+").expect("space regex should compile"));

/// Returns `before && cmd && after`, dropping empty pieces.
pub fn wrap_cmd(cmd: &str, before: &str, after: &str) -> String {
    let mut wrapped = cmd.to_string();
    if !after.is_empty() {
        if !wrapped.is_empty() {
            wrapped = format!("{} && {}", wrapped, after);
        } else {
            wrapped = after.to_string();
        }
    }
    if !before.is_empty() {
        if !wrapped.is_empty() {
            wrapped = format!("{} && {}", before, wrapped);
        } else {
            wrapped = before.to_string();
        }
    }
    wrapped
}

/// Adds `before &&` in front of cmd.
pub fn wrap_cmd_before(cmd: &str, before: &str) -> String {
    wrap_cmd(cmd, before, "")
}

/// Appends `&& after` to cmd.
pub fn wrap_cmd_after(cmd: &str, after: &str) -> String {
    wrap_cmd(cmd, "", after)
}

/// Splits a string on `\s+`.
pub fn split_by_space(str: &str) -> Vec<String> {
    SPACE_REGEX.split(str).map(String::from).collect()
}

pub fn is_dir(path: impl AsRef<Path>) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Gives the real file path; symlinks resolve to their origin.
pub fn file_path(file: impl AsRef<Path>) -> Result<PathBuf, Report> {
    let file = file.as_ref();
    let meta = std::fs::symlink_metadata(file).wrap_err("stat file")?;
    if meta.file_type().is_symlink() {
        std::fs::canonicalize(file).wrap_err("resolve symlink")
    } else {
        Ok(file.to_path_buf())
    }
}

/// Reads a password from the terminal without echoing it.
pub fn read_passwd() -> Result<String, Report> {
    let mut passwd = String::new();
    terminal::enable_raw_mode().wrap_err("enter raw mode")?;
    let res = loop {
        match event::read() {
            Ok(Event::Key(key)) if key.kind != KeyEventKind::Release => match key.code {
                KeyCode::Enter => break Ok(()),
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                    break Err(color_eyre::eyre::eyre!("interrupted"));
                }
                KeyCode::Backspace => {
                    passwd.pop();
                }
                KeyCode::Char(c) => passwd.push(c),
                _ => {}
            },
            Ok(_) => {}
            Err(e) => break Err(e.into()),
        }
    };
    terminal::disable_raw_mode().wrap_err("leave raw mode")?;
    let mut stdout = std::io::stdout();
    let _ = writeln!(stdout);
    res.map(|_| passwd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_cmd_identities() {
        let befores = ["", "pwd"];
        let cmds = ["", "hostname"];
        let afters = ["", "uptime"];
        let expected = [
            "",
            "uptime",
            "hostname",
            "hostname && uptime",
            "pwd",
            "pwd && uptime",
            "pwd && hostname",
            "pwd && hostname && uptime",
        ];
        for (i, before) in befores.iter().enumerate() {
            for (j, cmd) in cmds.iter().enumerate() {
                for (k, after) in afters.iter().enumerate() {
                    let wrapped = wrap_cmd(cmd, before, after);
                    assert_eq!(
                        wrapped,
                        expected[(i << 2) + (j << 1) + k],
                        "before: {:?}, cmd: {:?}, after: {:?}",
                        before,
                        cmd,
                        after
                    );
                }
            }
        }
    }

    #[test]
    fn wrap_cmd_helpers() {
        assert_eq!(wrap_cmd_before("hostname", "pwd"), "pwd && hostname");
        assert_eq!(wrap_cmd_after("hostname", "uptime"), "hostname && uptime");
        assert_eq!(wrap_cmd_before("hostname", ""), "hostname");
    }

    #[test]
    fn split_on_any_whitespace() {
        assert_eq!(split_by_space("a b\tc\nd"), vec!["a", "b", "c", "d"]);
        assert_eq!(split_by_space("one"), vec!["one"]);
    }
}
