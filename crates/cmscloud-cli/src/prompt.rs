//! Terminal prompts and session callbacks

use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{bail, Result};
use cmscloud_core::callbacks::protected_file_change_message;
use cmscloud_core::{Confirm, SyncCallbacks};
use tracing::warn;

/// Interpret a yes/no answer; empty input picks `default`
pub fn parse_yes_no(input: &str, default: bool) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Ask a question on stdout and read one line from stdin
pub fn prompt(question: &str) -> Result<String> {
    print!("{}", question);
    io::stdout().flush()?;

    let mut input = String::new();
    if io::stdin().lock().read_line(&mut input)? == 0 {
        bail!("No input available");
    }
    Ok(input.trim().to_string())
}

/// Read a password without echoing it
pub fn prompt_password(question: &str) -> Result<String> {
    let password = inquire::Password::new(question)
        .without_confirmation()
        .prompt()?;
    Ok(password)
}

/// Ask until a yes/no answer is given; end of input counts as `default`
pub fn ask_yes_no(question: &str, message: Option<&str>, default: bool) -> bool {
    if let Some(message) = message {
        println!("{}", message);
    }
    let hint = if default { "[Y/n]" } else { "[y/N]" };
    loop {
        match prompt(&format!("{} {} ", question, hint)) {
            Ok(answer) => {
                if let Some(yes) = parse_yes_no(&answer, default) {
                    return yes;
                }
                println!("Please answer yes or no.");
            }
            Err(_) => return default,
        }
    }
}

/// Confirmation on the controlling terminal
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, question: &str, message: Option<&str>, default: bool) -> bool {
        ask_yes_no(question, message, default)
    }
}

/// Session callbacks that report to the terminal
///
/// Protected-file changes are confirmed on stdin when interactive and
/// refused otherwise.
pub struct TerminalCallbacks {
    interactive: bool,
    quiet: bool,
}

impl TerminalCallbacks {
    pub fn new(interactive: bool, quiet: bool) -> Self {
        Self { interactive, quiet }
    }
}

impl SyncCallbacks for TerminalCallbacks {
    fn on_network_error(&self, message: &str) {
        warn!("{}", message);
        if !self.quiet {
            eprintln!("⚠ {}", message);
        }
    }

    fn on_sync_error(&self, message: &str) {
        tracing::error!("{}", message);
        eprintln!("✗ {}", message);
    }

    fn on_protected_file_change(&self, path: &Path) -> bool {
        let message = protected_file_change_message(path);
        if !self.interactive {
            warn!("Refusing change to protected file {:?}", path);
            if !self.quiet {
                eprintln!("⚠ {}", message);
            }
            return false;
        }
        ask_yes_no("Are you sure you want to continue?", Some(&message), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_yes_no() {
        assert_eq!(parse_yes_no("y", false), Some(true));
        assert_eq!(parse_yes_no(" YES\n", false), Some(true));
        assert_eq!(parse_yes_no("n", true), Some(false));
        assert_eq!(parse_yes_no("", true), Some(true));
        assert_eq!(parse_yes_no("", false), Some(false));
        assert_eq!(parse_yes_no("maybe", false), None);
    }

    #[test]
    fn test_non_interactive_refuses_protected_changes() {
        let callbacks = TerminalCallbacks::new(false, true);
        assert!(!callbacks.on_protected_file_change(Path::new("templates/base.html")));
        assert!(!callbacks.should_stop());
    }
}
