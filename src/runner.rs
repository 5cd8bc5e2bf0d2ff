//! External command execution
//!
//! Every subprocess siteunit starts (service manager calls, the elevation
//! helper, elevated file placement) goes through a [`CommandRunner`], so
//! install and uninstall can be exercised without touching the system.

use crate::error::{Result, SiteUnitError};
use std::cell::RefCell;
use std::fmt;
use std::process::{Command, Stdio};

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Inherit the terminal, for commands that may prompt for a password
    pub interactive: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            interactive: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn interactive(mut self) -> Self {
        self.interactive = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    /// Shell-quoted command line
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", shell_quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", shell_quote(arg))?;
        }
        Ok(())
    }
}

/// Quote `word` for a POSIX shell; safe words are returned unchanged.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Output from a command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal).
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            success: true,
        }
    }

    /// Check if the command succeeded and return an error if not.
    pub fn ensure_success(&self, command: &CommandSpec) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            let code = self.exit_code.unwrap_or(-1);
            let detail = match self.stderr.trim() {
                "" => self.stdout.trim(),
                stderr => stderr,
            };
            Err(SiteUnitError::Command {
                command: command.to_string(),
                message: format!("exit code {code}: {detail}"),
            })
        }
    }
}

/// Runs external commands
pub trait CommandRunner {
    /// Run `command` to completion. A non-zero exit is not an error here;
    /// callers decide with [`CommandOutput::ensure_success`].
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        tracing::info!("Running: {}", command);

        let spawn_error = |err: std::io::Error| SiteUnitError::Command {
            command: command.to_string(),
            message: err.to_string(),
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);

        let output = if command.interactive {
            // sudo and su talk to the terminal directly
            let status = cmd
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map_err(spawn_error)?;
            CommandOutput {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: status.code(),
                success: status.success(),
            }
        } else {
            let output = cmd
                .stdin(Stdio::inherit())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .map_err(spawn_error)?;
            CommandOutput {
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                exit_code: output.status.code(),
                success: output.status.success(),
            }
        };

        if !output.success {
            tracing::debug!("{} exited with {:?}", command, output.exit_code);
        }
        Ok(output)
    }
}

/// Records commands instead of running them.
///
/// Every command succeeds unless its command line contains a pattern
/// registered with [`RecordingRunner::fail_on`].
#[derive(Debug, Default)]
pub struct RecordingRunner {
    calls: RefCell<Vec<CommandSpec>>,
    failures: RefCell<Vec<(String, i32)>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make commands whose command line contains `pattern` exit with `code`.
    pub fn fail_on(&self, pattern: impl Into<String>, code: i32) {
        self.failures.borrow_mut().push((pattern.into(), code));
    }

    /// Command lines run so far
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(ToString::to_string).collect()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput> {
        let line = command.to_string();
        self.calls.borrow_mut().push(command.clone());
        let failure = self
            .failures
            .borrow()
            .iter()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, code)| *code);

        Ok(match failure {
            Some(code) => CommandOutput {
                stdout: String::new(),
                stderr: format!("{line}: simulated failure"),
                exit_code: Some(code),
                success: false,
            },
            None => CommandOutput::ok(),
        })
    }
}
