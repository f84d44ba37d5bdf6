//! Privileged command execution seam
//!
//! Every privileged operation in romtools goes through a [`CommandExecutor`].
//! The host supplies the real root shell ([`ShellExecutor`]); tests supply a
//! [`ScriptedExecutor`]. Nothing else in the crate spawns processes.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::defaults;
use crate::error::ExecError;

/// Raw result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Process exit code (-1 when killed by a signal)
    pub exit_code: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout
    pub fn text(&self) -> &str {
        self.stdout.trim()
    }
}

/// Untyped text I/O with root semantics
pub trait CommandExecutor: Send + Sync {
    /// Run one shell command line and collect its output
    fn execute(&self, command: &str) -> Result<CommandOutput, ExecError>;
}

/// Executes commands through `<shell> -c <command>`
///
/// The default shell is `su`, which is how root is obtained on a rooted
/// device. Use `sh` for an unprivileged host.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Duration,
}

impl ShellExecutor {
    /// Create an executor for the given shell program
    pub fn new(shell: impl Into<String>, timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            timeout,
        }
    }

    /// Shell program in use
    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(
            defaults::DEFAULT_SHELL,
            Duration::from_secs(defaults::COMMAND_TIMEOUT_SECS),
        )
    }
}

impl CommandExecutor for ShellExecutor {
    fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
        tracing::debug!("exec [{}]: {}", self.shell, command);

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::Spawn {
                program: self.shell.clone(),
                error: e.to_string(),
            })?;

        // Drain pipes on helper threads so a chatty child cannot block on a full pipe
        let stdout_reader = child.stdout.take().map(drain);
        let stderr_reader = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ExecError::TimedOut {
                        command: command.to_string(),
                        seconds: self.timeout.as_secs(),
                    });
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(e) => {
                    return Err(ExecError::Io {
                        command: command.to_string(),
                        error: e.to_string(),
                    })
                }
            }
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// Read a pipe to the end; output that is not UTF-8 is kept lossily
fn drain<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            tracing::warn!("Reading command output failed after {} bytes: {}", buf.len(), e);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

type Responder = Box<dyn Fn(&str) -> Result<CommandOutput, ExecError> + Send + Sync>;

/// Deterministic executor answering from a rule table
///
/// Rules match on command prefix; the first matching rule wins. Commands
/// without a matching rule get the fallback (exit 127 unless overridden).
/// Every command is recorded.
pub struct ScriptedExecutor {
    rules: Vec<(String, Responder)>,
    fallback: CommandOutput,
    history: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    /// Create an executor with no rules
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            fallback: CommandOutput::failed(127, "command not found"),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Answer commands starting with `prefix` with a fixed output
    #[must_use]
    pub fn on(self, prefix: &str, output: CommandOutput) -> Self {
        self.on_with(prefix, move |_| Ok(output.clone()))
    }

    /// Answer commands starting with `prefix` through a closure
    #[must_use]
    pub fn on_with<F>(mut self, prefix: &str, responder: F) -> Self
    where
        F: Fn(&str) -> Result<CommandOutput, ExecError> + Send + Sync + 'static,
    {
        self.rules.push((prefix.to_string(), Box::new(responder)));
        self
    }

    /// Answer `getprop <key>` with a value
    #[must_use]
    pub fn prop(self, key: &str, value: &str) -> Self {
        self.on(&format!("getprop {key}"), CommandOutput::ok(format!("{value}\n")))
    }

    /// Output for commands matching no rule
    #[must_use]
    pub fn with_fallback(mut self, output: CommandOutput) -> Self {
        self.fallback = output;
        self
    }

    /// All commands executed so far, in order
    pub fn history(&self) -> Vec<String> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether any executed command starts with `prefix`
    pub fn ran(&self, prefix: &str) -> bool {
        self.history().iter().any(|c| c.starts_with(prefix))
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExecutor")
            .field("rules", &self.rules.iter().map(|(p, _)| p).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl CommandExecutor for ScriptedExecutor {
    fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());

        self.rules
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map_or_else(|| Ok(self.fallback.clone()), |(_, respond)| respond(command))
    }
}

/// Quote a value for inclusion in a shell command line
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
