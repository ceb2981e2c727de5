//! Command executor.
//!
//! Every external program the agent drives goes through a
//! [`CommandRunner`]. Arguments are always handed to the child process as
//! discrete tokens; nothing here ever builds a shell line. Running a
//! command never fails at this layer: spawn errors, timeouts and policy
//! rejections all come back as a [`CommandOutput`] with a sentinel exit
//! code, and callers decide what a non-zero exit means.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tracing::{event, Level};

use crate::config::ExecConfig;

/// Exit code reported when a command exceeded its timeout (as `timeout(1)`).
pub const EXIT_TIMEOUT: i32 = 124;
/// Exit code reported when a command was refused without being spawned.
pub const EXIT_REJECTED: i32 = 126;
/// Exit code reported when the program could not be spawned.
pub const EXIT_SPAWN_FAILED: i32 = 127;

/// Longest line accepted by [`CommandRunner::run_raw`].
pub const MAX_RAW_LINE: usize = 8192;

/// Characters that make a raw line unsafe. Any occurrence rejects the line.
pub const SHELL_METACHARACTERS: &[char] = &[
    ';', '&', '|', '`', '>', '<', '(', ')', '{', '}', '[', ']', '$', '\\', '"', '\'', '\n', '\r',
];

/// Programs the agent may run when the allowlist is enforced.
pub const DEFAULT_ALLOWLIST: &[&str] = &[
    "virsh",
    "qemu-img",
    "lxc-create",
    "lxc-start",
    "lxc-stop",
    "lxc-destroy",
    "lxc-info",
    "lxc-ls",
    "zfs",
    "nft",
    "ip",
    "sysctl",
    "systemctl",
    "radvd",
    "lvs",
    "lvcreate",
    "lvextend",
    "lvremove",
    "vgs",
    "aws",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("refusing raw command line containing shell metacharacter {0:?}")]
    UnsafeCharacter(char),
    #[error("refusing raw command line of {0} bytes (limit {MAX_RAW_LINE})")]
    LineTooLong(usize),
    #[error("refusing empty command line")]
    EmptyLine,
    #[error("program {0:?} is not in the command allowlist")]
    NotAllowed(String),
    #[error("`{command}` exited with status {code}: {diagnostic}")]
    CommandFailed {
        command: String,
        code: i32,
        diagnostic: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        CommandOutput {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn rejected(reason: &ExecError) -> Self {
        CommandOutput::failed(EXIT_REJECTED, reason.to_string())
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// The text to surface for a failure: stderr, or stdout when stderr is
    /// empty.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

/// One program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Overrides the runner's default timeout.
    pub timeout: Option<Duration>,
    /// Send the child's stdout to this file instead of capturing it.
    pub stdout_file: Option<PathBuf>,
}

impl Invocation {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Invocation {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
            stdout_file: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout_file = Some(path.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // For logs only; this is never handed to a shell.
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Check a legacy raw command line and split it into tokens.
///
/// There is no quoting: a line that would need any is rejected.
pub fn split_raw_line(line: &str) -> Result<Vec<String>, ExecError> {
    if line.len() > MAX_RAW_LINE {
        return Err(ExecError::LineTooLong(line.len()));
    }
    if let Some(c) = line.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return Err(ExecError::UnsafeCharacter(c));
    }
    let tokens: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    if tokens.is_empty() {
        return Err(ExecError::EmptyLine);
    }
    Ok(tokens)
}

#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    async fn run(&self, invocation: Invocation) -> CommandOutput;

    async fn exec(&self, program: &str, args: &[&str]) -> CommandOutput {
        self.run(Invocation::new(program, args.iter().copied())).await
    }

    /// Run `invocation` and turn a non-zero exit into [`ExecError::CommandFailed`]
    /// carrying the command's own diagnostic verbatim.
    async fn checked(&self, invocation: Invocation) -> Result<CommandOutput, ExecError> {
        let command = invocation.to_string();
        let output = self.run(invocation).await;
        if output.success() {
            Ok(output)
        } else {
            Err(ExecError::CommandFailed {
                command,
                code: output.code,
                diagnostic: output.diagnostic().to_string(),
            })
        }
    }

    /// Legacy entry point taking a whole command line.
    ///
    /// Lines containing shell metacharacters are refused with
    /// [`EXIT_REJECTED`] and no process is spawned.
    async fn run_raw(&self, line: &str) -> CommandOutput {
        match split_raw_line(line) {
            Ok(mut tokens) => {
                let program = tokens.remove(0);
                self.run(Invocation::new(&program, tokens)).await
            }
            Err(e) => {
                event!(Level::WARN, error = %e, "Rejected raw command line");
                CommandOutput::rejected(&e)
            }
        }
    }
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    allowlist: Option<BTreeSet<String>>,
    binaries: HashMap<String, PathBuf>,
    default_timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(config: &ExecConfig) -> Self {
        let allowlist = config.enforce_allowlist.then(|| {
            DEFAULT_ALLOWLIST
                .iter()
                .map(|s| s.to_string())
                .chain(config.extra_allowed.iter().cloned())
                .collect()
        });
        SystemRunner {
            allowlist,
            binaries: config.binaries.clone(),
            default_timeout: config.default_timeout(),
        }
    }

    fn check_allowed(&self, program: &str) -> Result<(), ExecError> {
        match &self.allowlist {
            Some(allowed) if !allowed.contains(program) => {
                Err(ExecError::NotAllowed(program.to_string()))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: Invocation) -> CommandOutput {
        if let Err(e) = self.check_allowed(&invocation.program) {
            event!(Level::WARN, error = %e, "Refusing to run command");
            return CommandOutput::rejected(&e);
        }

        let binary = self
            .binaries
            .get(&invocation.program)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(&invocation.program));

        let mut command = tokio::process::Command::new(&binary);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(path) = &invocation.stdout_file {
            match std::fs::File::create(path) {
                Ok(file) => {
                    command.stdout(Stdio::from(file));
                }
                Err(e) => {
                    return CommandOutput::failed(
                        EXIT_SPAWN_FAILED,
                        format!("cannot open {} for output: {e}", path.display()),
                    );
                }
            }
        }

        let timeout = invocation.timeout.or(self.default_timeout);
        event!(Level::DEBUG, ?binary, args = ?invocation.args, ?timeout, "Running command");

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => {
                    // Dropping the future kills the child (kill_on_drop).
                    event!(Level::WARN, %invocation, ?limit, "Command timed out");
                    return CommandOutput::failed(
                        EXIT_TIMEOUT,
                        format!("`{invocation}` timed out after {}s", limit.as_secs_f64()),
                    );
                }
            },
            None => command.output().await,
        };

        match output {
            Ok(output) => {
                let result = CommandOutput {
                    // Killed by a signal: no code.
                    code: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                };
                event!(Level::DEBUG, %invocation, code = result.code, "Command finished");
                result
            }
            Err(e) => {
                event!(Level::WARN, %invocation, error = %e, "Failed to spawn command");
                CommandOutput::failed(
                    EXIT_SPAWN_FAILED,
                    format!("failed to run {}: {e}", binary.display()),
                )
            }
        }
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    //! A scripted [`CommandRunner`] that records invocations instead of
    //! touching the host.

    use super::{CommandOutput, CommandRunner, Invocation};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Script {
        prefix: Vec<String>,
        outputs: Vec<CommandOutput>,
        repeat: bool,
    }

    /// Unscripted commands succeed with empty output. Scripted responses
    /// match on a program-plus-leading-arguments prefix; the most recently
    /// added matching script wins.
    #[derive(Default)]
    pub struct FakeRunner {
        scripts: Mutex<Vec<Script>>,
        calls: Mutex<Vec<Invocation>>,
    }

    impl FakeRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer every matching invocation with `output`.
        pub fn respond(&self, prefix: &[&str], output: CommandOutput) {
            self.push(prefix, vec![output], true);
        }

        /// Answer matching invocations with `outputs` in turn, then fall
        /// through to older scripts.
        pub fn respond_seq(&self, prefix: &[&str], outputs: Vec<CommandOutput>) {
            self.push(prefix, outputs, false);
        }

        fn push(&self, prefix: &[&str], outputs: Vec<CommandOutput>, repeat: bool) {
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            scripts.push(Script {
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                outputs,
                repeat,
            });
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// Recorded invocations rendered as `program arg arg ...`.
        pub fn lines(&self) -> Vec<String> {
            self.calls().iter().map(|i| i.to_string()).collect()
        }

        pub fn ran(&self, line_prefix: &str) -> bool {
            self.lines().iter().any(|l| l.starts_with(line_prefix))
        }

        fn answer(&self, invocation: &Invocation) -> CommandOutput {
            let tokens: Vec<&str> = std::iter::once(invocation.program.as_str())
                .chain(invocation.args.iter().map(String::as_str))
                .collect();
            let mut scripts = self.scripts.lock().unwrap_or_else(|e| e.into_inner());
            for script in scripts.iter_mut().rev() {
                let matches = script.prefix.len() <= tokens.len()
                    && script.prefix.iter().zip(&tokens).all(|(a, b)| a == b);
                if !matches || script.outputs.is_empty() {
                    continue;
                }
                return if script.repeat {
                    script.outputs[0].clone()
                } else {
                    script.outputs.remove(0)
                };
            }
            CommandOutput::ok("")
        }
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, invocation: Invocation) -> CommandOutput {
            let output = self.answer(&invocation);
            if let Some(path) = &invocation.stdout_file {
                if let Err(e) = std::fs::write(path, output.stdout.as_bytes()) {
                    return CommandOutput::failed(super::EXIT_SPAWN_FAILED, e.to_string());
                }
            }
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(invocation);
            output
        }
    }
}
