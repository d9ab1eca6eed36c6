//! Utilities for running external commands.
//!
//! Every interaction with the kernel (`tc`, `ip`, `iptables`, `brctl`, `conntrack`) goes through a
//! [`Runner`], which offers two call policies:
//!
//! - [`Runner::checked`]: a non-zero exit status is an [`Error::NonZero`] that the caller is
//!   expected to propagate. Used for required setup steps.
//! - [`Runner::tolerant`]: failures are logged to the [`EventSink`] and returned as
//!   [`Outcome::Tolerated`]. Used for cleanup steps that may run against state that is already
//!   gone.
//!
//! The process itself is started by an [`Executor`], so tests and dry runs can substitute the
//! system implementation.

use std::{fmt, io, process::Stdio, sync::Arc};

use async_trait::async_trait;

use crate::events::{EventSink, Level};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("empty command provided")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("command `{command}` returned non-zero status: {}", .output.stderr.trim())]
    NonZero { command: String, output: Output },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `None` if the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// A successful output without any captured text.
    pub fn empty() -> Self {
        Self {
            code: Some(0),
            ..Default::default()
        }
    }

    /// A successful output with the given standard output.
    pub fn with_stdout(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given exit code and standard error.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::Output> for Output {
    fn from(value: std::process::Output) -> Self {
        Self {
            code: value.status.code(),
            stdout: String::from_utf8_lossy(&value.stdout).to_string(),
            stderr: String::from_utf8_lossy(&value.stderr).to_string(),
        }
    }
}

/// Description of an external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
    privileged: bool,
    quiet: bool,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privileged: false,
            quiet: false,
        }
    }

    /// Builds a command from a string, separating args with whitespaces.
    pub fn parse(line: &str) -> Self {
        let mut iter = line.split_ascii_whitespace();
        let program = iter.next().unwrap_or_default();
        Self::new(program).args(iter)
    }

    /// Same as [`Command::parse`], but the command requires root privileges.
    pub fn sudo(line: impl AsRef<str>) -> Self {
        Self::parse(line.as_ref()).privileged()
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

    /// Run with `sudo` unless the current process is already root.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Log the invocation (and tolerated failures) at debug level only. Used for polling and
    /// cleanup commands that would otherwise flood the log.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Starts processes. Returns `Ok` for any process that ran to completion, regardless of its exit
/// status; only failing to start or to wait for the process is an error.
#[async_trait]
pub trait Executor: Send + Sync + fmt::Debug + 'static {
    async fn execute(&self, command: &Command) -> io::Result<Output>;
}

/// Runs commands on the host with [`tokio::process`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

#[async_trait]
impl Executor for SystemExecutor {
    async fn execute(&self, command: &Command) -> io::Result<Output> {
        let needs_sudo = command.is_privileged() && !nix::unistd::geteuid().is_root();

        let mut cmd = if needs_sudo {
            let mut cmd = tokio::process::Command::new("sudo");
            cmd.arg(command.program());
            cmd
        } else {
            tokio::process::Command::new(command.program())
        };

        cmd.args(command.get_args())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output().await?;
        Ok(output.into())
    }
}

/// Executes nothing. Every command succeeds with empty output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

#[async_trait]
impl Executor for DryRunExecutor {
    async fn execute(&self, command: &Command) -> io::Result<Output> {
        tracing::trace!(%command, "dry run, skipping command");
        Ok(Output::empty())
    }
}

/// Result of a command run under the tolerant policy.
#[derive(Debug)]
pub enum Outcome {
    Success(Output),
    Tolerated(Error),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn output(&self) -> Option<&Output> {
        match self {
            Self::Success(output) => Some(output),
            Self::Tolerated(_) => None,
        }
    }
}

/// Runs [`Command`]s through an [`Executor`] with one of the two error policies.
#[derive(Debug, Clone)]
pub struct Runner {
    executor: Arc<dyn Executor>,
    events: Arc<dyn EventSink>,
}

impl Runner {
    pub fn new(executor: Arc<dyn Executor>, events: Arc<dyn EventSink>) -> Self {
        Self { executor, events }
    }

    /// A runner that executes commands on the host.
    pub fn system(events: Arc<dyn EventSink>) -> Self {
        Self::new(Arc::new(SystemExecutor), events)
    }

    /// A runner that only logs commands.
    pub fn dry_run(events: Arc<dyn EventSink>) -> Self {
        Self::new(Arc::new(DryRunExecutor), events)
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    /// Runs the command and returns its output, whatever the exit status.
    pub async fn run(&self, command: &Command) -> Result<Output> {
        if command.program().is_empty() {
            return Err(Error::Empty);
        }

        if command.is_quiet() {
            tracing::debug!(%command, "running command");
        } else {
            tracing::info!(%command, "running command");
        }

        Ok(self.executor.execute(command).await?)
    }

    /// Runs the command, failing on a non-zero exit status.
    pub async fn checked(&self, command: Command) -> Result<Output> {
        let output = self.run(&command).await?;

        if !output.success() {
            tracing::debug!(
                %command,
                ?output.code,
                stderr = output.stderr.trim(),
                "command returned non-zero status"
            );
            return Err(Error::NonZero {
                command: command.to_string(),
                output,
            });
        }

        Ok(output)
    }

    /// Runs the command, logging instead of returning any failure.
    pub async fn tolerant(&self, command: Command) -> Outcome {
        let level = if command.is_quiet() {
            Level::Debug
        } else {
            Level::Warning
        };

        match self.checked(command).await {
            Ok(output) => Outcome::Success(output),
            Err(Error::NonZero { command, output }) => {
                self.events.log(
                    level,
                    &format!(
                        "Command `{command}` finished with status {:?}, error is ignored: {}",
                        output.code,
                        output.stderr.trim().replace('\n', " ")
                    ),
                );
                Outcome::Tolerated(Error::NonZero { command, output })
            }
            Err(e) => {
                self.events.error(&format!("Unable to execute command: {e}"));
                Outcome::Tolerated(e)
            }
        }
    }
}
