use std::{
    ffi::OsString,
    fmt::Display,
    io::Write,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    time::Duration,
};

use log::{debug, trace, warn};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    time::{sleep_until, timeout_at, Instant},
};

/// Exit code reported for an attempt that was killed by one of the timeouts.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const CHUNK_SIZE: usize = 8192;

/// How often and how long a command may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failed one.
    pub retries: u32,
    /// Wall-clock ceiling of a single attempt.
    pub command_timeout: Duration,
    /// Ceiling on the time since the last byte of output of a single attempt.
    pub output_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, command_timeout: Duration, output_timeout: Duration) -> Self {
        Self {
            retries,
            command_timeout,
            output_timeout,
        }
    }

    /// Same timeouts, single attempt.
    pub fn without_retries(self) -> Self {
        Self { retries: 0, ..self }
    }
}

#[derive(Error, Debug)]
#[error("Failed to run {program}: {source}")]
pub struct SpawnError {
    pub program: String,
    #[source]
    pub source: std::io::Error,
}

/// Exit code and captured output of the last attempt of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub attempts: u32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

enum Timeout {
    Command,
    Output,
}

/// An external command executed with bounded retries and timeouts.
#[derive(Debug, Clone)]
pub struct RetryCommand {
    program: PathBuf,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    forward_output: bool,
}

impl RetryCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            forward_output: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Also copy the output of the child to our own stdout and stderr as it arrives.
    pub fn forward_output(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    /// Runs the command until it succeeds or the retry budget is exhausted.
    ///
    /// A failing child is a regular outcome reported through
    /// [`CommandOutput::exit_code`]; only a command that cannot be spawned at
    /// all is an error, and it is not retried.
    pub fn run(&self, policy: &RetryPolicy) -> Result<CommandOutput, SpawnError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|source| self.spawn_error(source))?;
        runtime.block_on(self.run_attempts(policy))
    }

    async fn run_attempts(&self, policy: &RetryPolicy) -> Result<CommandOutput, SpawnError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            debug!("Running {} (attempt {})", self, attempt);
            let mut output = self.run_once(policy).await?;
            output.attempts = attempt;
            if output.success() {
                return Ok(output);
            }
            if attempt > policy.retries {
                warn!(
                    "{} failed with exit code {} after {} attempt(s)",
                    self, output.exit_code, attempt
                );
                return Ok(output);
            }
            warn!(
                "{} failed with exit code {}, retrying ({} of {})",
                self, output.exit_code, attempt, policy.retries
            );
        }
    }

    async fn run_once(&self, policy: &RetryPolicy) -> Result<CommandOutput, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        let mut child = command.spawn().map_err(|source| self.spawn_error(source))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut output = CommandOutput::default();
        let mut stdout_chunk = [0u8; CHUNK_SIZE];
        let mut stderr_chunk = [0u8; CHUNK_SIZE];

        let deadline = Instant::now() + policy.command_timeout;
        let mut last_output = Instant::now();

        let timed_out = loop {
            if stdout.is_none() && stderr.is_none() {
                break None;
            }
            let idle_deadline = (last_output + policy.output_timeout).min(deadline);
            tokio::select! {
                read = read_chunk(&mut stdout, &mut stdout_chunk) => match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => {
                        last_output = Instant::now();
                        output.stdout.extend_from_slice(&stdout_chunk[..n]);
                        if self.forward_output {
                            let _ = std::io::stdout().write_all(&stdout_chunk[..n]);
                        }
                    }
                },
                read = read_chunk(&mut stderr, &mut stderr_chunk) => match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => {
                        last_output = Instant::now();
                        output.stderr.extend_from_slice(&stderr_chunk[..n]);
                        if self.forward_output {
                            let _ = std::io::stderr().write_all(&stderr_chunk[..n]);
                        }
                    }
                },
                _ = sleep_until(idle_deadline) => {
                    break Some(if idle_deadline >= deadline {
                        Timeout::Command
                    } else {
                        Timeout::Output
                    });
                }
            }
        };

        let status = match timed_out {
            None => match timeout_at(deadline, child.wait()).await {
                Ok(status) => Some(status.map_err(|source| self.spawn_error(source))?),
                Err(_) => {
                    warn!("{} exceeded the command timeout after closing its output", self);
                    None
                }
            },
            Some(Timeout::Command) => {
                warn!(
                    "{} exceeded the command timeout of {}s",
                    self,
                    policy.command_timeout.as_secs()
                );
                None
            }
            Some(Timeout::Output) => {
                warn!(
                    "{} produced no output for {}s",
                    self,
                    policy.output_timeout.as_secs()
                );
                None
            }
        };

        output.exit_code = match status {
            Some(status) => exit_code(status),
            None => {
                if let Err(error) = child.start_kill() {
                    trace!("Could not kill {}: {}", self, error);
                }
                let _ = child.wait().await;
                TIMEOUT_EXIT_CODE
            }
        };
        Ok(output)
    }

    fn spawn_error(&self, source: std::io::Error) -> SpawnError {
        SpawnError {
            program: self.program.display().to_string(),
            source,
        }
    }
}

impl Display for RetryCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "'{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        f.write_str("'")
    }
}

async fn read_chunk<R>(reader: &mut Option<R>, chunk: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(chunk).await,
        None => std::future::pending().await,
    }
}

/// Runs a command once with inherited stdio and returns its exact exit code.
pub fn call_command<I, S>(program: &Path, args: I, cwd: &Path) -> Result<i32, SpawnError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    trace!("Calling {} in {}", program.display(), cwd.display());
    let status = std::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .status()
        .map_err(|source| SpawnError {
            program: program.display().to_string(),
            source,
        })?;
    Ok(exit_code(status))
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
