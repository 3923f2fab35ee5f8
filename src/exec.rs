// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External process execution.
//!
//! Every interaction with package managers and native setting tools goes
//! through the [`CommandRunner`] seam. Runs are unattended, so commands never
//! inherit stdin, and their stdout and stderr are captured for logging and
//! failure classification.

use crate::context::{ExecutionContext, Privilege};

use futures::future::BoxFuture;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    process::Stdio,
};
use tokio::process::Command;
use tracing::{debug, instrument};

/// External command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,

    /// Needs elevated privileges to modify the system.
    pub privileged: bool,
}

impl CommandSpec {
    /// Construct new unprivileged command.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privileged: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Mark command as needing elevated privileges.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Construct new command run through the platform shell.
    pub fn shell(script: impl Into<String>) -> Self {
        if cfg!(windows) {
            Self::new("cmd").args(["/C".into(), script.into()])
        } else {
            Self::new("sh").args(["-c".into(), script.into()])
        }
    }
}

impl Display for CommandSpec {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(&self.program)?;
        for arg in &self.args {
            write!(fmt, " {arg}")?;
        }

        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, absent if terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Construct new output of a command that exited with code.
    pub fn exited(code: i32, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Combined stdout and stderr for logging.
    pub fn message(&self) -> String {
        let mut message = String::new();

        if !self.stdout.is_empty() {
            message.push_str(format!("stdout: {}", self.stdout).as_str());
        }

        if !self.stderr.is_empty() {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str(format!("stderr: {}", self.stderr).as_str());
        }

        // INVARIANT: Chomp trailing newlines.
        message
            .strip_suffix("\r\n")
            .or(message.strip_suffix('\n'))
            .map(ToString::to_string)
            .unwrap_or(message)
    }
}

/// Layer of indirection for running external commands.
pub trait CommandRunner: Send + Sync {
    /// Run command to completion under execution context.
    ///
    /// A command that runs but exits unsuccessfully is not an error at this
    /// level. Only failing to run the command at all is.
    fn run<'a>(
        &'a self,
        command: &'a CommandSpec,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<CommandOutput>>;
}

/// Run commands as real processes through tokio.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }

    fn build(command: &CommandSpec, ctx: &ExecutionContext) -> Command {
        let mut process = if command.privileged && ctx.elevates() {
            let mut sudo = Command::new("sudo");
            match &ctx.privilege {
                Privilege::Sudo {
                    askpass: Some(askpass),
                } => {
                    sudo.arg("-A").env("SUDO_ASKPASS", askpass);
                }
                _ => {
                    sudo.arg("-n");
                }
            }
            if !ctx.env.is_empty() {
                let keys = ctx.env.keys().cloned().collect::<Vec<_>>().join(",");
                sudo.arg(format!("--preserve-env={keys}"));
            }
            sudo.arg(&command.program);
            sudo
        } else {
            Command::new(&command.program)
        };

        process
            .args(&command.args)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = ctx.path_override() {
            process.env("PATH", path);
        }

        process
    }
}

impl CommandRunner for SystemRunner {
    fn run<'a>(
        &'a self,
        command: &'a CommandSpec,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<CommandOutput>> {
        Box::pin(run_system(command, ctx))
    }
}

#[instrument(skip(command, ctx), fields(command = %command), level = "debug")]
async fn run_system(command: &CommandSpec, ctx: &ExecutionContext) -> Result<CommandOutput> {
    let output = SystemRunner::build(command, ctx)
        .output()
        .await
        .map_err(|err| ExecError::Spawn {
            source: err,
            program: command.program.clone(),
        })?;

    let output = CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(output.stdout.as_slice()).into_owned(),
        stderr: String::from_utf8_lossy(output.stderr.as_slice()).into_owned(),
    };
    debug!("exit code {:?}", output.code);

    Ok(output)
}

/// Process execution error types.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// Command could not be started at all.
    #[error("failed to run {program:?}")]
    Spawn {
        #[source]
        source: std::io::Error,
        program: String,
    },
}

impl ExecError {
    /// Underlying I/O error kind.
    pub fn io_kind(&self) -> std::io::ErrorKind {
        match self {
            Self::Spawn { source, .. } => source.kind(),
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = ExecError> = std::result::Result<T, E>;
