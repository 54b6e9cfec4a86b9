//! External process invocation, behind a capability trait.
//!
//! The image puller, the CNI driver, and `ip netns` all shell out to
//! external binaries. Routing every invocation through [`CommandRunner`]
//! means tests can substitute a fake executor instead of actually forking,
//! per the design note on external-process wrappers.

use std::collections::HashMap;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Dependency, ErrorKind, Result, RuntimeError};

/// One external process invocation: binary, argv, environment, and
/// optional stdin payload.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub stdin: Option<Vec<u8>>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
            stdin: None,
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    /// Forward the ambient `PATH`/`HOME`/`USER` into the child, per §6 of
    /// the spec, so CNI plugins and image tools resolve binaries the same
    /// way this process does.
    pub fn inherit_ambient_env(mut self) -> Self {
        for key in ["PATH", "HOME", "USER"] {
            if let Ok(value) = std::env::var(key) {
                self.env.entry(key.to_string()).or_insert(value);
            }
        }
        self
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Capability boundary for spawning external processes.
#[async_trait::async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands for real via [`tokio::process::Command`].
pub struct TokioCommandRunner;

#[async_trait::async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|error| {
            RuntimeError::dependency(
                Dependency::ExecFailed,
                format!("failed to spawn {:?}: {error}", spec.program),
            )
        })?;

        if let Some(bytes) = &spec.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(bytes).await.map_err(|error| {
                    RuntimeError::dependency(
                        Dependency::ExecFailed,
                        format!("failed writing stdin to {:?}: {error}", spec.program),
                    )
                })?;
            }
        }
        drop(child.stdin.take());

        let output = child.wait_with_output().await.map_err(|error| {
            RuntimeError::dependency(
                Dependency::ExecFailed,
                format!("failed waiting on {:?}: {error}", spec.program),
            )
        })?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Helper for call sites that only care whether the command succeeded.
pub fn ensure_success(program: &str, output: &CommandOutput) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(RuntimeError::new(
            ErrorKind::Dependency(Dependency::ExecFailed),
            format!(
                "{program} exited with status {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ),
        ))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Records invocations and replays canned outputs in call order, for
    /// tests that need to assert on CNI/image-tool argv without touching
    /// the filesystem or network.
    #[derive(Default)]
    pub struct FakeCommandRunner {
        pub calls: Mutex<Vec<CommandSpec>>,
        pub outputs: Mutex<Vec<CommandOutput>>,
    }

    #[async_trait::async_trait]
    impl CommandRunner for FakeCommandRunner {
        async fn run(&self, spec: CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(spec);
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                Ok(CommandOutput {
                    status: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                })
            } else {
                Ok(outputs.remove(0))
            }
        }
    }
}
