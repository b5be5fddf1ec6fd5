// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod rsync;

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, StreamExt, TryFutureExt};
use std::{
    fmt, io,
    path::PathBuf,
    process::{ExitStatus, Output, Stdio},
};
use tokio::{
    process::Command,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};
use tokio_util::{
    codec::{BytesCodec, FramedRead},
    sync::CancellationToken,
};

#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("process exited with code: {:?}", .0.code())]
    Status(ExitStatus),
    #[error("{}, stdout: {}, stderr: {}", .0.status, String::from_utf8_lossy(&.0.stdout), String::from_utf8_lossy(&.0.stderr))]
    Output(Output),
    #[error("command was canceled")]
    Canceled,
}

pub trait OutputExt {
    fn stdout_string_lossy(&self) -> String;
    fn stderr_string_lossy(&self) -> String;
}

impl OutputExt for Output {
    fn stdout_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    fn stderr_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait CheckedCommandExt {
    /// Similar to `status`, but returns `Err` if the exit code is non-zero.
    fn checked_status(&mut self) -> BoxFuture<Result<(), CmdError>>;
    /// Similar to `output`, but returns `Err` if the exit code is non-zero.
    fn checked_output(&mut self) -> BoxFuture<Result<Output, CmdError>>;
}

impl CheckedCommandExt for Command {
    fn checked_status(&mut self) -> BoxFuture<Result<(), CmdError>> {
        self.status()
            .err_into()
            .and_then(|x| async move {
                tracing::debug!(status = ?x);

                if x.success() {
                    Ok(())
                } else {
                    Err(CmdError::Status(x))
                }
            })
            .boxed()
    }

    fn checked_output(&mut self) -> BoxFuture<Result<Output, CmdError>> {
        self.output()
            .err_into()
            .and_then(|x| async {
                tracing::debug!(status = ?x.status);

                if x.status.success() {
                    Ok(x)
                } else {
                    Err(CmdError::Output(x))
                }
            })
            .boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub kind: OutputKind,
    pub bytes: Bytes,
}

/// The sinks a running command's output is forwarded into, plus the
/// cancellation signal commands must honor.
///
/// Dropping the receiving half does not fail the command; cancellation is
/// always explicit through the token.
#[derive(Debug, Clone)]
pub struct Streams {
    tx: Option<UnboundedSender<OutputChunk>>,
    cancel: CancellationToken,
}

impl Streams {
    pub fn new(tx: UnboundedSender<OutputChunk>, cancel: CancellationToken) -> Self {
        Self {
            tx: Some(tx),
            cancel,
        }
    }

    /// Discards all output. Still cancelable.
    pub fn dev_null(cancel: CancellationToken) -> Self {
        Self { tx: None, cancel }
    }

    /// A self-contained pair for callers that want to inspect output
    /// directly rather than plumb it to a client.
    pub fn channel() -> (Self, UnboundedReceiver<OutputChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();

        (Self::new(tx, CancellationToken::new()), rx)
    }

    pub fn send(&self, kind: OutputKind, bytes: Bytes) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(OutputChunk { kind, bytes });
        }
    }

    pub fn stdout(&self, text: impl Into<Bytes>) {
        self.send(OutputKind::Stdout, text.into());
    }

    pub fn stderr(&self, text: impl Into<Bytes>) {
        self.send(OutputKind::Stderr, text.into());
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// A fully specified command invocation: program, arguments, environment
/// additions, and working directory. Kept as plain data so executors can be
/// faked and argument construction unit tested.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CmdSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// `bash -c <script>`, the invocation shape every database control
    /// script is driven through.
    pub fn bash(script: impl Into<String>) -> Self {
        Self::new("bash").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());

        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));

        self
    }

    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.envs.push((key.into(), val.into()));

        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());

        self
    }

    fn into_command(self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);

        for (k, v) in &self.envs {
            cmd.env(k, v);
        }

        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }

        cmd
    }
}

impl fmt::Display for CmdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;

        for arg in &self.args {
            write!(f, " {}", arg)?;
        }

        Ok(())
    }
}

/// The seam every external process goes through. Step bodies and agent
/// pipelines receive an `Executor` so tests can substitute a recording fake.
pub trait Executor: Send + Sync {
    /// Runs the command, forwarding its output into `streams` as it is
    /// produced. Non-zero exit is an error.
    fn run_streamed<'a>(
        &'a self,
        spec: CmdSpec,
        streams: &'a Streams,
    ) -> BoxFuture<'a, Result<(), CmdError>>;

    /// Runs the command and returns its collected output. Non-zero exit is
    /// an error carrying the captured output.
    fn run_output<'a>(&'a self, spec: CmdSpec) -> BoxFuture<'a, Result<Output, CmdError>>;
}

/// Spawns commands on this host via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExecutor;

impl Executor for LocalExecutor {
    fn run_streamed<'a>(
        &'a self,
        spec: CmdSpec,
        streams: &'a Streams,
    ) -> BoxFuture<'a, Result<(), CmdError>> {
        async move {
            tracing::info!(cmd = %spec, "running command");

            let program = spec.program.clone();
            let mut cmd = spec.into_command();
            cmd.stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn()?;

            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stdout not captured"))?;
            let stderr = child
                .stderr
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child stderr not captured"))?;

            let done = tokio::select! {
                _ = streams.cancelled() => None,
                status = async {
                    futures::future::join(
                        forward(stdout, OutputKind::Stdout, streams),
                        forward(stderr, OutputKind::Stderr, streams),
                    )
                    .await;

                    child.wait().await
                } => Some(status),
            };

            match done {
                None => {
                    tracing::warn!(cmd = %program, "canceling command");

                    let _ = child.start_kill();
                    let _ = child.wait().await;

                    Err(CmdError::Canceled)
                }
                Some(status) => {
                    let status = status?;

                    if status.success() {
                        Ok(())
                    } else {
                        Err(CmdError::Status(status))
                    }
                }
            }
        }
        .boxed()
    }

    fn run_output<'a>(&'a self, spec: CmdSpec) -> BoxFuture<'a, Result<Output, CmdError>> {
        async move {
            tracing::info!(cmd = %spec, "running command");

            spec.into_command().checked_output().await
        }
        .boxed()
    }
}

async fn forward(reader: impl tokio::io::AsyncRead + Unpin, kind: OutputKind, streams: &Streams) {
    let mut frames = FramedRead::new(reader, BytesCodec::new());

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(bytes) => streams.send(kind, bytes.freeze()),
            Err(e) => {
                tracing::debug!(?e, "error reading child output");

                break;
            }
        }
    }
}
