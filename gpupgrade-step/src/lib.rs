// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

pub mod journal;

pub use journal::Journal;

use futures::Future;
use gpupgrade_cmd::{OutputKind, Streams};
use gpupgrade_idl as idl;
use gpupgrade_idl::{chunk, Message, Status, Substep};
use gpupgrade_utils::{BoxedError, ErrorList};
use std::{io, path::PathBuf};
use tokio::{
    fs::OpenOptions,
    io::AsyncWriteExt,
    sync::mpsc::{self, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("substep {substep} of {step}: {source}")]
    Substep {
        step: idl::Step,
        substep: Substep,
        #[source]
        source: BoxedError,
    },
    #[error("step {step} was canceled by client disconnect")]
    Canceled { step: idl::Step },
    #[error("step {step} failed:\n{errors}")]
    Failed { step: idl::Step, errors: ErrorList },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One invocation of a top-level step.
///
/// Substeps run strictly sequentially. The first failure short-circuits all
/// later [`run`](Step::run) and [`run_conditionally`](Step::run_conditionally)
/// calls; [`always_run`](Step::always_run) still executes so teardown happens
/// on both paths. Every transition is journaled before the next substep can
/// observe it.
pub struct Step {
    id: idl::Step,
    state_dir: PathBuf,
    journal: Journal,
    sender: UnboundedSender<Message>,
    streams: Streams,
    forwarder: JoinHandle<io::Result<()>>,
    cancel: CancellationToken,
    errors: ErrorList,
}

impl Step {
    /// Opens (or creates) the journal for `id` and wires the output
    /// multiplexer: every byte a substep produces is forwarded to the client
    /// as a typed chunk and appended to the step's on-disk log.
    pub async fn begin(
        state_dir: PathBuf,
        id: idl::Step,
        sender: UnboundedSender<Message>,
    ) -> Result<Self, StepError> {
        let journal = Journal::create(state_dir.join(id.name()))?;

        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(journal.dir().join("log"))
            .await?;

        let cancel = CancellationToken::new();
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();

        let client = sender.clone();
        let fwd_cancel = cancel.clone();

        let forwarder = tokio::spawn(async move {
            let mut log = log;

            while let Some(chunk) = chunk_rx.recv().await {
                let gpupgrade_cmd::OutputChunk { kind, bytes } = chunk;

                log.write_all(&bytes).await?;

                let r#type = match kind {
                    OutputKind::Stdout => chunk::Type::Stdout,
                    OutputKind::Stderr => chunk::Type::Stderr,
                };

                if client.send(Message::chunk(r#type, bytes.to_vec())).is_err() {
                    // The client went away; stop the step rather than run on
                    // with nobody watching.
                    fwd_cancel.cancel();
                }
            }

            log.flush().await?;

            Ok(())
        });

        Ok(Self {
            id,
            state_dir,
            journal,
            sender,
            streams: Streams::new(chunk_tx, cancel.clone()),
            forwarder,
            cancel,
            errors: ErrorList::new(),
        })
    }

    pub fn step(&self) -> idl::Step {
        self.id
    }

    pub fn state_dir(&self) -> &PathBuf {
        &self.state_dir
    }

    /// The output sinks handed to substep bodies; also useful for callers
    /// that probe state outside a substep.
    pub fn streams(&self) -> Streams {
        self.streams.clone()
    }

    /// Whether a previous substep already failed.
    pub fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The first fatal error observed so far, if any. Later `run` calls are
    /// short-circuited while this is set.
    pub fn err(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.errors.errors().first().map(|e| e.as_ref())
    }

    pub fn send(&self, message: Message) {
        let _ = self.sender.send(message);
    }

    fn report(&self, substep: Substep, status: Status) {
        tracing::info!(step = %self.id, substep = %substep, status = %status);

        self.send(Message::status(self.id, substep, status));
    }

    /// Runs `body` unless the journal already records `complete` for this
    /// substep, in which case the substep is reported skipped.
    pub async fn run<F, Fut, E>(&mut self, substep: Substep, body: F)
    where
        F: FnOnce(Streams) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxedError>,
    {
        if self.failed() {
            return;
        }

        if self.journal.status(substep) == Some(Status::Complete) {
            self.report(substep, Status::Skipped);

            return;
        }

        self.execute(substep, body).await;
    }

    /// Runs `body` even if this substep previously completed and even after
    /// an earlier failure. Reserved for idempotent teardown.
    pub async fn always_run<F, Fut, E>(&mut self, substep: Substep, body: F)
    where
        F: FnOnce(Streams) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxedError>,
    {
        self.execute(substep, body).await;
    }

    /// Skips (and records skipped) when `condition` is false. The predicate
    /// is evaluated fresh on every invocation, never persisted.
    pub async fn run_conditionally<F, Fut, E>(&mut self, substep: Substep, condition: bool, body: F)
    where
        F: FnOnce(Streams) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxedError>,
    {
        if self.failed() {
            return;
        }

        if !condition {
            if let Err(e) = self.journal.mark(substep, Status::Skipped) {
                self.errors.push(StepError::from(e));

                return;
            }

            self.report(substep, Status::Skipped);

            return;
        }

        self.run(substep, body).await;
    }

    async fn execute<F, Fut, E>(&mut self, substep: Substep, body: F)
    where
        F: FnOnce(Streams) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Into<BoxedError>,
    {
        if self.cancel.is_cancelled() {
            if !self.failed() {
                self.errors.push(StepError::Canceled { step: self.id });
            }

            return;
        }

        if let Err(e) = self.journal.mark(substep, Status::Running) {
            self.errors.push(StepError::from(e));

            return;
        }

        self.report(substep, Status::Running);

        let result = body(self.streams.clone()).await;

        let status = match &result {
            Ok(()) => Status::Complete,
            Err(_) => Status::Failed,
        };

        if let Err(e) = self.journal.mark(substep, status) {
            self.errors.push(StepError::from(e));
        }

        self.report(substep, status);

        if let Err(e) = result {
            self.errors.push(StepError::Substep {
                step: self.id,
                substep,
                source: e.into(),
            });
        }
    }

    /// Flushes the journal and log, closes the stream, and returns the first
    /// fatal error observed (with any teardown errors appended).
    pub async fn finish(self) -> Result<(), StepError> {
        let Step {
            id,
            streams,
            forwarder,
            mut errors,
            ..
        } = self;

        // Closing the last chunk sender lets the forwarder drain and exit.
        drop(streams);

        match forwarder.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errors.push(StepError::from(e)),
            Err(e) => errors.push(StepError::from(io::Error::new(io::ErrorKind::Other, e))),
        }

        errors
            .into_result()
            .map_err(|errors| StepError::Failed { step: id, errors })
    }
}

/// Answers "has `substep` of `step` ever completed?" from the persisted
/// journal of another step. Absence reads as "never run".
pub fn has_run(state_dir: &std::path::Path, step: idl::Step, substep: Substep) -> bool {
    Journal::open(state_dir.join(step.name())).status(substep) == Some(Status::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpupgrade_idl::message::Contents;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn begin(dir: &TempDir, id: idl::Step) -> (Step, UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let step = Step::begin(dir.path().to_path_buf(), id, tx).await.unwrap();

        (step, rx)
    }

    fn statuses(rx: &mut UnboundedReceiver<Message>) -> Vec<(Substep, Status)> {
        let mut out = vec![];

        while let Ok(msg) = rx.try_recv() {
            if let Some(Contents::Status(x)) = msg.contents {
                out.push((x.substep(), x.status()));
            }
        }

        out
    }

    fn boom() -> BoxedError {
        io::Error::new(io::ErrorKind::Other, "boom").into()
    }

    #[tokio::test]
    async fn test_second_run_skips_completed_substeps() {
        let tmp = TempDir::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let (mut step, _rx) = begin(&tmp, idl::Step::Execute).await;
            let count = Arc::clone(&count);

            step.run(Substep::UpgradeMaster, move |_| async move {
                count.fetch_add(1, Ordering::SeqCst);

                Ok::<_, BoxedError>(())
            })
            .await;

            step.finish().await.unwrap();
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_short_circuits_but_always_run_still_executes() {
        let tmp = TempDir::new().unwrap();
        let (mut step, mut rx) = begin(&tmp, idl::Step::Execute).await;

        let later_ran = Arc::new(AtomicUsize::new(0));
        let teardown_ran = Arc::new(AtomicUsize::new(0));

        step.run(Substep::ShutdownSourceCluster, |_| async { Err(boom()) })
            .await;

        {
            let later_ran = Arc::clone(&later_ran);
            step.run(Substep::UpgradeMaster, move |_| async move {
                later_ran.fetch_add(1, Ordering::SeqCst);

                Ok::<_, BoxedError>(())
            })
            .await;
        }

        {
            let teardown_ran = Arc::clone(&teardown_ran);
            step.always_run(Substep::ArchiveLogDirectories, move |_| async move {
                teardown_ran.fetch_add(1, Ordering::SeqCst);

                Ok::<_, BoxedError>(())
            })
            .await;
        }

        let err = step.finish().await.unwrap_err();

        assert_eq!(later_ran.load(Ordering::SeqCst), 0);
        assert_eq!(teardown_ran.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("shutdown_source_cluster"));

        let seen = statuses(&mut rx);
        assert_eq!(
            seen,
            vec![
                (Substep::ShutdownSourceCluster, Status::Running),
                (Substep::ShutdownSourceCluster, Status::Failed),
                (Substep::ArchiveLogDirectories, Status::Running),
                (Substep::ArchiveLogDirectories, Status::Complete),
            ]
        );
    }

    #[tokio::test]
    async fn test_resumption_runs_exactly_the_unfinished_suffix() {
        let tmp = TempDir::new().unwrap();

        // First invocation: s1 completes, s2 fails.
        {
            let (mut step, _rx) = begin(&tmp, idl::Step::Finalize).await;

            step.run(Substep::ShutdownTargetCluster, |_| async {
                Ok::<_, BoxedError>(())
            })
            .await;
            step.run(Substep::UpdateDataDirectories, |_| async { Err(boom()) })
                .await;

            step.finish().await.unwrap_err();
        }

        // Second invocation re-runs only the failed substep and beyond.
        let ran: Arc<std::sync::Mutex<Vec<Substep>>> = Arc::default();

        {
            let (mut step, _rx) = begin(&tmp, idl::Step::Finalize).await;

            for substep in [
                Substep::ShutdownTargetCluster,
                Substep::UpdateDataDirectories,
                Substep::StartTargetCluster,
            ] {
                let ran = Arc::clone(&ran);
                step.run(substep, move |_| async move {
                    ran.lock().unwrap().push(substep);

                    Ok::<_, BoxedError>(())
                })
                .await;
            }

            step.finish().await.unwrap();
        }

        assert_eq!(
            *ran.lock().unwrap(),
            vec![Substep::UpdateDataDirectories, Substep::StartTargetCluster]
        );
    }

    #[tokio::test]
    async fn test_run_conditionally_records_skipped() {
        let tmp = TempDir::new().unwrap();
        let (mut step, mut rx) = begin(&tmp, idl::Step::Revert).await;

        step.run_conditionally(Substep::RestoreSourceCluster, false, |_| async {
            Ok::<_, BoxedError>(())
        })
        .await;

        step.finish().await.unwrap();

        let journal = Journal::open(tmp.path().join("revert"));
        assert_eq!(
            journal.status(Substep::RestoreSourceCluster),
            Some(Status::Skipped)
        );
        assert_eq!(
            statuses(&mut rx),
            vec![(Substep::RestoreSourceCluster, Status::Skipped)]
        );
    }

    #[tokio::test]
    async fn test_has_run_queries_other_steps() {
        let tmp = TempDir::new().unwrap();

        {
            let (mut step, _rx) = begin(&tmp, idl::Step::Execute).await;
            step.run(Substep::StartTargetCluster, |_| async {
                Ok::<_, BoxedError>(())
            })
            .await;
            step.finish().await.unwrap();
        }

        assert!(has_run(
            tmp.path(),
            idl::Step::Execute,
            Substep::StartTargetCluster
        ));
        assert!(!has_run(
            tmp.path(),
            idl::Step::Execute,
            Substep::UpgradePrimaries
        ));
        assert!(!has_run(
            tmp.path(),
            idl::Step::Finalize,
            Substep::StartTargetCluster
        ));
    }

    #[tokio::test]
    async fn test_output_reaches_client_and_log() {
        let tmp = TempDir::new().unwrap();
        let (mut step, mut rx) = begin(&tmp, idl::Step::Execute).await;

        step.run(Substep::UpgradeMaster, |streams| async move {
            streams.stdout("pg_upgrade: ok\n");

            Ok::<_, BoxedError>(())
        })
        .await;

        step.finish().await.unwrap();

        let mut chunk = None;
        while let Ok(msg) = rx.try_recv() {
            if let Some(Contents::Chunk(x)) = msg.contents {
                chunk = Some(x);
            }
        }

        let chunk = chunk.expect("no chunk forwarded to client");
        assert_eq!(chunk.buffer, b"pg_upgrade: ok\n");

        let log = std::fs::read_to_string(tmp.path().join("execute").join("log")).unwrap();
        assert_eq!(log, "pg_upgrade: ok\n");
    }
}
