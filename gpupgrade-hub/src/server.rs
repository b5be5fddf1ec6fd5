// Copyright (c) 2021 DDN. All rights reserved.
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file.

//! The client-facing service. Each step RPC spawns its step body and hands
//! the caller a stream over which every status chunk, byte of captured
//! output, and the terminal response flow in order.

use crate::{
    agent_conns::{self, AgentConn},
    execute, finalize, initialize, revert, HubError,
};
use futures::{future::BoxFuture, FutureExt};
use gpupgrade_cmd::Executor;
use gpupgrade_idl::{
    cli_to_hub_server::CliToHub, ExecuteRequest, FinalizeRequest, InitializeRequest, Message,
    RevertRequest,
};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::{
    mpsc::{self, UnboundedSender},
    Mutex,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

pub struct HubState {
    pub state_dir: PathBuf,
    pub agent_port: u16,
    pub executor: Arc<dyn Executor>,
    conns: Mutex<Option<Vec<AgentConn>>>,
}

impl HubState {
    pub fn new(state_dir: PathBuf, agent_port: u16, executor: Arc<dyn Executor>) -> Self {
        Self {
            state_dir,
            agent_port,
            executor,
            conns: Mutex::new(None),
        }
    }

    /// One persistent connection per agent host, established lazily and
    /// health-checked on reuse.
    pub async fn agent_conns(&self, hostnames: &[String]) -> Result<Vec<AgentConn>, HubError> {
        let mut guard = self.conns.lock().await;

        if let Some(conns) = &*guard {
            agent_conns::ensure_ready(conns).await?;

            return Ok(conns.clone());
        }

        let conns = agent_conns::connect(hostnames, self.agent_port).await?;
        *guard = Some(conns.clone());

        Ok(conns)
    }
}

#[derive(Clone)]
pub struct HubService {
    state: Arc<HubState>,
}

impl HubService {
    pub fn new(state: Arc<HubState>) -> Self {
        Self { state }
    }

    /// Spawns a step body and bridges its messages onto the response
    /// stream. The terminal error, if any, is delivered after every queued
    /// message so the client sees the full transcript first.
    fn serve_step<F>(&self, run: F) -> Response<ReceiverStream<Result<Message, Status>>>
    where
        F: FnOnce(Arc<HubState>, UnboundedSender<Message>) -> BoxFuture<'static, Result<(), HubError>>
            + Send
            + 'static,
    {
        let (tx, rx) = mpsc::channel(64);
        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();

        let bridge_tx = tx.clone();
        let bridge = tokio::spawn(async move {
            while let Some(msg) = msg_rx.recv().await {
                if bridge_tx.send(Ok(msg)).await.is_err() {
                    break;
                }
            }
        });

        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let result = run(state, msg_tx).await;

            let _ = bridge.await;

            if let Err(e) = result {
                tracing::error!(error = %e, "step failed");

                let _ = tx.send(Err(grpc_status(&e))).await;
            }
        });

        Response::new(ReceiverStream::new(rx))
    }
}

fn grpc_status(e: &HubError) -> Status {
    if e.is_precondition_violation() {
        Status::failed_precondition(e.to_string())
    } else {
        Status::internal(e.to_string())
    }
}

#[tonic::async_trait]
impl CliToHub for HubService {
    type InitializeStream = ReceiverStream<Result<Message, Status>>;
    type ExecuteStream = ReceiverStream<Result<Message, Status>>;
    type FinalizeStream = ReceiverStream<Result<Message, Status>>;
    type RevertStream = ReceiverStream<Result<Message, Status>>;

    async fn initialize(
        &self,
        request: Request<InitializeRequest>,
    ) -> Result<Response<Self::InitializeStream>, Status> {
        let request = request.into_inner();

        Ok(self.serve_step(move |state, tx| initialize::initialize(state, request, tx).boxed()))
    }

    async fn execute(
        &self,
        _request: Request<ExecuteRequest>,
    ) -> Result<Response<Self::ExecuteStream>, Status> {
        Ok(self.serve_step(move |state, tx| execute::execute(state, tx).boxed()))
    }

    async fn finalize(
        &self,
        _request: Request<FinalizeRequest>,
    ) -> Result<Response<Self::FinalizeStream>, Status> {
        Ok(self.serve_step(move |state, tx| finalize::finalize(state, tx).boxed()))
    }

    async fn revert(
        &self,
        _request: Request<RevertRequest>,
    ) -> Result<Response<Self::RevertStream>, Status> {
        Ok(self.serve_step(move |state, tx| revert::revert(state, tx).boxed()))
    }
}
