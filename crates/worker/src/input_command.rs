// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use waypoint_context::InvocationRuntime;
use waypoint_types::errors::InvocationError;
use waypoint_types::identifiers::{AwakeableIdentifier, EntryIndex, InvocationId};
use waypoint_types::invocation::{InvocationMetadata, InvocationRequest, ResponseResult};
use waypoint_types::journal::EntryResult;
use waypoint_types::time::MillisSinceEpoch;

use crate::Error;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, Error>>;

#[derive(Debug)]
pub(crate) enum InputCommand {
    Invoke {
        request: InvocationRequest,
        /// Submitted by a running handler rather than by an external client.
        internal: bool,
        reply: Reply<InvocationId>,
    },
    Attach {
        invocation_id: InvocationId,
        reply: Reply<ResponseResult>,
    },
    CompleteAwakeable {
        awakeable_id: AwakeableIdentifier,
        result: EntryResult,
        reply: Reply<()>,
    },
    Cancel {
        invocation_id: InvocationId,
        reply: Reply<()>,
    },
    Status {
        invocation_id: InvocationId,
        reply: Reply<InvocationMetadata>,
    },
    RegisterTimer {
        invocation_id: InvocationId,
        entry_index: EntryIndex,
        wake_up_time: MillisSinceEpoch,
    },
}

/// Handle to interact with a running [`Worker`](crate::Worker).
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    input: mpsc::Sender<InputCommand>,
}

impl WorkerHandle {
    pub(crate) fn new(input: mpsc::Sender<InputCommand>) -> Self {
        Self { input }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> InputCommand,
    ) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.input
            .send(command(reply))
            .await
            .map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Starts an invocation and returns its id once it is durably accepted. Submitting a
    /// request whose invocation id is already known doesn't start it again.
    pub async fn invoke(&self, request: InvocationRequest) -> Result<InvocationId, Error> {
        self.request(|reply| InputCommand::Invoke {
            request,
            internal: false,
            reply,
        })
        .await
    }

    /// Waits for the outcome of an invocation.
    pub async fn attach(&self, invocation_id: InvocationId) -> Result<ResponseResult, Error> {
        self.request(|reply| InputCommand::Attach {
            invocation_id,
            reply,
        })
        .await
    }

    pub async fn invoke_and_wait(
        &self,
        request: InvocationRequest,
    ) -> Result<ResponseResult, Error> {
        let invocation_id = self.invoke(request).await?;
        self.attach(invocation_id).await
    }

    /// Completes the awakeable with the given payload. Completing it a second time has no
    /// effect.
    pub async fn resolve_awakeable(
        &self,
        awakeable_id: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), Error> {
        self.complete_awakeable(awakeable_id, EntryResult::Success(payload.into()))
            .await
    }

    pub async fn reject_awakeable(
        &self,
        awakeable_id: &str,
        error: InvocationError,
    ) -> Result<(), Error> {
        self.complete_awakeable(awakeable_id, EntryResult::Failure(error))
            .await
    }

    async fn complete_awakeable(&self, awakeable_id: &str, result: EntryResult) -> Result<(), Error> {
        let awakeable_id = awakeable_id.parse::<AwakeableIdentifier>()?;
        self.request(|reply| InputCommand::CompleteAwakeable {
            awakeable_id,
            result,
            reply,
        })
        .await
    }

    /// Requests the cancellation of an invocation. Its pending operations fail with a
    /// cancellation error and its compensations run before it completes.
    pub async fn cancel(&self, invocation_id: InvocationId) -> Result<(), Error> {
        self.request(|reply| InputCommand::Cancel {
            invocation_id,
            reply,
        })
        .await
    }

    pub async fn status(&self, invocation_id: InvocationId) -> Result<InvocationMetadata, Error> {
        self.request(|reply| InputCommand::Status {
            invocation_id,
            reply,
        })
        .await
    }
}

#[async_trait]
impl InvocationRuntime for WorkerHandle {
    async fn submit(&self, request: InvocationRequest) -> anyhow::Result<()> {
        self.request(|reply| InputCommand::Invoke {
            request,
            internal: true,
            reply,
        })
        .await?;
        Ok(())
    }

    async fn cancel(&self, invocation_id: InvocationId) -> anyhow::Result<()> {
        match WorkerHandle::cancel(self, invocation_id).await {
            Ok(()) | Err(Error::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn register_timer(
        &self,
        invocation_id: InvocationId,
        entry_index: EntryIndex,
        wake_up_time: MillisSinceEpoch,
    ) -> anyhow::Result<()> {
        self.input
            .send(InputCommand::RegisterTimer {
                invocation_id,
                entry_index,
                wake_up_time,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        Ok(())
    }
}
