// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use ulid::Ulid;

use waypoint_types::identifiers::{EntryIndex, InvocationId};
use waypoint_types::invocation::{InvocationRequest, InvocationTarget, ResponseSink};
use waypoint_types::journal::{Entry, EntryHeader, EntryType, JournalEntry};
use waypoint_types::time::MillisSinceEpoch;

use crate::Context;
use crate::durable_future::{CancelHandle, DurableFuture, decode};
use crate::error::{HandlerError, ReplayMismatchError};

impl Context {
    /// Invokes `target` and waits for its outcome.
    ///
    /// The callee invocation id is journaled with the call, so a replay neither starts a
    /// second invocation nor loses the first one. Terminal failures of the callee surface as
    /// terminal errors of the returned future.
    pub fn call<Req, Res>(&self, target: InvocationTarget, request: &Req) -> DurableFuture<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned + Send + 'static,
    {
        let index = self.reserve_index();
        let argument = serde_json::to_vec(request).map(Bytes::from);
        let ctx = self.clone();
        let fut = async move {
            let argument = argument?;
            let header = EntryHeader::new(EntryType::Call, target.to_string());
            let callee = match ctx.replay(index, &header)? {
                Some(journaled) => {
                    let callee = journaled_callee(index, &header, &journaled)?;
                    if let Some(result) = journaled.result {
                        return decode(result);
                    }
                    callee
                }
                None => {
                    let callee = InvocationId::generate();
                    ctx.append_entry(
                        index,
                        Entry::Call {
                            target: target.clone(),
                            callee,
                        },
                    )
                    .await?;
                    callee
                }
            };

            // submitting an already known callee only registers the sink again
            let request = InvocationRequest::new(target, argument)
                .with_invocation_id(callee)
                .with_response_sink(ResponseSink::Journal {
                    caller: ctx.invocation_id(),
                    entry_index: index,
                });
            ctx.inner.runtime.submit(request).await?;

            match ctx.await_completion(index).await {
                Ok(result) => decode(result),
                Err(err) => {
                    if err.is_cancelled() {
                        debug!("Propagating cancellation to callee {callee}");
                        ctx.inner.runtime.cancel(callee).await?;
                    }
                    Err(err)
                }
            }
        };
        DurableFuture::new(index, CancelHandle::Call, fut.boxed())
    }

    /// Starts `target` without waiting for it, exactly once. Returns the id of the new
    /// invocation.
    pub fn send<Req>(
        &self,
        target: InvocationTarget,
        request: &Req,
    ) -> BoxFuture<'static, Result<InvocationId, HandlerError>>
    where
        Req: Serialize + ?Sized,
    {
        self.send_inner(target, request, None)
    }

    /// Like [`Context::send`], the callee starts once `delay` has elapsed.
    pub fn send_after<Req>(
        &self,
        target: InvocationTarget,
        request: &Req,
        delay: Duration,
    ) -> BoxFuture<'static, Result<InvocationId, HandlerError>>
    where
        Req: Serialize + ?Sized,
    {
        self.send_inner(target, request, Some(delay))
    }

    fn send_inner<Req>(
        &self,
        target: InvocationTarget,
        request: &Req,
        delay: Option<Duration>,
    ) -> BoxFuture<'static, Result<InvocationId, HandlerError>>
    where
        Req: Serialize + ?Sized,
    {
        let index = self.reserve_index();
        let argument = serde_json::to_vec(request).map(Bytes::from);
        let ctx = self.clone();
        async move {
            let argument = argument?;
            let header = EntryHeader::new(EntryType::OneWayCall, target.to_string());
            if let Some(journaled) = ctx.replay(index, &header)? {
                return journaled_callee(index, &header, &journaled);
            }

            // The id is derived from the journal position: if the process dies between the
            // submission and the append, the replay submits the same invocation again.
            let callee = derived_callee_id(ctx.invocation_id(), index);
            let mut request = InvocationRequest::new(target.clone(), argument)
                .with_invocation_id(callee);
            if let Some(delay) = delay {
                request = request.with_execution_time(MillisSinceEpoch::after(delay));
            }
            ctx.inner.runtime.submit(request).await?;
            ctx.append_entry(index, Entry::OneWayCall { target, callee })
                .await?;
            Ok(callee)
        }
        .boxed()
    }
}

fn derived_callee_id(caller: InvocationId, index: EntryIndex) -> InvocationId {
    let seed = caller.to_random_seed() ^ u64::from(index).rotate_left(32);
    let mut rng = StdRng::seed_from_u64(seed);
    InvocationId::from_ulid(Ulid::from((rng.next_u64(), rng.next_u64())))
}

fn journaled_callee(
    index: EntryIndex,
    issued: &EntryHeader,
    journaled: &JournalEntry,
) -> Result<InvocationId, HandlerError> {
    match &journaled.entry {
        Entry::Call { callee, .. } | Entry::OneWayCall { callee, .. } => Ok(*callee),
        other => Err(ReplayMismatchError {
            index,
            journaled: other.header(),
            issued: issued.clone(),
        }
        .into()),
    }
}
