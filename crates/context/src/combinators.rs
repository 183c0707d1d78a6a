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

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use tracing::{debug, trace};

use waypoint_types::errors::codes;
use waypoint_types::identifiers::EntryIndex;
use waypoint_types::journal::{Entry, EntryHeader, EntryType};

use crate::Context;
use crate::durable_future::{CancelHandle, DurableFuture};
use crate::error::{HandlerError, ReplayMismatchError};

impl Context {
    /// Waits for all `futures`.
    ///
    /// Every member runs to completion. If some failed, the failure of the first one in
    /// member order is returned.
    pub fn all<T>(
        &self,
        futures: Vec<DurableFuture<T>>,
    ) -> BoxFuture<'static, Result<Vec<T>, HandlerError>>
    where
        T: Send + 'static,
    {
        async move {
            let mut values = Vec::with_capacity(futures.len());
            let mut failure = None;
            let mut interruption = None;
            for result in future::join_all(futures).await {
                match result {
                    Ok(value) => values.push(value),
                    Err(err) if err.is_terminal() || err.is_cancelled() => {
                        failure.get_or_insert(err);
                    }
                    Err(err) => {
                        interruption.get_or_insert(err);
                    }
                }
            }
            // suspension or journal divergence win over handler level failures
            match interruption.or(failure) {
                Some(err) => Err(err),
                None => Ok(values),
            }
        }
        .boxed()
    }

    /// Waits for the first of `futures` to finish and returns its position together with
    /// its value or failure.
    ///
    /// The winner is journaled, so replays pick the same one. Losing steps are stopped and
    /// journaled as aborted, losing calls get their callee cancelled.
    pub fn any<T>(
        &self,
        futures: Vec<DurableFuture<T>>,
    ) -> BoxFuture<'static, Result<(usize, T), HandlerError>>
    where
        T: Send + 'static,
    {
        let index = self.reserve_index();
        let ctx = self.clone();
        async move {
            if futures.is_empty() {
                return Err(HandlerError::terminal(
                    codes::BAD_REQUEST,
                    "any() needs at least one future",
                ));
            }
            let header = EntryHeader::new(EntryType::Combinator, "");
            let members: Vec<EntryIndex> = futures.iter().map(DurableFuture::index).collect();

            let (position, result, losers) = match ctx.replay(index, &header)? {
                Some(journaled) => {
                    let Entry::Combinator { winner } = journaled.entry else {
                        return Err(ReplayMismatchError {
                            index,
                            journaled: journaled.entry.header(),
                            issued: header,
                        }
                        .into());
                    };
                    let Some(position) = members.iter().position(|member| *member == winner)
                    else {
                        return Err(ReplayMismatchError {
                            index,
                            journaled: EntryHeader::new(EntryType::Combinator, winner.to_string()),
                            issued: header,
                        }
                        .into());
                    };
                    trace!(journal.index = index, "Replaying winner {winner} of any()");
                    let mut futures = futures;
                    let winning = futures.remove(position);
                    (position, winning.await, futures)
                }
                None => {
                    let (result, position, losers) = future::select_all(futures).await;
                    let result = match result {
                        Err(err) if !(err.is_terminal() || err.is_cancelled()) => return Err(err),
                        result => result,
                    };
                    ctx.append_entry(
                        index,
                        Entry::Combinator {
                            winner: members[position],
                        },
                    )
                    .await?;
                    (position, result, losers)
                }
            };

            ctx.cancel_losers(losers).await;
            result.map(|value| (position, value))
        }
        .boxed()
    }

    /// Waits for `future` at most `timeout`. `None` means the timer won; the future is then
    /// treated like a losing branch of [`Context::any`].
    pub fn select_timeout<T>(
        &self,
        future: DurableFuture<T>,
        timeout: Duration,
    ) -> BoxFuture<'static, Result<Option<T>, HandlerError>>
    where
        T: Send + 'static,
    {
        let timer = self.named_sleep("timeout", timeout);
        let race = self.any(vec![future.map(Some), timer.map(|()| None)]);
        async move { race.await.map(|(_, value)| value) }.boxed()
    }

    async fn cancel_losers<T>(&self, losers: Vec<DurableFuture<T>>) {
        let mut stopping = Vec::new();
        for loser in losers {
            match loser.cancel_handle() {
                CancelHandle::Step(token) => {
                    token.cancel();
                    stopping.push(loser);
                }
                CancelHandle::Call => {
                    let journaled = self.inner.journal.entry(loser.index());
                    if let Some(Entry::Call { callee, .. }) = journaled.map(|entry| entry.entry) {
                        if let Err(err) = self.inner.runtime.cancel(callee).await {
                            debug!("Failed to cancel losing callee {callee}: {err:#}");
                        }
                    }
                }
                CancelHandle::Detach => {}
            }
        }
        // let the stopped steps journal their abortion
        for result in future::join_all(stopping).await {
            if let Err(err) = result {
                if !err.is_cancelled() {
                    debug!("Losing step of any() ended with {err}");
                }
            }
        }
    }
}
