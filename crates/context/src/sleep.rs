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

use bytestring::ByteString;
use futures::FutureExt;

use waypoint_types::journal::{Entry, EntryHeader, EntryResult, EntryType};
use waypoint_types::time::MillisSinceEpoch;

use crate::Context;
use crate::durable_future::{CancelHandle, DurableFuture};
use crate::error::{CancelledError, HandlerError, TerminalError};

impl Context {
    /// Durable timer. The wake up time is journaled, so the sleep is not restarted by a
    /// replay and keeps counting while the invocation is suspended.
    pub fn sleep(&self, duration: Duration) -> DurableFuture<()> {
        self.named_sleep("", duration)
    }

    pub(crate) fn named_sleep(
        &self,
        name: impl Into<ByteString>,
        duration: Duration,
    ) -> DurableFuture<()> {
        let index = self.reserve_index();
        let name = name.into();
        let ctx = self.clone();
        let fut = async move {
            let header = EntryHeader::new(EntryType::Sleep, name.clone());
            let wake_up_time = match ctx.replay(index, &header)? {
                Some(journaled) => match journaled.entry {
                    Entry::Sleep { wake_up_time, .. } if journaled.result.is_none() => {
                        Some(wake_up_time)
                    }
                    _ => None,
                },
                None => {
                    let wake_up_time = MillisSinceEpoch::after(duration);
                    ctx.append_entry(index, Entry::Sleep { name, wake_up_time })
                        .await?;
                    Some(wake_up_time)
                }
            };
            // registering is idempotent, a replayed pending sleep registers again
            if let Some(wake_up_time) = wake_up_time {
                ctx.inner
                    .runtime
                    .register_timer(ctx.invocation_id(), index, wake_up_time)
                    .await?;
            }

            match ctx.await_completion(index).await? {
                EntryResult::Success(_) => Ok(()),
                EntryResult::Failure(err) => Err(HandlerError::from(TerminalError::from(err))),
                EntryResult::Aborted => Err(CancelledError.into()),
            }
        };
        DurableFuture::new(index, CancelHandle::Detach, fut.boxed())
    }
}
