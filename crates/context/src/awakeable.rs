// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use waypoint_types::identifiers::AwakeableIdentifier;
use waypoint_types::journal::{Entry, EntryHeader, EntryType};

use crate::Context;
use crate::durable_future::{CancelHandle, DurableFuture, decode};
use crate::error::HandlerError;

impl Context {
    /// Creates a durable promise.
    ///
    /// The returned id can be handed to anyone; resolving or rejecting it through the
    /// scheduler completes the returned future, even if the invocation was suspended or the
    /// process restarted in the meantime.
    pub fn awakeable<T>(
        &self,
    ) -> BoxFuture<'static, Result<(AwakeableIdentifier, DurableFuture<T>), HandlerError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let index = self.reserve_index();
        let ctx = self.clone();
        async move {
            let header = EntryHeader::new(EntryType::Awakeable, "");
            if ctx.replay(index, &header)?.is_none() {
                ctx.append_entry(index, Entry::Awakeable).await?;
            }

            let id = AwakeableIdentifier::new(ctx.invocation_id(), index);
            let result = async move { decode(ctx.await_completion(index).await?) }.boxed();
            Ok((id, DurableFuture::new(index, CancelHandle::Detach, result)))
        }
        .boxed()
    }
}
