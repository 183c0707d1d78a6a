// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;
use bytestring::ByteString;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use waypoint_types::errors::codes;
use waypoint_types::identifiers::ServiceId;
use waypoint_types::journal::{Entry, EntryHeader, EntryType};

use crate::Context;
use crate::error::{HandlerError, ReplayMismatchError};

impl Context {
    /// Reads the keyed state `key` of the current virtual object.
    ///
    /// The value read is journaled, so a replay observes the same value even if the state
    /// was changed by a later invocation in the meantime.
    pub fn get<T>(&self, key: &str) -> BoxFuture<'static, Result<Option<T>, HandlerError>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let index = self.reserve_index();
        let key = ByteString::from(key);
        let ctx = self.clone();
        async move {
            let service_id = ctx.state_service_id(false)?;
            let header = EntryHeader::new(EntryType::GetState, key.clone());
            let value = match ctx.replay(index, &header)? {
                Some(journaled) => match journaled.entry {
                    Entry::GetState { value, .. } => value,
                    other => {
                        return Err(ReplayMismatchError {
                            index,
                            journaled: other.header(),
                            issued: header,
                        }
                        .into());
                    }
                },
                None => {
                    let value = ctx
                        .inner
                        .storage
                        .get_user_state(&service_id, &key)
                        .await?;
                    ctx.append_entry(
                        index,
                        Entry::GetState {
                            key,
                            value: value.clone(),
                        },
                    )
                    .await?;
                    value
                }
            };

            value
                .map(|value| serde_json::from_slice(&value))
                .transpose()
                .map_err(Into::into)
        }
        .boxed()
    }

    /// Stores `value` under `key`. Only exclusive handlers of virtual objects may write.
    pub fn set<T>(&self, key: &str, value: &T) -> BoxFuture<'static, Result<(), HandlerError>>
    where
        T: Serialize + ?Sized,
    {
        let index = self.reserve_index();
        let key = ByteString::from(key);
        let value = serde_json::to_vec(value).map(Bytes::from);
        let ctx = self.clone();
        async move {
            let value = value?;
            let service_id = ctx.state_service_id(true)?;
            let header = EntryHeader::new(EntryType::SetState, key.clone());
            if ctx.replay(index, &header)?.is_none() {
                // the write is applied before it is journaled: a crash in between repeats
                // the same write on replay
                ctx.inner
                    .storage
                    .put_user_state(&service_id, &key, value)
                    .await?;
                ctx.append_entry(index, Entry::SetState { key }).await?;
            }
            Ok(())
        }
        .boxed()
    }

    pub fn clear(&self, key: &str) -> BoxFuture<'static, Result<(), HandlerError>> {
        let index = self.reserve_index();
        let key = ByteString::from(key);
        let ctx = self.clone();
        async move {
            let service_id = ctx.state_service_id(true)?;
            let header = EntryHeader::new(EntryType::ClearState, key.clone());
            if ctx.replay(index, &header)?.is_none() {
                ctx.inner
                    .storage
                    .delete_user_state(&service_id, &key)
                    .await?;
                ctx.append_entry(index, Entry::ClearState { key }).await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn state_service_id(&self, write: bool) -> Result<ServiceId, HandlerError> {
        let target = &self.inner.target;
        let Some(service_id) = target.as_keyed_service_id() else {
            return Err(HandlerError::terminal(
                codes::BAD_REQUEST,
                format!("{target} has no keyed state"),
            ));
        };
        if write && !target.can_write_state() {
            return Err(HandlerError::terminal(
                codes::BAD_REQUEST,
                format!("shared handler {target} cannot modify state"),
            ));
        }
        Ok(service_id)
    }
}
