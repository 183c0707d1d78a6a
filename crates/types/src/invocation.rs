// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! This module contains all the core types representing a service invocation.

use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use bytestring::ByteString;
use serde_with::serde_as;

use crate::errors::InvocationError;
use crate::identifiers::{EntryIndex, InvocationId, ServiceId, WithInvocationId};
use crate::time::MillisSinceEpoch;

#[derive(Eq, Hash, PartialEq, Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub enum ServiceType {
    Service,
    VirtualObject,
}

impl ServiceType {
    pub fn is_keyed(&self) -> bool {
        matches!(self, ServiceType::VirtualObject)
    }

    pub fn has_state(&self) -> bool {
        self.is_keyed()
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(
    Eq, Hash, PartialEq, Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize,
)]
pub enum HandlerType {
    #[default]
    Exclusive,
    Shared,
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Eq, Hash, PartialEq, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum InvocationTarget {
    Service {
        name: ByteString,
        handler: ByteString,
    },
    VirtualObject {
        name: ByteString,
        key: ByteString,
        handler: ByteString,
        handler_ty: HandlerType,
    },
}

impl InvocationTarget {
    pub fn service(name: impl Into<ByteString>, handler: impl Into<ByteString>) -> Self {
        Self::Service {
            name: name.into(),
            handler: handler.into(),
        }
    }

    pub fn virtual_object(
        name: impl Into<ByteString>,
        key: impl Into<ByteString>,
        handler: impl Into<ByteString>,
        handler_ty: HandlerType,
    ) -> Self {
        Self::VirtualObject {
            name: name.into(),
            key: key.into(),
            handler: handler.into(),
            handler_ty,
        }
    }

    pub fn service_name(&self) -> &ByteString {
        match self {
            InvocationTarget::Service { name, .. } => name,
            InvocationTarget::VirtualObject { name, .. } => name,
        }
    }

    pub fn handler_name(&self) -> &ByteString {
        match self {
            InvocationTarget::Service { handler, .. } => handler,
            InvocationTarget::VirtualObject { handler, .. } => handler,
        }
    }

    pub fn key(&self) -> Option<&ByteString> {
        match self {
            InvocationTarget::Service { .. } => None,
            InvocationTarget::VirtualObject { key, .. } => Some(key),
        }
    }

    pub fn service_ty(&self) -> ServiceType {
        match self {
            InvocationTarget::Service { .. } => ServiceType::Service,
            InvocationTarget::VirtualObject { .. } => ServiceType::VirtualObject,
        }
    }

    pub fn handler_ty(&self) -> Option<HandlerType> {
        match self {
            InvocationTarget::Service { .. } => None,
            InvocationTarget::VirtualObject { handler_ty, .. } => Some(*handler_ty),
        }
    }

    pub fn as_keyed_service_id(&self) -> Option<ServiceId> {
        match self {
            InvocationTarget::Service { .. } => None,
            InvocationTarget::VirtualObject { name, key, .. } => {
                Some(ServiceId::new(name.clone(), key.clone()))
            }
        }
    }

    /// Exclusive handlers of keyed services must hold the key lock while running.
    pub fn requires_exclusive_access(&self) -> bool {
        matches!(
            self,
            InvocationTarget::VirtualObject {
                handler_ty: HandlerType::Exclusive,
                ..
            }
        )
    }

    pub fn can_write_state(&self) -> bool {
        self.requires_exclusive_access()
    }
}

impl fmt::Display for InvocationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvocationTarget::Service { name, handler } => write!(f, "{name}/{handler}"),
            InvocationTarget::VirtualObject {
                name, key, handler, ..
            } => write!(f, "{name}/{key}/{handler}"),
        }
    }
}

/// Outcome of an invocation, retained after completion for whoever awaits it.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResponseResult {
    Success(#[serde_as(as = "serde_with::base64::Base64")] Bytes),
    Failure(InvocationError),
}

impl ResponseResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ResponseResult::Success(_))
    }
}

impl From<Result<Bytes, InvocationError>> for ResponseResult {
    fn from(value: Result<Bytes, InvocationError>) -> Self {
        match value {
            Ok(v) => ResponseResult::Success(v),
            Err(e) => ResponseResult::Failure(e),
        }
    }
}

impl From<ResponseResult> for Result<Bytes, InvocationError> {
    fn from(value: ResponseResult) -> Self {
        match value {
            ResponseResult::Success(v) => Ok(v),
            ResponseResult::Failure(e) => Err(e),
        }
    }
}

/// Where the outcome of an invocation must be delivered, in addition to attached callers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ResponseSink {
    /// Complete the given journal entry of the calling invocation.
    Journal {
        caller: InvocationId,
        entry_index: EntryIndex,
    },
}

/// Request to start a new invocation.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InvocationRequest {
    pub invocation_id: InvocationId,
    pub target: InvocationTarget,
    #[serde_as(as = "serde_with::base64::Base64")]
    pub argument: Bytes,
    pub response_sink: Option<ResponseSink>,
    /// Delay the start of the invocation until this time.
    pub execution_time: Option<MillisSinceEpoch>,
}

impl InvocationRequest {
    pub fn new(target: InvocationTarget, argument: impl Into<Bytes>) -> Self {
        Self {
            invocation_id: InvocationId::generate(),
            target,
            argument: argument.into(),
            response_sink: None,
            execution_time: None,
        }
    }

    pub fn with_invocation_id(mut self, invocation_id: InvocationId) -> Self {
        self.invocation_id = invocation_id;
        self
    }

    pub fn with_response_sink(mut self, sink: ResponseSink) -> Self {
        self.response_sink = Some(sink);
        self
    }

    pub fn with_execution_time(mut self, execution_time: MillisSinceEpoch) -> Self {
        self.execution_time = Some(execution_time);
        self
    }
}

impl WithInvocationId for InvocationRequest {
    fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }
}

/// Lifecycle state of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InvocationStatus {
    /// Waiting for its start time to come.
    Scheduled,
    /// Queued behind another invocation holding the same key.
    Inboxed,
    Running,
    /// Waiting for any of the given journal entries to be completed.
    Suspended { waiting_on: BTreeSet<EntryIndex> },
    Completed,
    Failed,
}

impl InvocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Failed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            InvocationStatus::Scheduled => "scheduled",
            InvocationStatus::Inboxed => "inboxed",
            InvocationStatus::Running => "running",
            InvocationStatus::Suspended { .. } => "suspended",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
        }
    }
}

/// Holds timestamps of the [`InvocationStatus`] transitions.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusTimestamps {
    pub creation_time: MillisSinceEpoch,
    pub modification_time: MillisSinceEpoch,
    pub completed_transition_time: Option<MillisSinceEpoch>,
}

impl StatusTimestamps {
    pub fn init(created_at: MillisSinceEpoch) -> Self {
        Self {
            creation_time: created_at,
            modification_time: created_at,
            completed_transition_time: None,
        }
    }

    pub fn update(&mut self, timestamp: MillisSinceEpoch) {
        self.modification_time = self.modification_time.max(timestamp);
    }
}

/// Durable record of one invocation. It is mutated only by the scheduler.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InvocationMetadata {
    pub invocation_id: InvocationId,
    pub target: InvocationTarget,
    #[serde_as(as = "serde_with::base64::Base64")]
    pub argument: Bytes,
    pub status: InvocationStatus,
    pub outcome: Option<ResponseResult>,
    pub response_sinks: Vec<ResponseSink>,
    /// Monotonic admission order, used to order inboxes when rebuilding them.
    pub inbox_seq: u64,
    /// Number of times the whole invocation was retried after a transient failure.
    pub retry_count: u32,
    pub next_retry_at: Option<MillisSinceEpoch>,
    pub execution_time: Option<MillisSinceEpoch>,
    pub cancel_requested: bool,
    pub timestamps: StatusTimestamps,
}

impl InvocationMetadata {
    pub fn from_request(request: InvocationRequest, inbox_seq: u64) -> Self {
        let now = MillisSinceEpoch::now();
        Self {
            invocation_id: request.invocation_id,
            target: request.target,
            argument: request.argument,
            status: InvocationStatus::Running,
            outcome: None,
            response_sinks: request.response_sink.into_iter().collect(),
            inbox_seq,
            retry_count: 0,
            next_retry_at: None,
            execution_time: request.execution_time,
            cancel_requested: false,
            timestamps: StatusTimestamps::init(now),
        }
    }

    pub fn transition(&mut self, status: InvocationStatus) {
        let now = MillisSinceEpoch::now();
        if status.is_terminal() {
            self.timestamps.completed_transition_time = Some(now);
        }
        self.timestamps.update(now);
        self.status = status;
    }

    pub fn complete(&mut self, outcome: ResponseResult) {
        let status = if outcome.is_success() {
            InvocationStatus::Completed
        } else {
            InvocationStatus::Failed
        };
        self.outcome = Some(outcome);
        self.next_retry_at = None;
        self.transition(status);
    }
}

impl WithInvocationId for InvocationMetadata {
    fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;

    #[test]
    fn only_exclusive_object_handlers_lock_the_key() {
        let exclusive = InvocationTarget::virtual_object("Counter", "a", "add", HandlerType::Exclusive);
        let shared = InvocationTarget::virtual_object("Counter", "a", "get", HandlerType::Shared);
        let service = InvocationTarget::service("Greeter", "greet");

        assert!(exclusive.requires_exclusive_access());
        assert!(!shared.requires_exclusive_access());
        assert!(!service.requires_exclusive_access());
        assert_eq!(
            exclusive.as_keyed_service_id(),
            Some(ServiceId::new("Counter", "a"))
        );
        assert_eq!(service.as_keyed_service_id(), None);
    }

    #[test]
    fn complete_sets_terminal_status() {
        let request = InvocationRequest::new(InvocationTarget::service("Greeter", "greet"), "x");
        let mut metadata = InvocationMetadata::from_request(request, 0);

        metadata.complete(ResponseResult::Failure(InvocationError::new(
            codes::ABORTED,
            "cancelled",
        )));

        assert_eq!(metadata.status, InvocationStatus::Failed);
        assert!(metadata.timestamps.completed_transition_time.is_some());
    }

    #[test]
    fn metadata_serde_round_trip() {
        let request = InvocationRequest::new(
            InvocationTarget::virtual_object("Counter", "k", "add", HandlerType::Exclusive),
            Bytes::from_static(b"{\"n\":1}"),
        );
        let metadata = InvocationMetadata::from_request(request, 7);

        let json = serde_json::to_vec(&metadata).unwrap();
        let back: InvocationMetadata = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
