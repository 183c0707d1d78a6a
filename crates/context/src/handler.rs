// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use waypoint_types::errors::codes;
use waypoint_types::invocation::{HandlerType, ServiceType};

use crate::Context;
use crate::error::HandlerError;

/// User code run by an invocation.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, ctx: Context, input: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>>;
}

/// [`Handler`] working on raw bytes.
pub struct RawHandler<F>(F);

pub fn raw_handler<F, Fut>(f: F) -> RawHandler<F>
where
    F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    RawHandler(f)
}

impl<F, Fut> Handler for RawHandler<F>
where
    F: Fn(Context, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, HandlerError>> + Send + 'static,
{
    fn handle(&self, ctx: Context, input: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> {
        (self.0)(ctx, input).boxed()
    }
}

/// [`Handler`] exchanging json values.
pub struct JsonHandler<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Wraps a typed handler function. The input is decoded from json, an empty input decodes
/// as `null`. Undecodable input fails the invocation with a terminal `BAD_REQUEST`.
pub fn handler<F, Fut, I, O>(f: F) -> JsonHandler<F, I, O>
where
    F: Fn(Context, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    JsonHandler {
        f,
        _types: PhantomData,
    }
}

impl<F, Fut, I, O> Handler for JsonHandler<F, I, O>
where
    F: Fn(Context, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, HandlerError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    fn handle(&self, ctx: Context, input: Bytes) -> BoxFuture<'static, Result<Bytes, HandlerError>> {
        let input = if input.is_empty() {
            serde_json::from_slice::<I>(b"null")
        } else {
            serde_json::from_slice::<I>(&input)
        };
        let input = match input {
            Ok(input) => input,
            Err(err) => {
                let err = HandlerError::terminal(
                    codes::BAD_REQUEST,
                    format!("cannot decode handler input: {err}"),
                );
                return async move { Err(err) }.boxed();
            }
        };

        let fut = (self.f)(ctx, input);
        async move {
            let output = fut.await?;
            Ok(Bytes::from(serde_json::to_vec(&output)?))
        }
        .boxed()
    }
}

#[derive(Clone)]
pub struct HandlerDefinition {
    pub name: ByteString,
    pub ty: HandlerType,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for HandlerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDefinition")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .finish_non_exhaustive()
    }
}

/// A named group of handlers, registered with the worker.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    name: ByteString,
    ty: ServiceType,
    handlers: HashMap<ByteString, HandlerDefinition>,
}

impl ServiceDefinition {
    /// Stateless service, its handlers run concurrently without restrictions.
    pub fn service(name: impl Into<ByteString>) -> Self {
        Self::new(name.into(), ServiceType::Service)
    }

    /// Keyed service. Exclusive handlers run one at a time per key and may write its state.
    pub fn virtual_object(name: impl Into<ByteString>) -> Self {
        Self::new(name.into(), ServiceType::VirtualObject)
    }

    fn new(name: ByteString, ty: ServiceType) -> Self {
        Self {
            name,
            ty,
            handlers: HashMap::new(),
        }
    }

    /// Adds a handler. On virtual objects it is exclusive.
    pub fn with_handler(self, name: impl Into<ByteString>, handler: impl Handler) -> Self {
        self.add(name.into(), HandlerType::Exclusive, Arc::new(handler))
    }

    /// Adds a shared handler: on virtual objects it runs concurrently with other
    /// invocations for the same key and can only read state.
    pub fn with_shared_handler(self, name: impl Into<ByteString>, handler: impl Handler) -> Self {
        self.add(name.into(), HandlerType::Shared, Arc::new(handler))
    }

    fn add(mut self, name: ByteString, ty: HandlerType, handler: Arc<dyn Handler>) -> Self {
        self.handlers.insert(
            name.clone(),
            HandlerDefinition {
                name,
                ty,
                handler,
            },
        );
        self
    }

    pub fn name(&self) -> &ByteString {
        &self.name
    }

    pub fn ty(&self) -> ServiceType {
        self.ty
    }

    pub fn get_handler(&self, name: &str) -> Option<&HandlerDefinition> {
        self.handlers.get(name)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &HandlerDefinition> {
        self.handlers.values()
    }
}
