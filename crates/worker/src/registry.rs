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
use std::sync::Arc;

use bytestring::ByteString;

use waypoint_context::{Handler, ServiceDefinition};
use waypoint_types::errors::{InvocationError, codes};
use waypoint_types::invocation::{InvocationTarget, ServiceType};

/// The services known to a worker.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    services: HashMap<ByteString, ServiceDefinition>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: ServiceDefinition) -> Self {
        self.register(service);
        self
    }

    /// Registers a service, replacing any service with the same name.
    pub fn register(&mut self, service: ServiceDefinition) {
        self.services.insert(service.name().clone(), service);
    }

    pub fn get(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    /// Looks up the handler of `target`. The returned target carries the handler type
    /// declared by the service definition.
    pub(crate) fn resolve(
        &self,
        target: &InvocationTarget,
    ) -> Result<(InvocationTarget, Arc<dyn Handler>), InvocationError> {
        let service = self
            .get(target.service_name())
            .ok_or_else(|| InvocationError::service_not_found(target.service_name()))?;
        let definition = service.get_handler(target.handler_name()).ok_or_else(|| {
            InvocationError::service_handler_not_found(
                target.service_name(),
                target.handler_name(),
            )
        })?;

        let target = match (service.ty(), target) {
            (ServiceType::Service, InvocationTarget::Service { .. }) => target.clone(),
            (
                ServiceType::VirtualObject,
                InvocationTarget::VirtualObject {
                    name, key, handler, ..
                },
            ) => InvocationTarget::virtual_object(
                name.clone(),
                key.clone(),
                handler.clone(),
                definition.ty,
            ),
            (ServiceType::VirtualObject, InvocationTarget::Service { .. }) => {
                return Err(InvocationError::new(
                    codes::BAD_REQUEST,
                    format!("'{}' is a virtual object and requires a key", service.name()),
                ));
            }
            (ServiceType::Service, InvocationTarget::VirtualObject { .. }) => {
                return Err(InvocationError::new(
                    codes::BAD_REQUEST,
                    format!("'{}' is a service and can't be addressed by key", service.name()),
                ));
            }
        };

        Ok((target, Arc::clone(&definition.handler)))
    }
}
