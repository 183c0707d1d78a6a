// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

pub mod chaining;
pub mod evaluator_optimizer;
pub mod human_in_the_loop;
pub mod orchestrator_workers;
pub mod parallelization;
pub mod racing;
pub mod rollback;
pub mod routing;
pub mod tool_agent;

use std::sync::Arc;

use waypoint_context::ServiceDefinition;

use crate::interceptor::{InterceptorChain, LoggingInterceptor};
use crate::model::ModelClient;
use crate::tools::ToolRegistry;
use crate::travel::TravelAgency;

/// Backends shared by the pattern services.
#[derive(Clone)]
pub struct Dependencies {
    pub model: Arc<dyn ModelClient>,
    pub tools: ToolRegistry,
    pub travel: Arc<dyn TravelAgency>,
}

impl Dependencies {
    pub(crate) fn durable_chain(&self) -> InterceptorChain {
        InterceptorChain::durable(Arc::clone(&self.model))
    }

    /// For services journaling each model call as their own named step.
    pub(crate) fn logging_chain(&self) -> InterceptorChain {
        InterceptorChain::new(Arc::clone(&self.model), vec![Arc::new(LoggingInterceptor)])
    }
}

/// Definitions of every pattern service, ready to be registered with a worker.
pub fn services(deps: &Dependencies) -> Vec<ServiceDefinition> {
    vec![
        chaining::definition(deps),
        routing::definition(deps),
        routing::support_agents(deps),
        parallelization::definition(deps),
        orchestrator_workers::definition(deps),
        evaluator_optimizer::definition(deps),
        human_in_the_loop::definition(deps),
        rollback::definition(deps),
        racing::definition(deps),
        tool_agent::definition(deps),
    ]
}
