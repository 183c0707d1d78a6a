// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Durable tables backing the journal, invocation metadata and keyed state.
//!
//! Every table is shared between the scheduler and the invocation tasks, hence all
//! operations take `&self` and implementations synchronize internally.

mod file;
mod invocation_status_table;
mod journal_table;
mod memory;
mod state_table;

use std::sync::Arc;

pub use file::FileStorage;
pub use invocation_status_table::InvocationStatusTable;
pub use journal_table::JournalTable;
pub use memory::MemoryStorage;
pub use state_table::StateTable;

use waypoint_types::config::{StorageBackend, StorageOptions};

/// Storage error
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("generic storage error: {0}")]
    Generic(#[from] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to convert rust objects to/from json: {0}")]
    Conversion(#[from] serde_json::Error),
    #[error("integrity constraint is violated: {0}")]
    DataIntegrityError(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// All the tables an invocation needs.
pub trait Storage: JournalTable + InvocationStatusTable + StateTable + 'static {}

impl<T: JournalTable + InvocationStatusTable + StateTable + 'static> Storage for T {}

/// Opens the backend selected by the options.
pub async fn open(options: &StorageOptions) -> Result<Arc<dyn Storage>> {
    match options.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::default())),
        StorageBackend::File => Ok(Arc::new(
            FileStorage::open(options.path.clone(), options.fsync).await?,
        )),
    }
}
