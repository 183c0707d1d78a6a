// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use tracing::{Level, info};
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};
use waypoint_types::config::{LogFormat, LogOptions};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot parse log filter: {0}")]
    LogDirectiveParseError(#[from] ParseError),
    #[error("could not install the global log subscriber: {0}")]
    Init(#[from] TryInitError),
}

fn build_logging_layer<S>(opts: &LogOptions) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'span> tracing_subscriber::registry::LookupSpan<'span>,
{
    match opts.format {
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(
                // Write WARN and ERR to stderr, everything else to stdout
                std::io::stderr
                    .with_max_level(Level::WARN)
                    .or_else(std::io::stdout),
            )
            .with_ansi(!opts.disable_ansi_codes)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_ansi(!opts.disable_ansi_codes)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(!opts.disable_ansi_codes)
            .boxed(),
    }
}

/// Installs the global log subscriber. Fails if the filter doesn't parse or if a global
/// subscriber is already installed.
pub fn init_logging(opts: &LogOptions) -> Result<LoggingGuard, Error> {
    let filter = EnvFilter::try_new(&opts.filter)?;
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(build_logging_layer(opts).with_filter(filter))
        .try_init()?;

    Ok(LoggingGuard { reload_handle })
}

#[derive(Debug)]
pub struct LoggingGuard {
    reload_handle: Handle<EnvFilter, Registry>,
}

impl LoggingGuard {
    pub fn reload_log_filter(&self, opts: &LogOptions) -> Result<(), Error> {
        let new_filter = EnvFilter::try_new(&opts.filter)?;
        info!("Setting log filter to '{}'", opts.filter);
        if let Err(e) = self.reload_handle.reload(new_filter) {
            // don't use logging here, the subscriber is gone
            eprintln!("Failed to reload log filter: '{e}'");
        }
        Ok(())
    }
}

/// Creates the span an invocation task runs in.
///
/// ```ignore
/// let span = invocation_span!(id = invocation_id, target = target);
/// ```
#[macro_export]
macro_rules! invocation_span {
    (id = $id:expr, target = $target:expr $(, $($field:tt)*)?) => {
        tracing::info_span!(
            "invoke",
            otel.name = %format!("invoke {}", $target),
            waypoint.invocation.id = %$id,
            rpc.service = %$target.service_name(),
            rpc.method = %$target.handler_name(),
            $($($field)*)?
        )
    };
}
