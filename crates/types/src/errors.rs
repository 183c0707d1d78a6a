// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::borrow::Cow;
use std::fmt;
use std::fmt::Formatter;

/// Error type which abstracts away the actual [`std::error::Error`] type. Use this type
/// if you don't know the actual error type or if it is not important.
pub type GenericError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InvocationErrorCode(u16);

impl InvocationErrorCode {
    pub const fn new(code: u16) -> Self {
        InvocationErrorCode(code)
    }
}

impl From<u16> for InvocationErrorCode {
    fn from(value: u16) -> Self {
        InvocationErrorCode(value)
    }
}

impl From<InvocationErrorCode> for u16 {
    fn from(value: InvocationErrorCode) -> Self {
        value.0
    }
}

impl fmt::Display for InvocationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(display_str) = self.display_str() {
            write!(f, "{} {}", self.0, display_str)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl fmt::Debug for InvocationErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

pub mod codes {
    use super::InvocationErrorCode;

    macro_rules! codes {
        ($($name:ident $num:literal $str_name:literal,)*) => {
            $(pub const $name: InvocationErrorCode = InvocationErrorCode($num);)*

            impl InvocationErrorCode {
                pub(super) fn display_str(&self) -> Option<&'static str> {
                    $(if self.0 == $name.0 { return Some($str_name) })*
                    None
                }
            }
        };
    }

    codes!(
        BAD_REQUEST 400 "Bad request",
        NOT_FOUND 404 "Not found",
        ABORTED 409 "Aborted",
        GONE 410 "Gone",
        INTERNAL 500 "Internal",
        RETRIES_EXHAUSTED 503 "Retries exhausted",
        JOURNAL_MISMATCH 570 "Journal mismatch",
    );
}

/// The terminal error value of a failed invocation, step or durable promise.
///
/// `secondary` holds errors that happened while reacting to this error, e.g. failed
/// compensations. They never replace the primary error.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct InvocationError {
    code: InvocationErrorCode,
    message: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    secondary: Vec<InvocationError>,
}

pub const UNKNOWN_INVOCATION_ERROR: InvocationError =
    InvocationError::new_static(codes::INTERNAL, "unknown");

impl Default for InvocationError {
    fn default() -> Self {
        UNKNOWN_INVOCATION_ERROR
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message())?;
        for secondary in &self.secondary {
            write!(f, "\n  caused also: {secondary}")?;
        }
        Ok(())
    }
}

impl std::error::Error for InvocationError {}

impl InvocationError {
    pub const fn new_static(code: InvocationErrorCode, message: &'static str) -> Self {
        Self {
            code,
            message: Cow::Borrowed(message),
            secondary: Vec::new(),
        }
    }

    pub fn new(code: impl Into<InvocationErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: Cow::Owned(message.into()),
            secondary: Vec::new(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, message)
    }

    pub fn service_not_found(service: impl fmt::Display) -> Self {
        Self::new(
            codes::NOT_FOUND,
            format!("Service '{service}' not found. Check whether it is registered."),
        )
    }

    pub fn service_handler_not_found(
        service: impl fmt::Display,
        handler: impl fmt::Display,
    ) -> Self {
        Self::new(
            codes::NOT_FOUND,
            format!("Service handler '{service}/{handler}' not found."),
        )
    }

    pub fn code(&self) -> InvocationErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        self.message.as_ref()
    }

    pub fn secondary(&self) -> &[InvocationError] {
        &self.secondary
    }

    pub fn with_secondary(mut self, secondary: impl IntoIterator<Item = InvocationError>) -> Self {
        self.secondary.extend(secondary);
        self
    }
}

pub const ABORTED_INVOCATION_ERROR: InvocationError =
    InvocationError::new_static(codes::ABORTED, "aborted");

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdDecodeError {
    #[error("bad length")]
    Length,
    #[error("base64 decoding failed")]
    Codec,
    #[error("bad format")]
    Format,
    #[error("type mismatch")]
    TypeMismatch,
    #[error("unrecognized codec version")]
    Version,
}
