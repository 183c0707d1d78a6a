// Copyright (c) 2023 - 2026 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Identifiers of invocations, keyed entities and durable promises.
//!
//! User facing ids follow the same scheme: a resource prefix, the `_` separator, a single
//! character codec version and a type specific encoding of the id bytes.

use std::fmt::{self, Display, Formatter};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::mem::size_of;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytestring::ByteString;
use ulid::Ulid;

use crate::errors::IdDecodeError;

/// Index of an entry in the journal of an invocation.
pub type EntryIndex = u32;

pub const ID_RESOURCE_SEPARATOR: char = '_';
const ID_SCHEME_VERSION: char = '1';

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum IdResourceType {
    Invocation,
    Awakeable,
}

impl IdResourceType {
    const fn as_str(&self) -> &'static str {
        match self {
            IdResourceType::Invocation => "inv",
            IdResourceType::Awakeable => "prom",
        }
    }

    /// Splits `input` into the remaining id specific part, checking prefix and version.
    fn strip(self, input: &str) -> Result<&str, IdDecodeError> {
        let (prefix, rest) = input
            .split_once(ID_RESOURCE_SEPARATOR)
            .ok_or(IdDecodeError::Format)?;
        if prefix != self.as_str() {
            return Err(IdDecodeError::TypeMismatch);
        }
        let mut chars = rest.chars();
        match chars.next() {
            Some(ID_SCHEME_VERSION) => Ok(chars.as_str()),
            Some(_) => Err(IdDecodeError::Version),
            None => Err(IdDecodeError::Length),
        }
    }
}

/// Id of a keyed service instance.
///
/// Keyed services are isolated by key: there cannot be two concurrent exclusive
/// invocations for the same service instance (service name, key).
#[derive(
    Eq, Hash, PartialEq, PartialOrd, Ord, Clone, Debug, serde::Serialize, serde::Deserialize,
)]
pub struct ServiceId {
    pub service_name: ByteString,
    pub key: ByteString,
}

impl ServiceId {
    pub fn new(service_name: impl Into<ByteString>, key: impl Into<ByteString>) -> Self {
        Self {
            service_name: service_name.into(),
            key: key.into(),
        }
    }
}

impl Display for ServiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.key)
    }
}

/// InvocationId uniquely identifies one durable execution of a handler.
#[derive(
    Eq,
    Hash,
    PartialEq,
    Clone,
    Copy,
    Debug,
    PartialOrd,
    Ord,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub struct InvocationId(Ulid);

pub trait WithInvocationId {
    /// Returns the invocation id
    fn invocation_id(&self) -> InvocationId;
}

impl InvocationId {
    pub const RAW_BYTES_LEN: usize = size_of::<u128>();

    pub fn generate() -> Self {
        InvocationId(Ulid::new())
    }

    pub const fn from_ulid(ulid: Ulid) -> Self {
        InvocationId(ulid)
    }

    pub fn from_slice(b: &[u8]) -> Result<Self, IdDecodeError> {
        let raw: [u8; Self::RAW_BYTES_LEN] = b.try_into().map_err(|_| IdDecodeError::Length)?;
        Ok(InvocationId(Ulid::from_bytes(raw)))
    }

    pub fn to_bytes(&self) -> [u8; Self::RAW_BYTES_LEN] {
        self.0.to_bytes()
    }

    /// Seed for the deterministic random generator handed to handlers. Stable across
    /// replays of the same invocation.
    pub fn to_random_seed(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.to_bytes().hash(&mut hasher);
        hasher.finish()
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{ID_RESOURCE_SEPARATOR}{ID_SCHEME_VERSION}{}",
            IdResourceType::Invocation.as_str(),
            self.0
        )
    }
}

impl FromStr for InvocationId {
    type Err = IdDecodeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let remaining = IdResourceType::Invocation.strip(input)?;
        let ulid = Ulid::from_string(remaining).map_err(|_| IdDecodeError::Codec)?;
        Ok(InvocationId(ulid))
    }
}

/// Globally addressable id of a durable promise (awakeable).
///
/// The id points at the journal position of the awakeable entry, so resolving it never
/// needs any in-memory state of the process that created it.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde_with::SerializeDisplay,
    serde_with::DeserializeFromStr,
)]
pub struct AwakeableIdentifier {
    invocation_id: InvocationId,
    entry_index: EntryIndex,
}

impl AwakeableIdentifier {
    const RAW_BYTES_LEN: usize = InvocationId::RAW_BYTES_LEN + size_of::<EntryIndex>();

    pub fn new(invocation_id: InvocationId, entry_index: EntryIndex) -> Self {
        Self {
            invocation_id,
            entry_index,
        }
    }

    pub fn invocation_id(&self) -> InvocationId {
        self.invocation_id
    }

    pub fn entry_index(&self) -> EntryIndex {
        self.entry_index
    }

    pub fn into_inner(self) -> (InvocationId, EntryIndex) {
        (self.invocation_id, self.entry_index)
    }
}

impl Display for AwakeableIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf = [0u8; Self::RAW_BYTES_LEN];
        buf[..InvocationId::RAW_BYTES_LEN].copy_from_slice(&self.invocation_id.to_bytes());
        buf[InvocationId::RAW_BYTES_LEN..].copy_from_slice(&self.entry_index.to_be_bytes());
        write!(
            f,
            "{}{ID_RESOURCE_SEPARATOR}{ID_SCHEME_VERSION}{}",
            IdResourceType::Awakeable.as_str(),
            URL_SAFE_NO_PAD.encode(buf)
        )
    }
}

impl FromStr for AwakeableIdentifier {
    type Err = IdDecodeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let remaining = IdResourceType::Awakeable.strip(input)?;
        let buffer = URL_SAFE_NO_PAD
            .decode(remaining)
            .map_err(|_| IdDecodeError::Codec)?;
        if buffer.len() != Self::RAW_BYTES_LEN {
            return Err(IdDecodeError::Length);
        }

        let (id_bytes, index_bytes) = buffer.split_at(InvocationId::RAW_BYTES_LEN);
        let invocation_id = InvocationId::from_slice(id_bytes)?;
        let entry_index = EntryIndex::from_be_bytes(
            index_bytes.try_into().map_err(|_| IdDecodeError::Length)?,
        );

        Ok(Self {
            invocation_id,
            entry_index,
        })
    }
}

#[cfg(any(test, feature = "test-util"))]
mod mocks {
    use super::*;

    impl InvocationId {
        pub fn mock_random() -> Self {
            Self::generate()
        }
    }

    impl ServiceId {
        pub fn mock_random() -> Self {
            Self::new("MyService", Ulid::new().to_string())
        }
    }
}
