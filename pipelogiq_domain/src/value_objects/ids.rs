// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Typed Identifiers
//!
//! Strongly-typed identifiers for the control plane's durable entities.
//! Pipelines, stages, and applications are keyed by database-assigned
//! integers; worker clients are keyed by process-generated UUIDs.
//!
//! The newtypes exist so a `StageId` can never be passed where a
//! `PipelineId` is expected — the scheduler and reconciler juggle both in
//! every transaction, and the compiler is the cheapest reviewer.
//!
//! All ids serialize transparently (an integer or a UUID string), so the
//! wire messages and database rows stay free of wrapper noise.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use uuid::Uuid;

use crate::PipelineError;

macro_rules! int_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw database identifier.
            pub fn new(value: i64) -> Self {
                Self(value)
            }

            /// Returns the raw integer value.
            pub fn value(&self) -> i64 {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> i64 {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = PipelineError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.parse::<i64>()
                    .map(Self)
                    .map_err(|_| PipelineError::validation(format!("invalid {}: {:?}", stringify!($name), s)))
            }
        }
    };
}

int_id!(
    /// Identifier of an application (API-key issuer and pipeline owner).
    ApplicationId
);

int_id!(
    /// Identifier of a pipeline.
    PipelineId
);

int_id!(
    /// Identifier of a single stage within a pipeline.
    StageId
);

/// Identifier of a worker client session row.
///
/// Workers are keyed by UUID rather than a database integer so that ids can
/// be minted before the row exists and carried in session material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Generates a fresh random worker id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| PipelineError::validation(format!("invalid WorkerId: {:?}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_id_roundtrip() {
        let id = PipelineId::new(42);
        assert_eq!(id.value(), 42);
        assert_eq!(id.to_string(), "42");
        assert_eq!("42".parse::<PipelineId>().unwrap(), id);
    }

    #[test]
    fn test_int_id_parse_invalid() {
        assert!("forty-two".parse::<StageId>().is_err());
        assert!("".parse::<ApplicationId>().is_err());
    }

    #[test]
    fn test_int_id_serde_transparent() {
        let id = StageId::new(7);
        assert_eq!(serde_json::to_string(&id).unwrap(), "7");
        let back: StageId = serde_json::from_str("7").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_worker_id_unique() {
        let a = WorkerId::new();
        let b = WorkerId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_worker_id_parse_roundtrip() {
        let id = WorkerId::new();
        let parsed: WorkerId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<WorkerId>().is_err());
    }
}
