// /////////////////////////////////////////////////////////////////////////////
// Pipelogiq
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Application and API Key Entities
//!
//! An application is the unit of tenancy: it owns pipelines and worker
//! clients and issues the API keys that authenticate the external HTTP
//! surface. Key issuance itself happens outside the core; the domain only
//! validates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::ApplicationId;

/// An application registered with the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    id: ApplicationId,
    name: String,
    description: Option<String>,
}

impl Application {
    /// Rehydrates an application from its persisted row.
    pub fn from_parts(id: ApplicationId, name: String, description: Option<String>) -> Self {
        Self { id, name, description }
    }

    /// Gets the application identifier.
    pub fn id(&self) -> ApplicationId {
        self.id
    }

    /// Gets the application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Gets the optional free-form description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }
}

/// An opaque API key owned by an application.
///
/// Validation rejects disabled and expired keys. The secret itself is an
/// opaque string; the domain attaches no structure to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub key: String,
    pub application_id: ApplicationId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    /// Checks whether the key is usable at the given instant.
    ///
    /// A key is invalid once disabled or past its expiry; a missing expiry
    /// means the key never expires.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        if self.disabled_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn key(expires_at: Option<DateTime<Utc>>, disabled_at: Option<DateTime<Utc>>) -> ApiKey {
        ApiKey {
            key: "k-123".to_string(),
            application_id: ApplicationId::new(1),
            created_at: Utc::now(),
            expires_at,
            disabled_at,
        }
    }

    #[test]
    fn test_key_without_expiry_is_valid() {
        assert!(key(None, None).is_valid(Utc::now()));
    }

    #[test]
    fn test_disabled_key_is_invalid() {
        let now = Utc::now();
        assert!(!key(None, Some(now)).is_valid(now));
    }

    #[test]
    fn test_expired_key_is_invalid() {
        let now = Utc::now();
        assert!(!key(Some(now - Duration::seconds(1)), None).is_valid(now));
        assert!(key(Some(now + Duration::seconds(1)), None).is_valid(now));
    }
}
