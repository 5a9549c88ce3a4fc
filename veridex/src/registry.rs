//! Rule pack registry.
//!
//! Holds one registration list per domain. The router selects the first
//! `active` registration; if none is active it falls back to the first
//! registration regardless of status, and an empty list is a routing error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::errors::{ServiceError, ServiceResult};
use crate::rulepack::ValidationMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Active,
    Draining,
    Down,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulePackRegistration {
    pub domain: String,
    pub endpoint: String,
    pub status: RegistrationStatus,
    pub supported_modes: Vec<ValidationMode>,
    pub rule_count: usize,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl RulePackRegistration {
    pub fn supports(&self, mode: ValidationMode) -> bool {
        self.supported_modes.contains(&mode)
    }
}

/// First active registration, else first registration of any status.
pub fn select_registration(
    registrations: &[RulePackRegistration],
) -> Option<&RulePackRegistration> {
    registrations
        .iter()
        .find(|r| r.status == RegistrationStatus::Active)
        .or_else(|| registrations.first())
}

/// Registry lookup surface the router depends on.
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    async fn discover(&self, domain: &str) -> ServiceResult<Vec<RulePackRegistration>>;

    /// Reachability probe; an error here marks the router unhealthy.
    async fn health_check(&self) -> ServiceResult<()>;
}

/// In-process registry; seeded at startup and updated by registration calls.
pub struct InMemoryRegistry {
    registrations: RwLock<HashMap<String, Vec<RulePackRegistration>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        InMemoryRegistry {
            registrations: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, registration: RulePackRegistration) -> ServiceResult<()> {
        if registration.domain.is_empty() {
            return Err(ServiceError::InvalidInput(
                "registration domain must not be empty".to_string(),
            ));
        }
        let mut registrations = self.registrations.write().await;
        registrations
            .entry(registration.domain.clone())
            .or_default()
            .push(registration);
        Ok(())
    }

    pub async fn deregister(&self, domain: &str, endpoint: &str) -> ServiceResult<bool> {
        let mut registrations = self.registrations.write().await;
        let Some(list) = registrations.get_mut(domain) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|r| r.endpoint != endpoint);
        Ok(list.len() != before)
    }

    pub async fn domains(&self) -> Vec<String> {
        self.registrations.read().await.keys().cloned().collect()
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Registry for InMemoryRegistry {
    async fn discover(&self, domain: &str) -> ServiceResult<Vec<RulePackRegistration>> {
        Ok(self
            .registrations
            .read()
            .await
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    async fn health_check(&self) -> ServiceResult<()> {
        Ok(())
    }
}
