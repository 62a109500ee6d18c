//! Resource provider abstraction.
//!
//! The three resource classes an environment needs (IUTs, execution
//! spaces and log areas) share an identical checkout/checkin shape, so a
//! single [`ResourceProvider`] trait covers all of them, parameterized by
//! [`ResourceKind`]. Concrete providers are built from a [`Ruleset`]
//! through a [`ProviderFactory`], which lets release reconstruct the
//! provider that produced a resource from the resource's `provider_id`.

pub mod pool;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Dataset, Ruleset};

pub use pool::PoolProvider;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Checkin failed: {0}")]
    CheckinFailed(String),

    #[error("Unknown resource: {0}")]
    UnknownResource(String),
}

/// The three resource classes a sub-suite needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Iut,
    ExecutionSpace,
    LogArea,
}

impl ResourceKind {
    /// All resource kinds, in checkout order.
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Iut,
        ResourceKind::ExecutionSpace,
        ResourceKind::LogArea,
    ];

    /// Stable name used in store keys and log output.
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Iut => "iut",
            ResourceKind::ExecutionSpace => "execution_space",
            ResourceKind::LogArea => "log_area",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A resource instance returned by checkout.
///
/// Carries the id of the provider that produced it (so release can route
/// the checkin back) plus provider-specific attributes. Owned by exactly
/// one sub-suite at a time; checkin transfers ownership back to the
/// provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub provider_id: String,
    /// Unique instance identifier within the provider.
    pub identifier: String,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// A provider checks resources out of and back into an external pool.
///
/// `checkout` may suspend while waiting on external capacity. `checkin`
/// is NOT guaranteed to be idempotent; callers must not check the same
/// resource in twice.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Provider id (matches the ruleset it was built from).
    fn id(&self) -> &str;

    /// The resource kind this provider serves.
    fn kind(&self) -> ResourceKind;

    /// Allocate between `minimum` and `maximum` resource instances.
    ///
    /// Fails with [`ProviderError::ProvisioningFailed`] if the minimum
    /// cannot be satisfied within the provider's retry policy.
    async fn checkout(
        &self,
        dataset: &Dataset,
        minimum: usize,
        maximum: usize,
    ) -> ProviderResult<Vec<Resource>>;

    /// Return a resource to the provider's pool or tear it down.
    async fn checkin(&self, resource: Resource) -> ProviderResult<()>;
}

/// A shared, type-erased resource provider.
pub type DynProvider = Arc<dyn ResourceProvider>;

/// Builds providers from rulesets.
///
/// Checkout and release both go through the factory, so a factory must
/// return the same underlying provider state for the same (kind, id) pair
/// or checked-out leases would be invisible to checkin.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, kind: ResourceKind, ruleset: &Ruleset) -> ProviderResult<DynProvider>;
}

/// Factory producing pool-backed providers, cached by (kind, id).
#[derive(Default)]
pub struct PoolProviderFactory {
    cache: Mutex<HashMap<(ResourceKind, String), Arc<PoolProvider>>>,
}

impl PoolProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProviderFactory for PoolProviderFactory {
    fn build(&self, kind: ResourceKind, ruleset: &Ruleset) -> ProviderResult<DynProvider> {
        let mut cache = self.cache.lock().unwrap();
        let provider = cache
            .entry((kind, ruleset.id.clone()))
            .or_insert_with(|| Arc::new(PoolProvider::from_ruleset(kind, ruleset)))
            .clone();
        Ok(provider)
    }
}
