//! Provider registry.
//!
//! Stores, per test run, which provider was selected for each resource
//! class together with the allocation dataset, plus the registered provider
//! rulesets themselves and the sub-suite records produced by checkout.
//! Everything lives in the key/value [`Store`]:
//!
//! ```text
//! provider/<kind>/<id>                 registered rulesets
//! testrun/<suite_id>/provider/<kind>   selected ruleset snapshot
//! testrun/<suite_id>/dataset           allocation dataset
//! testrun/<suite_id>/suite/<id>        sub-suite records
//! testrun/<suite_id>/lease             per-suite mutual exclusion
//! ```
//!
//! A suite's selection and its sub-suite records form one logical unit:
//! `delete_run` removes the whole `testrun/<suite_id>/` prefix.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{Dataset, Ruleset};
use crate::provider::ResourceKind;
use crate::store::{Store, StoreError};
use crate::suite::SubSuite;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// How long a suite lease may go stale before another caller takes it over.
const LEASE_TTL_SECS: i64 = 3600;

/// Errors that can occur during registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("No such {kind} provider {id:?}")]
    UnknownProvider { kind: ResourceKind, id: String },

    #[error("Suite {0} is busy with another checkout or release")]
    Busy(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Corrupt registry entry {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}

/// The provider selection configured for a suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSelection {
    pub iut: Ruleset,
    pub execution_space: Ruleset,
    pub log_area: Ruleset,
    pub dataset: Dataset,
}

/// Registry of provider rulesets and per-suite configuration.
#[derive(Clone)]
pub struct ProviderRegistry {
    store: Arc<dyn Store>,
}

impl ProviderRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn read_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> RegistryResult<Option<T>> {
        match self.store.read(key)? {
            Some(value) => serde_json::from_str(&value)
                .map(Some)
                .map_err(|source| RegistryError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(&self, key: &str, value: &T) -> RegistryResult<()> {
        let json = serde_json::to_string(value).expect("registry types serialize");
        self.store.write(key, &json)?;
        Ok(())
    }

    /// Register a provider ruleset for a resource kind.
    ///
    /// The mapping is appendable; replacing an existing id is allowed but
    /// never silent.
    pub fn register_provider(&self, kind: ResourceKind, ruleset: &Ruleset) -> RegistryResult<()> {
        let key = format!("provider/{}/{}", kind, ruleset.id);
        if self.store.read(&key)?.is_some() {
            warn!("Replacing already registered {} provider {:?}", kind, ruleset.id);
        }
        self.write_json(&key, ruleset)?;
        debug!("Registered {} provider {:?}", kind, ruleset.id);
        Ok(())
    }

    /// Look up a registered ruleset by id.
    pub fn provider_by_id(&self, kind: ResourceKind, id: &str) -> RegistryResult<Option<Ruleset>> {
        self.read_json(&format!("provider/{kind}/{id}"))
    }

    /// Select providers and a dataset for a suite.
    ///
    /// All three ids must resolve to registered rulesets; the resolved
    /// rulesets are snapshotted into the suite's test run entry.
    pub fn configure(
        &self,
        suite_id: &str,
        iut_provider_id: &str,
        log_area_provider_id: &str,
        execution_space_provider_id: &str,
        dataset: &Dataset,
    ) -> RegistryResult<ProviderSelection> {
        let resolve = |kind: ResourceKind, id: &str| -> RegistryResult<Ruleset> {
            self.provider_by_id(kind, id)?
                .ok_or_else(|| RegistryError::UnknownProvider {
                    kind,
                    id: id.to_string(),
                })
        };
        let selection = ProviderSelection {
            iut: resolve(ResourceKind::Iut, iut_provider_id)?,
            execution_space: resolve(ResourceKind::ExecutionSpace, execution_space_provider_id)?,
            log_area: resolve(ResourceKind::LogArea, log_area_provider_id)?,
            dataset: dataset.clone(),
        };

        self.write_json(
            &format!("testrun/{suite_id}/provider/{}", ResourceKind::Iut),
            &selection.iut,
        )?;
        self.write_json(
            &format!("testrun/{suite_id}/provider/{}", ResourceKind::ExecutionSpace),
            &selection.execution_space,
        )?;
        self.write_json(
            &format!("testrun/{suite_id}/provider/{}", ResourceKind::LogArea),
            &selection.log_area,
        )?;
        self.write_json(&format!("testrun/{suite_id}/dataset"), dataset)?;
        debug!("Configured environment provider for suite {}", suite_id);
        Ok(selection)
    }

    fn selected_provider(
        &self,
        suite_id: &str,
        kind: ResourceKind,
    ) -> RegistryResult<Option<Ruleset>> {
        self.read_json(&format!("testrun/{suite_id}/provider/{kind}"))
    }

    /// The IUT provider selected for a suite, if configured.
    pub fn iut_provider(&self, suite_id: &str) -> RegistryResult<Option<Ruleset>> {
        self.selected_provider(suite_id, ResourceKind::Iut)
    }

    /// The execution space provider selected for a suite, if configured.
    pub fn execution_space_provider(&self, suite_id: &str) -> RegistryResult<Option<Ruleset>> {
        self.selected_provider(suite_id, ResourceKind::ExecutionSpace)
    }

    /// The log area provider selected for a suite, if configured.
    pub fn log_area_provider(&self, suite_id: &str) -> RegistryResult<Option<Ruleset>> {
        self.selected_provider(suite_id, ResourceKind::LogArea)
    }

    /// The allocation dataset configured for a suite, if any.
    pub fn dataset(&self, suite_id: &str) -> RegistryResult<Option<Dataset>> {
        self.read_json(&format!("testrun/{suite_id}/dataset"))
    }

    /// The full provider selection for a suite, if completely configured.
    pub fn selection(&self, suite_id: &str) -> RegistryResult<Option<ProviderSelection>> {
        let (Some(iut), Some(execution_space), Some(log_area), Some(dataset)) = (
            self.iut_provider(suite_id)?,
            self.execution_space_provider(suite_id)?,
            self.log_area_provider(suite_id)?,
            self.dataset(suite_id)?,
        ) else {
            return Ok(None);
        };
        Ok(Some(ProviderSelection {
            iut,
            execution_space,
            log_area,
            dataset,
        }))
    }

    /// Persist a sub-suite record.
    pub fn save_sub_suite(&self, sub_suite: &SubSuite) -> RegistryResult<()> {
        self.write_json(
            &format!("testrun/{}/suite/{}", sub_suite.suite_id, sub_suite.id),
            sub_suite,
        )
    }

    /// Fetch a sub-suite by its id alone.
    pub fn sub_suite(&self, sub_suite_id: &str) -> RegistryResult<Option<SubSuite>> {
        let suffix = format!("/suite/{sub_suite_id}");
        for (key, value) in self.store.read_prefix("testrun/")? {
            if key.ends_with(&suffix) {
                return serde_json::from_str(&value).map(Some).map_err(|source| {
                    RegistryError::Corrupt { key, source }
                });
            }
        }
        Ok(None)
    }

    /// All persisted sub-suites for a suite, in key order.
    pub fn sub_suites(&self, suite_id: &str) -> RegistryResult<Vec<SubSuite>> {
        let mut sub_suites = Vec::new();
        for (key, value) in self
            .store
            .read_prefix(&format!("testrun/{suite_id}/suite/"))?
        {
            sub_suites.push(
                serde_json::from_str(&value)
                    .map_err(|source| RegistryError::Corrupt { key, source })?,
            );
        }
        Ok(sub_suites)
    }

    /// Remove a single sub-suite record.
    pub fn delete_sub_suite(&self, suite_id: &str, sub_suite_id: &str) -> RegistryResult<()> {
        self.store
            .delete(&format!("testrun/{suite_id}/suite/{sub_suite_id}"))?;
        Ok(())
    }

    /// Remove a suite's whole test run entry: selection, dataset,
    /// sub-suites and lease.
    pub fn delete_run(&self, suite_id: &str) -> RegistryResult<()> {
        self.store.delete_prefix(&format!("testrun/{suite_id}/"))?;
        debug!("Deleted test run registry entry for suite {}", suite_id);
        Ok(())
    }

    /// Acquire the per-suite mutual exclusion lease.
    ///
    /// Checkout and release both hold this for their whole duration so
    /// concurrent work on the same suite id fails fast with
    /// [`RegistryError::Busy`] instead of corrupting the run. A lease left
    /// behind by a crashed holder is taken over once it goes stale.
    pub fn lease(&self, suite_id: &str) -> RegistryResult<SuiteLease> {
        let key = format!("testrun/{suite_id}/lease");
        let token = uuid::Uuid::new_v4().to_string();
        let record = LeaseRecord {
            token: token.clone(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string(&record).expect("lease record serializes");

        if !self.store.write_if_absent(&key, &json)? {
            let stale = self
                .read_json::<LeaseRecord>(&key)?
                .map(|existing| {
                    Utc::now() - existing.acquired_at > Duration::seconds(LEASE_TTL_SECS)
                })
                .unwrap_or(true);
            if !stale {
                return Err(RegistryError::Busy(suite_id.to_string()));
            }
            warn!("Taking over stale lease for suite {}", suite_id);
            self.store.write(&key, &json)?;
        }

        Ok(SuiteLease {
            store: self.store.clone(),
            key,
            token,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    token: String,
    acquired_at: DateTime<Utc>,
}

/// Held for the duration of a checkout or release; released on drop.
pub struct SuiteLease {
    store: Arc<dyn Store>,
    key: String,
    token: String,
}

impl Drop for SuiteLease {
    fn drop(&mut self) {
        // Only release a lease we still own; release_full may already have
        // deleted the whole run, or a stale lease may have been taken over.
        match self.store.read(&self.key) {
            Ok(Some(value)) => {
                let ours = serde_json::from_str::<LeaseRecord>(&value)
                    .map(|record| record.token == self.token)
                    .unwrap_or(false);
                if ours {
                    if let Err(error) = self.store.delete(&self.key) {
                        warn!("Failed to release lease {}: {}", self.key, error);
                    }
                }
            }
            Ok(None) => {}
            Err(error) => warn!("Failed to read lease {}: {}", self.key, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn ruleset(id: &str) -> Ruleset {
        Ruleset {
            id: id.to_string(),
            shared: false,
            wait_timeout_secs: 10,
            instances: Vec::new(),
        }
    }

    fn register_all(registry: &ProviderRegistry, id: &str) {
        for kind in ResourceKind::ALL {
            registry.register_provider(kind, &ruleset(id)).unwrap();
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry();
        registry
            .register_provider(ResourceKind::Iut, &ruleset("default"))
            .unwrap();

        let found = registry
            .provider_by_id(ResourceKind::Iut, "default")
            .unwrap();
        assert_eq!(found.unwrap().id, "default");

        // Same id under a different kind is a different entry.
        assert!(registry
            .provider_by_id(ResourceKind::LogArea, "default")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_configure_requires_registered_providers() {
        let registry = registry();
        register_all(&registry, "default");

        let error = registry
            .configure("suite", "default", "missing", "default", &Dataset::default())
            .unwrap_err();
        assert!(matches!(
            error,
            RegistryError::UnknownProvider {
                kind: ResourceKind::LogArea,
                ..
            }
        ));

        // Nothing should have been configured for the suite.
        assert!(registry.dataset("suite").unwrap().is_none());
    }

    #[test]
    fn test_configure_and_read_back() {
        let registry = registry();
        register_all(&registry, "default");

        let dataset = Dataset {
            iut_amount: Some(2),
            ..Dataset::default()
        };
        registry
            .configure("suite", "default", "default", "default", &dataset)
            .unwrap();

        assert_eq!(registry.iut_provider("suite").unwrap().unwrap().id, "default");
        assert_eq!(registry.dataset("suite").unwrap().unwrap(), dataset);
        assert!(registry.selection("suite").unwrap().is_some());

        // An unconfigured suite reads back as absent, not as an error.
        assert!(registry.selection("other").unwrap().is_none());
        assert!(registry.iut_provider("other").unwrap().is_none());
    }

    #[test]
    fn test_sub_suite_round_trip_and_delete_run() {
        let registry = registry();
        let sub_suite = sample_sub_suite("suite", "sub-1");
        registry.save_sub_suite(&sub_suite).unwrap();

        assert!(registry.sub_suite("sub-1").unwrap().is_some());
        assert_eq!(registry.sub_suites("suite").unwrap().len(), 1);

        registry.delete_run("suite").unwrap();
        assert!(registry.sub_suite("sub-1").unwrap().is_none());
        assert!(registry.sub_suites("suite").unwrap().is_empty());
    }

    #[test]
    fn test_lease_excludes_concurrent_holders() {
        let registry = registry();
        let lease = registry.lease("suite").unwrap();

        assert!(matches!(
            registry.lease("suite"),
            Err(RegistryError::Busy(_))
        ));

        drop(lease);
        let _again = registry.lease("suite").unwrap();
    }

    fn sample_sub_suite(suite_id: &str, id: &str) -> SubSuite {
        use crate::provider::{Resource, ResourceKind};

        let resource = |kind| Resource {
            kind,
            provider_id: "default".to_string(),
            identifier: "instance-0".to_string(),
            attributes: serde_json::Map::new(),
        };
        SubSuite {
            id: id.to_string(),
            suite_id: suite_id.to_string(),
            name: "suite_SubSuite_0".to_string(),
            priority: 1,
            test_runner: "runner:latest".to_string(),
            recipes: Vec::new(),
            iut: resource(ResourceKind::Iut),
            executor: resource(ResourceKind::ExecutionSpace),
            log_area: resource(ResourceKind::LogArea),
        }
    }
}
