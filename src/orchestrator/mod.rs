//! Environment checkout and release orchestration.
//!
//! This module drives the full checkout flow for a suite: partition the
//! suite's recipes into sub-suites bounded by available IUTs, check out one
//! IUT, one execution space and one log area per sub-suite, persist each
//! sub-suite in the registry and hand the assembled environment back. The
//! inverse release flow lives in [`release`].

pub mod release;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::Dataset;
use crate::provider::{
    DynProvider, ProviderError, ProviderFactory, Resource, ResourceKind,
};
use crate::registry::{ProviderRegistry, RegistryError};
use crate::splitter::{SplitError, Splitter};
use crate::suite::{group_by_test_runner, SubSuite, SuiteError, SuiteSource};

pub use release::{ReleaseError, ReleaseReport};

/// Result type for checkout operations.
pub type CheckoutResult<T> = Result<T, CheckoutError>;

/// Errors that can fail an environment checkout.
#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error(
        "Environment provider is not configured for suite {0}; \
         configure it before requesting an environment"
    )]
    NotConfigured(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Split(#[from] SplitError),

    #[error(transparent)]
    Suite(#[from] SuiteError),
}

/// The assembled environment for a suite: one sub-suite per execution slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub suite_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlation_ids: Vec<String>,
    pub sub_suites: Vec<SubSuite>,
}

/// Drives environment checkout and release against the selected providers.
#[derive(Clone)]
pub struct EnvironmentOrchestrator {
    registry: ProviderRegistry,
    suite_source: Arc<dyn SuiteSource>,
    factory: Arc<dyn ProviderFactory>,
}

/// The three providers selected for one suite.
struct Providers {
    iut: DynProvider,
    executor: DynProvider,
    log_area: DynProvider,
}

impl Providers {
    fn for_kind(&self, kind: ResourceKind) -> &DynProvider {
        match kind {
            ResourceKind::Iut => &self.iut,
            ResourceKind::ExecutionSpace => &self.executor,
            ResourceKind::LogArea => &self.log_area,
        }
    }
}

impl EnvironmentOrchestrator {
    pub fn new(
        registry: ProviderRegistry,
        suite_source: Arc<dyn SuiteSource>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            registry,
            suite_source,
            factory,
        }
    }

    /// The registry this orchestrator works against.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Check out an environment for a suite.
    ///
    /// Holds the suite lease for the whole flow. Any failure rolls the
    /// request back: resources already acquired are checked back in and
    /// sub-suite records already persisted are removed, so a failed
    /// request leaves no orphaned leases behind.
    pub async fn request_environment(
        &self,
        suite_id: &str,
        correlation_ids: &[String],
    ) -> CheckoutResult<Environment> {
        let _lease = self.registry.lease(suite_id)?;
        let selection = self
            .registry
            .selection(suite_id)?
            .ok_or_else(|| CheckoutError::NotConfigured(suite_id.to_string()))?;

        let providers = Providers {
            iut: self.factory.build(ResourceKind::Iut, &selection.iut)?,
            executor: self
                .factory
                .build(ResourceKind::ExecutionSpace, &selection.execution_space)?,
            log_area: self.factory.build(ResourceKind::LogArea, &selection.log_area)?,
        };

        let mut acquired: Vec<Resource> = Vec::new();
        let mut persisted: Vec<String> = Vec::new();
        match self
            .checkout(
                suite_id,
                correlation_ids,
                &selection.dataset,
                &providers,
                &mut acquired,
                &mut persisted,
            )
            .await
        {
            Ok(environment) => Ok(environment),
            Err(error) => {
                warn!("Environment checkout failed for suite {}: {}", suite_id, error);
                self.rollback(suite_id, &providers, acquired, persisted).await;
                Err(error)
            }
        }
    }

    async fn checkout(
        &self,
        suite_id: &str,
        correlation_ids: &[String],
        dataset: &Dataset,
        providers: &Providers,
        acquired: &mut Vec<Resource>,
        persisted: &mut Vec<String>,
    ) -> CheckoutResult<Environment> {
        let suites = self.suite_source.test_suite(suite_id).await?;
        let suite = suites
            .first()
            .ok_or_else(|| SuiteError::NoDefinitions(suite_id.to_string()))?;
        if suites.len() > 1 {
            warn!(
                "Suite {} has {} definitions; only {:?} is provisioned",
                suite_id,
                suites.len(),
                suite.name
            );
        }

        let mut runners = group_by_test_runner(suite);
        let total: usize = runners.values().map(|r| r.unsplit_recipes.len()).sum();
        let runner_count = runners
            .values()
            .filter(|r| !r.unsplit_recipes.is_empty())
            .count();
        info!("Total test count : {}", total);
        info!("Total testrunners: {}", runner_count);

        if total == 0 {
            return Ok(Environment {
                suite_name: suite.name.clone(),
                correlation_ids: correlation_ids.to_vec(),
                sub_suites: Vec::new(),
            });
        }

        // One IUT is the floor per runner; the dataset caps the surplus
        // inside the provider.
        let iuts = providers.iut.checkout(dataset, runner_count, total).await?;
        acquired.extend(iuts.iter().cloned());
        debug!("Checked out {} IUT(s) for suite {}", iuts.len(), suite_id);

        let splitter = Splitter::new(total);
        let unused = splitter.assign_iuts(&mut runners, iuts)?;
        for iut in unused {
            self.discard(providers, acquired, iut).await;
        }

        for runner in runners.values_mut() {
            if runner.slots.is_empty() {
                continue;
            }
            let needed = runner.slots.len();
            let executors = providers.executor.checkout(dataset, needed, needed).await?;
            acquired.extend(executors.iter().cloned());

            let mut executors = executors.into_iter();
            for slot in runner.slots.iter_mut() {
                slot.executor = executors.next();
            }
            for surplus in executors {
                self.discard(providers, acquired, surplus).await;
            }

            // An IUT that ended up without an executor is returned rather
            // than scheduled.
            let slots = std::mem::take(&mut runner.slots);
            for slot in slots {
                if slot.executor.is_some() {
                    runner.slots.push(slot);
                } else {
                    self.discard(providers, acquired, slot.iut).await;
                }
            }
            runner.number_of_iuts = runner.slots.len();

            for slot in runner.slots.iter_mut() {
                let log_area = providers
                    .log_area
                    .checkout(dataset, 1, 1)
                    .await?
                    .pop()
                    .ok_or_else(|| {
                        ProviderError::ProvisioningFailed(
                            "log area provider returned no instance".to_string(),
                        )
                    })?;
                acquired.push(log_area.clone());
                slot.log_area = Some(log_area);
            }

            splitter.split(runner);
        }

        let mut sub_suites = Vec::new();
        for runner in runners.values() {
            for slot in &runner.slots {
                let (Some(executor), Some(log_area)) = (&slot.executor, &slot.log_area) else {
                    continue;
                };
                if slot.recipes.is_empty() {
                    continue;
                }
                let sub_suite = SubSuite {
                    id: uuid::Uuid::new_v4().to_string(),
                    suite_id: suite_id.to_string(),
                    name: format!("{}_SubSuite_{}", suite.name, sub_suites.len()),
                    priority: runner.priority,
                    test_runner: runner.name.clone(),
                    recipes: slot.recipes.clone(),
                    iut: slot.iut.clone(),
                    executor: executor.clone(),
                    log_area: log_area.clone(),
                };
                self.registry.save_sub_suite(&sub_suite)?;
                persisted.push(sub_suite.id.clone());
                sub_suites.push(sub_suite);
            }
        }

        info!(
            "Checked out environment with {} sub suite(s) for suite {}",
            sub_suites.len(),
            suite_id
        );
        Ok(Environment {
            suite_name: suite.name.clone(),
            correlation_ids: correlation_ids.to_vec(),
            sub_suites,
        })
    }

    /// Check a resource back in and stop tracking it for rollback.
    async fn discard(
        &self,
        providers: &Providers,
        acquired: &mut Vec<Resource>,
        resource: Resource,
    ) {
        acquired.retain(|r| !(r.kind == resource.kind && r.identifier == resource.identifier));
        if let Err(error) = providers.for_kind(resource.kind).checkin(resource.clone()).await {
            warn!(
                "Failed to check in surplus {} {:?}: {}",
                resource.kind, resource.identifier, error
            );
        }
    }

    /// Undo a failed checkout: drop persisted records, return all leases.
    async fn rollback(
        &self,
        suite_id: &str,
        providers: &Providers,
        acquired: Vec<Resource>,
        persisted: Vec<String>,
    ) {
        info!("Cleanup by checking in all checked out resources.");
        for sub_suite_id in persisted {
            if let Err(error) = self.registry.delete_sub_suite(suite_id, &sub_suite_id) {
                warn!("Failed to drop sub suite record {}: {}", sub_suite_id, error);
            }
        }
        for resource in acquired {
            if let Err(error) = providers
                .for_kind(resource.kind)
                .checkin(resource.clone())
                .await
            {
                warn!(
                    "Failed to check in {} {:?} during cleanup: {}",
                    resource.kind, resource.identifier, error
                );
            }
        }
    }
}
