//! Environment release and registry cleanup.
//!
//! Release is best-effort and non-retrying: every checkin is attempted
//! regardless of earlier failures, and registry cleanup happens whether or
//! not the checkins succeeded. A stuck provider can leak its own state but
//! must never block resource reclamation at the registry level.

use serde::Serialize;
use tracing::{info, warn};

use crate::provider::{ProviderError, Resource, ResourceKind};
use crate::registry::RegistryError;
use crate::suite::SubSuite;

use super::EnvironmentOrchestrator;

/// Errors that can occur while releasing a single resource.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("No such {kind} provider {id:?} registered")]
    UnknownProvider { kind: ResourceKind, id: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Outcome of a full release: overall success plus a trace of every
/// failure observed across the sub-suites.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseReport {
    pub success: bool,
    /// Newline-separated failure trace; empty on success.
    pub message: String,
}

impl ReleaseReport {
    fn from_failures(failures: Vec<String>) -> Self {
        Self {
            success: failures.is_empty(),
            message: failures.join("\n"),
        }
    }
}

impl EnvironmentOrchestrator {
    /// Route a resource back to the provider that produced it.
    async fn checkin_resource(&self, resource: &Resource) -> Result<(), ReleaseError> {
        let ruleset = self
            .registry()
            .provider_by_id(resource.kind, &resource.provider_id)?
            .ok_or_else(|| ReleaseError::UnknownProvider {
                kind: resource.kind,
                id: resource.provider_id.clone(),
            })?;
        let provider = self.factory.build(resource.kind, &ruleset)?;
        provider.checkin(resource.clone()).await?;
        Ok(())
    }

    /// Release the three resources of one sub-suite.
    ///
    /// All three checkins are always attempted; a failure in one does not
    /// prevent the other two. The first failure encountered is returned,
    /// later ones are logged.
    pub async fn release_single(&self, sub_suite: &SubSuite) -> Option<ReleaseError> {
        let mut failure = None;
        for resource in [&sub_suite.iut, &sub_suite.executor, &sub_suite.log_area] {
            if let Err(error) = self.checkin_resource(resource).await {
                warn!(
                    "Failed to check in {} {:?} of sub suite {}: {}",
                    resource.kind, resource.identifier, sub_suite.id, error
                );
                if failure.is_none() {
                    failure = Some(error);
                }
            }
        }
        failure
    }

    /// Release every persisted sub-suite of a suite and purge its test run
    /// from the registry.
    ///
    /// Each sub-suite record is deleted whether or not its release
    /// succeeded, and the run's registry entry goes away at the end no
    /// matter what. Failures are collected in order and reported together.
    pub async fn release_full(&self, suite_id: &str) -> ReleaseReport {
        let _lease = match self.registry().lease(suite_id) {
            Ok(lease) => lease,
            Err(error) => return ReleaseReport::from_failures(vec![error.to_string()]),
        };

        let mut failures = Vec::new();
        let sub_suites = match self.registry().sub_suites(suite_id) {
            Ok(sub_suites) => sub_suites,
            Err(error) => {
                failures.push(error.to_string());
                Vec::new()
            }
        };

        info!(
            "Releasing {} sub suite(s) for suite {}",
            sub_suites.len(),
            suite_id
        );
        for sub_suite in &sub_suites {
            if let Some(error) = self.release_single(sub_suite).await {
                failures.push(format!("{}: {}", sub_suite.id, error));
            }
            // The record goes away regardless of the checkin outcome, so
            // the same lease is never checked in twice.
            if let Err(error) = self.registry().delete_sub_suite(suite_id, &sub_suite.id) {
                failures.push(format!("{}: {}", sub_suite.id, error));
            }
        }

        if let Err(error) = self.registry().delete_run(suite_id) {
            failures.push(error.to_string());
        }

        ReleaseReport::from_failures(failures)
    }
}
