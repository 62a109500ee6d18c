//! Backend for the environment requests.
//!
//! The HTTP transport itself is a deployment concern; this module carries
//! its contract as typed requests, responses and an error taxonomy a
//! transport can map straight onto status codes. Provider-level failures
//! never surface here as transport faults: they land in the task result's
//! `error` field, so a poller always receives a well-formed status object.

use serde::{Deserialize, Serialize};

use crate::config::{Dataset, Ruleset};
use crate::orchestrator::EnvironmentOrchestrator;
use crate::provider::ResourceKind;
use crate::registry::{ProviderRegistry, RegistryError};
use crate::suite::SubSuite;
use crate::tasks::{self, StatusReport, TaskId, TaskPool, TaskResult};

/// Result type for backend operations.
pub type ApiResult<T> = Result<T, ApiError>;

/// Client-facing error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Missing parameters: {0:?} is a required parameter")]
    MissingParameter(&'static str),

    #[error("Invalid provider: no such {kind} provider {id:?}")]
    UnknownProvider { kind: ResourceKind, id: String },

    #[error("{0}")]
    NotFound(String),

    #[error("Suite {0} is busy with another checkout or release")]
    Busy(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// The HTTP status code a transport would map this error to.
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::MissingParameter(_) | ApiError::UnknownProvider { .. } => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Busy(_) => 409,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::UnknownProvider { kind, id } => ApiError::UnknownProvider { kind, id },
            RegistryError::Busy(suite_id) => ApiError::Busy(suite_id),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

/// POST `/configure` body.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ConfigureRequest {
    pub suite_id: Option<String>,
    pub iut_provider: Option<String>,
    pub execution_space_provider: Option<String>,
    pub log_area_provider: Option<String>,
    pub dataset: Option<Dataset>,
}

/// POST `/configure` response: the rulesets that were selected.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigureResponse {
    #[serde(rename = "IUTProvider")]
    pub iut_provider: Ruleset,
    #[serde(rename = "ExecutionSpaceProvider")]
    pub execution_space_provider: Ruleset,
    #[serde(rename = "LogAreaProvider")]
    pub log_area_provider: Ruleset,
}

/// GET `/configure` response; all fields null when unconfigured.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigurationResponse {
    pub iut_provider: Option<Ruleset>,
    pub execution_space_provider: Option<Ruleset>,
    pub log_area_provider: Option<Ruleset>,
    pub dataset: Option<Dataset>,
}

/// POST `/register` body; at least one ruleset is required.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct RegisterRequest {
    pub iut_provider: Option<Ruleset>,
    pub execution_space_provider: Option<Ruleset>,
    pub log_area_provider: Option<Ruleset>,
}

/// POST `/` body.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct EnvironmentRequest {
    pub suite_id: Option<String>,
    #[serde(default)]
    pub suite_runner_ids: Vec<String>,
}

/// POST `/` response.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentRequested {
    pub result: &'static str,
    pub data: TaskRef,
}

/// Reference to the checkout task to poll for.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRef {
    pub id: TaskId,
}

/// GET `/?release=<suite_id>` response.
#[derive(Debug, Clone, Serialize)]
pub struct ReleaseResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// The backend a transport binds its routes to.
#[derive(Clone)]
pub struct Backend {
    registry: ProviderRegistry,
    orchestrator: EnvironmentOrchestrator,
    tasks: TaskPool,
}

impl Backend {
    pub fn new(orchestrator: EnvironmentOrchestrator, tasks: TaskPool) -> Self {
        Self {
            registry: orchestrator.registry().clone(),
            orchestrator,
            tasks,
        }
    }

    /// The registry behind this backend.
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Select providers and a dataset for a suite.
    pub fn configure(&self, request: ConfigureRequest) -> ApiResult<ConfigureResponse> {
        let suite_id = request
            .suite_id
            .as_deref()
            .ok_or(ApiError::MissingParameter("suite_id"))?;
        let iut_provider = request
            .iut_provider
            .as_deref()
            .ok_or(ApiError::MissingParameter("iut_provider"))?;
        let execution_space_provider = request
            .execution_space_provider
            .as_deref()
            .ok_or(ApiError::MissingParameter("execution_space_provider"))?;
        let log_area_provider = request
            .log_area_provider
            .as_deref()
            .ok_or(ApiError::MissingParameter("log_area_provider"))?;
        let dataset = request
            .dataset
            .as_ref()
            .ok_or(ApiError::MissingParameter("dataset"))?;

        let selection = self.registry.configure(
            suite_id,
            iut_provider,
            log_area_provider,
            execution_space_provider,
            dataset,
        )?;
        Ok(ConfigureResponse {
            iut_provider: selection.iut,
            execution_space_provider: selection.execution_space,
            log_area_provider: selection.log_area,
        })
    }

    /// Read back a suite's configuration; nulls when unconfigured.
    pub fn configuration(&self, suite_id: Option<&str>) -> ApiResult<ConfigurationResponse> {
        let suite_id = suite_id.ok_or(ApiError::MissingParameter("suite_id"))?;
        Ok(ConfigurationResponse {
            iut_provider: self.registry.iut_provider(suite_id)?,
            execution_space_provider: self.registry.execution_space_provider(suite_id)?,
            log_area_provider: self.registry.log_area_provider(suite_id)?,
            dataset: self.registry.dataset(suite_id)?,
        })
    }

    /// Register one or several provider rulesets.
    pub fn register(&self, request: RegisterRequest) -> ApiResult<()> {
        if request.iut_provider.is_none()
            && request.execution_space_provider.is_none()
            && request.log_area_provider.is_none()
        {
            return Err(ApiError::MissingParameter(
                "iut_provider, log_area_provider or execution_space_provider",
            ));
        }
        if let Some(ruleset) = &request.iut_provider {
            self.registry.register_provider(ResourceKind::Iut, ruleset)?;
        }
        if let Some(ruleset) = &request.execution_space_provider {
            self.registry
                .register_provider(ResourceKind::ExecutionSpace, ruleset)?;
        }
        if let Some(ruleset) = &request.log_area_provider {
            self.registry
                .register_provider(ResourceKind::LogArea, ruleset)?;
        }
        Ok(())
    }

    /// Start an environment checkout; returns the task id to poll for.
    pub fn request_environment(
        &self,
        request: EnvironmentRequest,
    ) -> ApiResult<EnvironmentRequested> {
        let suite_id = request
            .suite_id
            .ok_or(ApiError::MissingParameter("suite_id"))?;
        let correlation_ids = request.suite_runner_ids;

        let orchestrator = self.orchestrator.clone();
        let id = self.tasks.submit(async move {
            match orchestrator
                .request_environment(&suite_id, &correlation_ids)
                .await
            {
                Ok(environment) => TaskResult::success(environment),
                Err(error) => TaskResult::failure(error.to_string()),
            }
        });

        Ok(EnvironmentRequested {
            result: "success",
            data: TaskRef { id },
        })
    }

    /// Poll a checkout task.
    pub fn check_environment_status(&self, task_id: Option<&str>) -> ApiResult<StatusReport> {
        let task_id = task_id.ok_or(ApiError::MissingParameter("id"))?;
        tasks::check_environment_status(&self.tasks, task_id)
            .ok_or_else(|| ApiError::NotFound(format!("No task with id {task_id:?}")))
    }

    /// Release everything checked out for a suite.
    pub async fn release_environment(&self, suite_id: Option<&str>) -> ApiResult<ReleaseResponse> {
        let suite_id = suite_id.ok_or(ApiError::MissingParameter("release"))?;

        let nothing_pending = self.registry.sub_suites(suite_id)?.is_empty()
            && self.registry.selection(suite_id)?.is_none();
        let report = self.orchestrator.release_full(suite_id).await;

        Ok(ReleaseResponse {
            success: report.success,
            message: (!report.message.is_empty()).then_some(report.message),
            warning: nothing_pending
                .then(|| format!("Nothing to release for suite {suite_id:?}")),
        })
    }

    /// Fetch a persisted sub-suite by id.
    pub fn sub_suite(&self, sub_suite_id: Option<&str>) -> ApiResult<SubSuite> {
        let sub_suite_id = sub_suite_id.ok_or(ApiError::MissingParameter("id"))?;
        self.registry.sub_suite(sub_suite_id)?.ok_or_else(|| {
            ApiError::NotFound(format!(
                "Could not find sub suite with ID {sub_suite_id:?}"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::provider::PoolProviderFactory;
    use crate::store::MemoryStore;
    use crate::suite::StaticSuiteSource;

    fn backend() -> Backend {
        let registry = ProviderRegistry::new(Arc::new(MemoryStore::new()));
        let orchestrator = EnvironmentOrchestrator::new(
            registry,
            Arc::new(StaticSuiteSource::new(Vec::new())),
            Arc::new(PoolProviderFactory::new()),
        );
        Backend::new(orchestrator, TaskPool::new(1))
    }

    fn ruleset(id: &str) -> Ruleset {
        Ruleset {
            id: id.to_string(),
            shared: false,
            wait_timeout_secs: 10,
            instances: vec![serde_json::Map::new()],
        }
    }

    #[test]
    fn test_configure_missing_parameter() {
        let backend = backend();
        let error = backend.configure(ConfigureRequest::default()).unwrap_err();

        assert!(matches!(error, ApiError::MissingParameter("suite_id")));
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn test_configure_unknown_provider() {
        let backend = backend();
        backend
            .register(RegisterRequest {
                iut_provider: Some(ruleset("default")),
                execution_space_provider: Some(ruleset("default")),
                log_area_provider: None,
            })
            .unwrap();

        let error = backend
            .configure(ConfigureRequest {
                suite_id: Some("suite".to_string()),
                iut_provider: Some("default".to_string()),
                execution_space_provider: Some("default".to_string()),
                log_area_provider: Some("default".to_string()),
                dataset: Some(Dataset::default()),
            })
            .unwrap_err();

        assert!(matches!(
            error,
            ApiError::UnknownProvider {
                kind: ResourceKind::LogArea,
                ..
            }
        ));
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn test_register_requires_at_least_one_ruleset() {
        let backend = backend();
        let error = backend.register(RegisterRequest::default()).unwrap_err();
        assert_eq!(error.status_code(), 400);
    }

    #[test]
    fn test_configuration_of_unconfigured_suite_is_nulls() {
        let backend = backend();
        let response = backend.configuration(Some("suite")).unwrap();

        assert!(response.iut_provider.is_none());
        assert!(response.execution_space_provider.is_none());
        assert!(response.log_area_provider.is_none());
        assert!(response.dataset.is_none());
    }

    #[test]
    fn test_sub_suite_not_found() {
        let backend = backend();
        let error = backend.sub_suite(Some("missing")).unwrap_err();

        assert!(matches!(error, ApiError::NotFound(_)));
        assert_eq!(error.status_code(), 404);
    }

    #[tokio::test]
    async fn test_release_of_idle_suite_warns() {
        let backend = backend();
        let response = backend.release_environment(Some("suite")).await.unwrap();

        assert!(response.success);
        assert!(response.warning.is_some());
        assert!(response.message.is_none());
    }

    #[test]
    fn test_status_of_unknown_task_is_not_found() {
        let backend = backend();
        let error = backend.check_environment_status(Some("gone")).unwrap_err();
        assert_eq!(error.status_code(), 404);
    }
}
