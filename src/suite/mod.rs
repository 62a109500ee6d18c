//! Test suite model and suite sources.
//!
//! A test suite is a named, prioritized collection of [`Recipe`]s. Each
//! recipe names the test runner it must execute on through a `TEST_RUNNER`
//! constraint; checkout groups recipes by runner before partitioning them
//! across IUTs.
//!
//! Where suite definitions come from is a collaborator concern: the
//! [`SuiteSource`] trait resolves a suite id to its definitions, with a
//! JSON-file implementation for the CLI and a static one for embedding.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::provider::Resource;

/// Result type for suite source operations.
pub type SuiteResult<T> = Result<T, SuiteError>;

/// Errors that can occur when resolving suite definitions.
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("No suite definitions found for suite {0}")]
    NoDefinitions(String),

    #[error("Failed to read suite definition: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse suite definition: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A single constraint on a recipe (`ENVIRONMENT`, `COMMAND`,
/// `TEST_RUNNER`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub key: String,
    pub value: serde_json::Value,
}

/// Reference to the test case a recipe executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// An individual test case reference belonging to a suite.
///
/// Opaque to checkout beyond being countable and groupable by its
/// `TEST_RUNNER` constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipe {
    pub id: String,

    #[serde(default)]
    pub constraints: Vec<Constraint>,

    #[serde(rename = "testCase", default, skip_serializing_if = "Option::is_none")]
    pub test_case: Option<TestCaseRef>,
}

impl Recipe {
    /// Look up a constraint value by key.
    pub fn constraint(&self, key: &str) -> Option<&serde_json::Value> {
        self.constraints
            .iter()
            .find(|c| c.key == key)
            .map(|c| &c.value)
    }

    /// The test runner this recipe must execute on.
    pub fn test_runner(&self) -> Option<&str> {
        self.constraint("TEST_RUNNER").and_then(|v| v.as_str())
    }
}

/// A named test suite: priority plus its recipes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuiteDefinition {
    pub name: String,

    #[serde(default = "default_priority")]
    pub priority: u32,

    #[serde(default)]
    pub recipes: Vec<Recipe>,
}

fn default_priority() -> u32 {
    1
}

/// One checked-out IUT slot within a test runner.
///
/// The splitter fills `recipes`, checkout fills `executor` and `log_area`;
/// a completed slot becomes one sub-suite.
#[derive(Debug, Clone)]
pub struct RunnerSlot {
    pub iut: Resource,
    pub recipes: Vec<Recipe>,
    pub executor: Option<Resource>,
    pub log_area: Option<Resource>,
}

impl RunnerSlot {
    pub fn new(iut: Resource) -> Self {
        Self {
            iut,
            recipes: Vec::new(),
            executor: None,
            log_area: None,
        }
    }
}

/// A test runner entry: the recipes bound to one runner image and the IUT
/// slots assigned to execute them.
#[derive(Debug, Clone)]
pub struct TestRunner {
    /// Runner image name (the `TEST_RUNNER` constraint value).
    pub name: String,
    pub priority: u32,
    /// Recipes not yet distributed over the assigned slots.
    pub unsplit_recipes: Vec<Recipe>,
    /// IUT slots assigned by the splitter.
    pub slots: Vec<RunnerSlot>,
    /// Number of IUTs assigned; never zero for a runner holding recipes.
    pub number_of_iuts: usize,
}

impl TestRunner {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
            unsplit_recipes: Vec::new(),
            slots: Vec::new(),
            number_of_iuts: 0,
        }
    }
}

/// Group a suite's recipes into test runner entries.
///
/// Recipes without a `TEST_RUNNER` constraint are grouped under an empty
/// runner name, matching how an unconstrained recipe would surface in the
/// resulting environment rather than being dropped silently.
pub fn group_by_test_runner(suite: &SuiteDefinition) -> BTreeMap<String, TestRunner> {
    let mut runners = BTreeMap::new();
    for recipe in &suite.recipes {
        let name = recipe.test_runner().unwrap_or_default().to_string();
        let runner = runners
            .entry(name.clone())
            .or_insert_with(|| TestRunner::new(name, suite.priority));
        runner.unsplit_recipes.push(recipe.clone());
    }
    runners
}

/// One partition of a test suite, bound to its checked-out resources.
///
/// Created by the splitter + checkout flow, persisted keyed by `id`, and
/// destroyed on release. As long as the record exists, the three resources
/// it references are live leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubSuite {
    pub id: String,
    pub suite_id: String,
    /// `"{suite_name}_SubSuite_{n}"`.
    pub name: String,
    pub priority: u32,
    pub test_runner: String,
    pub recipes: Vec<Recipe>,
    pub iut: Resource,
    pub executor: Resource,
    pub log_area: Resource,
}

/// Resolves a suite id to its suite definitions.
#[async_trait]
pub trait SuiteSource: Send + Sync {
    /// Fetch the suite definitions for `suite_id`.
    async fn test_suite(&self, suite_id: &str) -> SuiteResult<Vec<SuiteDefinition>>;
}

/// Suite source backed by a local JSON file.
///
/// The file holds either a list of suite definitions or a single one.
/// The suite id is not consulted; the file is the suite.
pub struct JsonFileSuiteSource {
    path: PathBuf,
}

impl JsonFileSuiteSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SuiteSource for JsonFileSuiteSource {
    async fn test_suite(&self, suite_id: &str) -> SuiteResult<Vec<SuiteDefinition>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let suites = parse_suite_json(&content)?;
        if suites.is_empty() {
            return Err(SuiteError::NoDefinitions(suite_id.to_string()));
        }
        Ok(suites)
    }
}

/// Suite source serving a fixed set of definitions.
pub struct StaticSuiteSource {
    suites: Vec<SuiteDefinition>,
}

impl StaticSuiteSource {
    pub fn new(suites: Vec<SuiteDefinition>) -> Self {
        Self { suites }
    }
}

#[async_trait]
impl SuiteSource for StaticSuiteSource {
    async fn test_suite(&self, suite_id: &str) -> SuiteResult<Vec<SuiteDefinition>> {
        if self.suites.is_empty() {
            return Err(SuiteError::NoDefinitions(suite_id.to_string()));
        }
        Ok(self.suites.clone())
    }
}

/// Parse suite JSON that is either a list of definitions or a single one.
fn parse_suite_json(content: &str) -> Result<Vec<SuiteDefinition>, serde_json::Error> {
    match serde_json::from_str::<Vec<SuiteDefinition>>(content) {
        Ok(suites) => Ok(suites),
        Err(_) => serde_json::from_str::<SuiteDefinition>(content).map(|s| vec![s]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipe(id: &str, runner: &str) -> Recipe {
        Recipe {
            id: id.to_string(),
            constraints: vec![Constraint {
                key: "TEST_RUNNER".to_string(),
                value: serde_json::Value::String(runner.to_string()),
            }],
            test_case: None,
        }
    }

    #[test]
    fn test_constraint_lookup() {
        let r = recipe("r1", "runner:latest");
        assert_eq!(r.test_runner(), Some("runner:latest"));
        assert_eq!(r.constraint("COMMAND"), None);
    }

    #[test]
    fn test_group_by_test_runner() {
        let suite = SuiteDefinition {
            name: "suite".to_string(),
            priority: 1,
            recipes: vec![
                recipe("r1", "a:latest"),
                recipe("r2", "b:latest"),
                recipe("r3", "a:latest"),
            ],
        };

        let runners = group_by_test_runner(&suite);
        assert_eq!(runners.len(), 2);
        assert_eq!(runners["a:latest"].unsplit_recipes.len(), 2);
        assert_eq!(runners["b:latest"].unsplit_recipes.len(), 1);
        assert_eq!(runners["a:latest"].number_of_iuts, 0);
    }

    #[test]
    fn test_parse_suite_json_single_or_list() {
        let single = r#"{"name": "s", "recipes": []}"#;
        let list = r#"[{"name": "s", "recipes": []}, {"name": "t", "recipes": []}]"#;

        assert_eq!(parse_suite_json(single).unwrap().len(), 1);
        assert_eq!(parse_suite_json(list).unwrap().len(), 2);
    }

    #[test]
    fn test_json_file_suite_source() {
        let path = std::env::temp_dir().join(format!("suite-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"{"name": "filed", "recipes": [{"id": "r1", "constraints": []}]}"#,
        )
        .unwrap();

        let source = JsonFileSuiteSource::new(&path);
        let suites = tokio_test::block_on(source.test_suite("any")).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(suites.len(), 1);
        assert_eq!(suites[0].name, "filed");
        assert_eq!(suites[0].recipes[0].id, "r1");
    }

    #[test]
    fn test_recipe_json_shape() {
        let json = serde_json::json!({
            "id": "5aeb7054",
            "constraints": [
                {"key": "TEST_RUNNER", "value": "pytest_testrunner:latest"},
                {"key": "COMMAND", "value": "python -m pytest"}
            ],
            "testCase": {"id": "Suite", "url": "http://tracker/"}
        });

        let recipe: Recipe = serde_json::from_value(json).unwrap();
        assert_eq!(recipe.test_runner(), Some("pytest_testrunner:latest"));
        assert_eq!(recipe.test_case.as_ref().unwrap().id, "Suite");
    }
}
