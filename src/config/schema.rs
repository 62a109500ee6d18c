//! Configuration schema definitions for quartermaster.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files, plus the two configuration values that travel
//! through the rest of the system: provider [`Ruleset`]s and the allocation
//! [`Dataset`].
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── CoreConfig             - Worker pool size, checkout timeout
//! ├── ProvidersConfig        - Rulesets per resource class
//! │   ├── iut                - IUT provider rulesets
//! │   ├── execution_space    - Execution space provider rulesets
//! │   └── log_area           - Log area provider rulesets
//! ├── SuiteConfig            - Where suite definitions come from
//! └── Dataset                - Allocation parameters for checkout
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::provider::ResourceKind;

/// Root configuration structure for quartermaster.
///
/// # TOML Structure
///
/// ```toml
/// [quartermaster]
/// workers = 2
/// checkout_timeout_secs = 10
///
/// [[providers.iut]]
/// id = "default"
/// instances = [{ identity = "pkg:generic/product@1.0.0" }]
///
/// [[providers.execution_space]]
/// id = "default"
/// instances = [{ request = { url = "http://executor/" } }]
///
/// [[providers.log_area]]
/// id = "default"
/// shared = true
/// instances = [{ upload = { url = "http://logs/{name}" } }]
///
/// [suite]
/// definition = "suite.json"
///
/// [dataset]
/// iut_amount = 3
/// log_area_amount = 1
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings (worker pool, timeouts).
    #[serde(default)]
    pub quartermaster: CoreConfig,

    /// Provider rulesets to register at startup.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Suite definition source.
    #[serde(default)]
    pub suite: SuiteConfig,

    /// Allocation dataset used when configuring a suite.
    #[serde(default)]
    pub dataset: Dataset,
}

/// Core execution settings.
///
/// | Field | Default |
/// |-------|---------|
/// | `workers` | 2 |
/// | `checkout_timeout_secs` | 10 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoreConfig {
    /// Number of workers in the checkout task pool.
    ///
    /// Each environment request occupies one worker for its whole duration.
    ///
    /// Default: 2
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long, in seconds, a poll loop waits for checkout completion
    /// before giving up (CLI only; the backend itself never blocks).
    ///
    /// Default: 10
    #[serde(default = "default_checkout_timeout")]
    pub checkout_timeout_secs: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            checkout_timeout_secs: default_checkout_timeout(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_checkout_timeout() -> u64 {
    10
}

/// Provider rulesets grouped by resource class.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvidersConfig {
    /// IUT provider rulesets.
    #[serde(default)]
    pub iut: Vec<Ruleset>,

    /// Execution space provider rulesets.
    #[serde(default)]
    pub execution_space: Vec<Ruleset>,

    /// Log area provider rulesets.
    #[serde(default)]
    pub log_area: Vec<Ruleset>,
}

/// Where suite definitions are loaded from.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Path to a JSON file holding the suite definitions.
    ///
    /// The file contains a list of suite definitions (or a single one);
    /// see [`crate::suite::SuiteDefinition`].
    pub definition: Option<PathBuf>,
}

/// A provider's declarative configuration.
///
/// A full deployment expands rulesets through a template engine into real
/// checkout/checkin actions against external services. This crate treats
/// the ruleset as data: the pool provider leases out the configured
/// `instances`, and everything else carries the ruleset around opaquely.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Ruleset {
    /// Provider id, unique within its resource class.
    pub id: String,

    /// Whether leases from this provider are shared rather than exclusive.
    ///
    /// Exclusive providers (IUTs, execution spaces) hand out each instance
    /// to at most one owner at a time. Shared providers (log areas) hand
    /// out any number of leases over the configured instances.
    #[serde(default)]
    pub shared: bool,

    /// How long a checkout may wait for capacity before it fails.
    ///
    /// Default: 10
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Attribute sets for the instances this provider can lease.
    #[serde(default)]
    pub instances: Vec<serde_json::Map<String, serde_json::Value>>,
}

fn default_wait_timeout() -> u64 {
    10
}

/// Allocation parameters supplied at suite configuration time.
///
/// The named fields are the amounts consumed by the splitter and the
/// providers; anything else in the mapping is kept in `extra` and handed
/// to providers untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Dataset {
    /// Upper bound on how many IUTs to check out for a suite.
    pub iut_amount: Option<usize>,

    /// Upper bound on how many execution spaces to check out.
    pub execution_space_amount: Option<usize>,

    /// How many distinct log areas to spread sub-suites across.
    pub log_area_amount: Option<usize>,

    /// Free-form remainder, forwarded to providers as-is.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Dataset {
    /// The configured amount for a resource kind, if any.
    pub fn amount_for(&self, kind: ResourceKind) -> Option<usize> {
        match kind {
            ResourceKind::Iut => self.iut_amount,
            ResourceKind::ExecutionSpace => self.execution_space_amount,
            ResourceKind::LogArea => self.log_area_amount,
        }
    }
}
