//! quartermaster: a test environment provisioner.
//!
//! This crate checks out and releases the three resource classes a test
//! execution run needs (an implementation under test, an execution space
//! and a log storage area) for one or more sub-suites derived from a
//! single test suite.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Registry**: Which provider serves each resource class per suite
//! - **Providers**: Check resources out of and back into external pools
//! - **Splitter**: Partition a suite's recipes across available IUTs
//! - **Orchestrator**: Drive the checkout and release flows
//! - **Tasks**: Dispatch checkouts onto a bounded worker pool
//! - **Api**: The transport-agnostic backend surface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use quartermaster::api::Backend;
//! use quartermaster::orchestrator::EnvironmentOrchestrator;
//! use quartermaster::provider::PoolProviderFactory;
//! use quartermaster::registry::ProviderRegistry;
//! use quartermaster::store::MemoryStore;
//! use quartermaster::suite::JsonFileSuiteSource;
//! use quartermaster::tasks::TaskPool;
//!
//! let registry = ProviderRegistry::new(Arc::new(MemoryStore::new()));
//! let orchestrator = EnvironmentOrchestrator::new(
//!     registry,
//!     Arc::new(JsonFileSuiteSource::new("suite.json")),
//!     Arc::new(PoolProviderFactory::new()),
//! );
//! let backend = Backend::new(orchestrator, TaskPool::new(2));
//! // ... register providers, configure a suite, request an environment ...
//! ```

pub mod api;
pub mod config;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod splitter;
pub mod store;
pub mod suite;
pub mod tasks;

// Re-export commonly used types
pub use api::Backend;
pub use config::{load_config, Config, Dataset, Ruleset};
pub use orchestrator::{Environment, EnvironmentOrchestrator, ReleaseReport};
pub use provider::{PoolProviderFactory, Resource, ResourceKind, ResourceProvider};
pub use registry::ProviderRegistry;
pub use splitter::Splitter;
pub use store::{MemoryStore, Store};
pub use suite::{Recipe, SubSuite, SuiteDefinition, SuiteSource};
pub use tasks::{TaskPool, TaskStatus};
