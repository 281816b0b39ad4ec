// Operator Expenses - Core Library
// Exposes all modules for use in the pipeline CLI, the query server, and tests

pub mod error;
pub mod logging;
pub mod config;
pub mod identifier;
pub mod records;
pub mod tabular;
pub mod fetcher;        // Acquisition - portal listing + resilient downloads
pub mod container;      // Acquisition - zip bundles
pub mod registry;       // Operator registry snapshot
pub mod normalizer;     // Heterogeneous layouts → ExpenseRecord
pub mod validator;      // Inconsistency flags
pub mod consolidation;
pub mod enricher;
pub mod aggregator;
pub mod pipeline;
pub mod export;         // SQLite export + run audit trail
pub mod serving;        // Read-only query repository

#[cfg(feature = "server")]
pub mod api;

// Re-export commonly used types
pub use error::{PipelineError, Result};
pub use config::{Policy, Settings};
pub use records::{
    AggregatedGroup, EnrichedRecord, ExpenseRecord, FlagSet, InconsistencyFlag,
    MatchStatus, Period, RegistryEntry,
};
pub use identifier::{clean_identifier, is_valid_identifier, normalize_identifier};
pub use fetcher::{Fetcher, HttpClient, ReqwestHttpClient, RetryPolicy};
pub use container::{ContainerExpander, ZipExpander};
pub use registry::{CachedRegistrySource, Registry, RegistrySource, StaticRegistry};
pub use normalizer::{normalize, Strategy};
pub use validator::{ExpenseValidator, ValidationSummary};
pub use consolidation::{consolidate, Consolidated};
pub use enricher::{enrich, EnrichmentSummary};
pub use aggregator::{AggregateAnalysis, Aggregator};
pub use pipeline::{run_offline, run_online, Pipeline, RunOutput, RunReport};
pub use export::{export_run, Event, ExportReport};
pub use serving::{OperatorPage, OperatorView, Repository, Statistics};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
