// ⚙️ Configuration - environment settings, artifact locations, policy knobs
//
// Every setting comes from an `HT_`-prefixed environment variable (a `.env`
// file is honoured). Artifact paths have a primary override and an ordered
// list of fallback candidates; an unresolved path means "empty dataset".

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

// ============================================================================
// ARTIFACT NAMES
// ============================================================================

pub const CONSOLIDATED_FILE: &str = "consolidated_expenses.csv";
pub const CONSOLIDATED_ARCHIVE: &str = "consolidated_expenses.zip";
pub const ENRICHED_FILE: &str = "enriched_expenses.csv";
pub const INCONSISTENT_FILE: &str = "inconsistent_expenses.csv";
pub const AGGREGATED_FILE: &str = "aggregated_expenses.csv";
pub const REGISTRY_FILE: &str = "registry_snapshot.csv";
pub const EXPORT_DB_FILE: &str = "expenses.db";

// ============================================================================
// PORTAL LOCATIONS
// ============================================================================

pub const STATEMENTS_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/demonstracoes_contabeis";
pub const REGISTRY_INDEX_URL: &str =
    "https://dadosabertos.ans.gov.br/FTP/PDA/operadoras_de_plano_de_saude_ativas";

/// Text encodings tried in order when reading portal files
pub const SOURCE_ENCODINGS: &[&str] = &["utf-8", "latin-1", "iso-8859-1", "cp1252"];

// ============================================================================
// POLICY
// ============================================================================

/// Coefficient of variation (%) above which a group is "high variability"
pub const HIGH_VARIABILITY_THRESHOLD: f64 = 50.0;

/// A history whose period sums are all <= 0 is reported as no history
pub const EMPTY_HISTORY_WHEN_NON_POSITIVE: bool = true;

/// Policy values that are product decisions rather than derived constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Policy {
    pub high_variability_threshold: f64,
    pub empty_history_when_non_positive: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            high_variability_threshold: HIGH_VARIABILITY_THRESHOLD,
            empty_history_when_non_positive: EMPTY_HISTORY_WHEN_NON_POSITIVE,
        }
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone)]
pub struct Settings {
    /// Root under which output/ and data/ live
    pub data_dir: PathBuf,

    pub consolidated_path: Option<PathBuf>,
    pub aggregated_path: Option<PathBuf>,
    pub registry_path: Option<PathBuf>,

    pub cache_ttl_seconds: u64,

    /// Comma-separated cross-origin allow-list
    pub cors_origins: String,

    pub bind_addr: String,

    pub policy: Policy,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            data_dir: PathBuf::from("."),
            consolidated_path: None,
            aggregated_path: None,
            registry_path: None,
            cache_ttl_seconds: 300,
            cors_origins: "http://localhost:5173".to_string(),
            bind_addr: "0.0.0.0:3000".to_string(),
            policy: Policy::default(),
        }
    }
}

impl Settings {
    /// Load from the process environment (after reading `.env` if present)
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut settings = Settings::default();

        if let Some(dir) = get("HT_DATA_DIR") {
            settings.data_dir = PathBuf::from(dir);
        }
        settings.consolidated_path = get("HT_DATA_CONSOLIDATED_PATH").map(PathBuf::from);
        settings.aggregated_path = get("HT_DATA_AGGREGATED_PATH").map(PathBuf::from);
        settings.registry_path = get("HT_DATA_REGISTRY_PATH").map(PathBuf::from);

        if let Some(ttl) = get("HT_CACHE_TTL_SECONDS") {
            settings.cache_ttl_seconds = ttl.parse().map_err(|_| {
                PipelineError::Config(format!("HT_CACHE_TTL_SECONDS is not a number: {}", ttl))
            })?;
        }
        if let Some(origins) = get("HT_CORS_ORIGINS") {
            settings.cors_origins = origins;
        }
        if let Some(addr) = get("HT_BIND_ADDR") {
            settings.bind_addr = addr;
        }
        if let Some(threshold) = get("HT_HIGH_VARIABILITY_THRESHOLD") {
            settings.policy.high_variability_threshold = threshold.parse().map_err(|_| {
                PipelineError::Config(format!(
                    "HT_HIGH_VARIABILITY_THRESHOLD is not a number: {}",
                    threshold
                ))
            })?;
        }

        Ok(settings)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("raw")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.data_dir.join("data").join("extracted")
    }

    /// Where the registry snapshot is cached after first download
    pub fn registry_cache_path(&self) -> PathBuf {
        self.data_dir.join("data").join(REGISTRY_FILE)
    }

    pub fn consolidated_candidates(&self) -> Vec<PathBuf> {
        vec![
            self.output_dir().join(CONSOLIDATED_FILE),
            self.data_dir.join(CONSOLIDATED_FILE),
        ]
    }

    pub fn aggregated_candidates(&self) -> Vec<PathBuf> {
        vec![
            self.output_dir().join(AGGREGATED_FILE),
            self.data_dir.join(AGGREGATED_FILE),
        ]
    }

    pub fn registry_candidates(&self) -> Vec<PathBuf> {
        vec![
            self.registry_cache_path(),
            self.output_dir().join(REGISTRY_FILE),
        ]
    }

    pub fn resolved_consolidated(&self) -> Option<PathBuf> {
        resolve_path(self.consolidated_path.as_deref(), &self.consolidated_candidates())
    }

    pub fn resolved_aggregated(&self) -> Option<PathBuf> {
        resolve_path(self.aggregated_path.as_deref(), &self.aggregated_candidates())
    }

    pub fn resolved_registry(&self) -> Option<PathBuf> {
        resolve_path(self.registry_path.as_deref(), &self.registry_candidates())
    }

    /// CORS allow-list with blank entries dropped
    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(|o| o.to_string())
            .collect()
    }
}

/// First existing path: the primary override, then each fallback in order.
pub fn resolve_path(primary: Option<&Path>, fallbacks: &[PathBuf]) -> Option<PathBuf> {
    if let Some(path) = primary {
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }
    fallbacks.iter().find(|p| p.exists()).cloned()
}
