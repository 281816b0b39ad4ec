// 📡 Serving Repository - read-only queries over the persisted artifacts
//
// Loaded once at startup and never mutated. The only shared mutable state
// is the statistics cache; two readers missing it at the same time may both
// recompute, which is harmless since computation is pure.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{Policy, Settings};
use crate::identifier::{clean_identifier, normalize_identifier, normalize_name};
use crate::records::{AggregatedGroup, ExpenseRecord, FlagSet, RegistryEntry, UNSPECIFIED};
use crate::registry::load_registry_file;
use crate::tabular::{parse_decimal, parse_int, read_table, RawTable};

// Artifact columns, current names first, legacy names after
const ID_COLUMNS: &[&str] = &["entity_id", "cnpj"];
const NAME_COLUMNS: &[&str] = &["entity_name", "razao_social", "razaosocial"];
const QUARTER_COLUMNS: &[&str] = &["quarter", "trimestre"];
const YEAR_COLUMNS: &[&str] = &["year", "ano"];
const VALUE_COLUMNS: &[&str] = &["expense_value", "valor_despesas", "valordespesas"];
const FLAG_COLUMNS: &[&str] = &["inconsistency_flags", "inconsistencias"];

const RANK_COLUMNS: &[&str] = &["rank", "ranking"];
const REGION_COLUMNS: &[&str] = &["region", "uf"];
const TOTAL_COLUMNS: &[&str] = &["total", "total_despesas", "totaldespesas"];
const MEAN_COLUMNS: &[&str] = &["mean", "media_despesas", "mediadespesas"];
const MEAN_PER_PERIOD_COLUMNS: &[&str] = &["mean_per_period", "media_por_trimestre", "mediaportrimestre"];
const STD_COLUMNS: &[&str] = &["std_dev", "desvio_padrao", "desviopadrao"];
const CV_COLUMNS: &[&str] = &["coefficient_of_variation", "coeficiente_variacao", "coeficientevariacao"];
const SAMPLE_COLUMNS: &[&str] = &["sample_count", "numero_trimestres", "numerotrimestres"];
const HIGH_VARIABILITY_COLUMNS: &[&str] = &["high_variability", "alta_variabilidade", "altavariabilidade"];

const TOP_OPERATORS: usize = 5;

// ============================================================================
// VIEWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorView {
    pub entity_id: String,
    pub entity_name: String,
    pub registry_id: Option<String>,
    pub modality: Option<String>,
    pub region: Option<String>,
    pub has_expenses: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorPage {
    pub items: Vec<OperatorView>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub year: i32,
    pub quarter: i32,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityTotal {
    pub entity_name: String,
    pub region: String,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionTotal {
    pub region: String,
    pub total: f64,
    pub operator_count: usize,
    pub mean_per_operator: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub total_expenses: f64,
    pub mean_expense: f64,
    pub mean_per_operator: f64,
    pub operator_count: usize,
    pub top_operator: Option<EntityTotal>,
    pub top_operators: Vec<EntityTotal>,
    pub regions: Vec<RegionTotal>,
    pub leading_region: Option<RegionTotal>,
    pub high_variability_count: usize,
}

/// Cached statistics with the moment they were computed
struct CachedStatistics {
    value: Statistics,
    created_at: Instant,
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ============================================================================
// ARTIFACT LOADERS
// ============================================================================

/// Consolidated artifact → records. Identifiers come back normalized.
pub fn parse_expenses(table: &RawTable) -> Vec<ExpenseRecord> {
    let id_col = table.find_column(ID_COLUMNS);
    let name_col = table.find_column(NAME_COLUMNS);
    let quarter_col = table.find_column(QUARTER_COLUMNS);
    let year_col = table.find_column(YEAR_COLUMNS);
    let value_col = table.find_column(VALUE_COLUMNS);
    let flag_col = table.find_column(FLAG_COLUMNS);

    if id_col.is_none() {
        warn!("expense artifact has no identifier column; history lookups will fall back to names");
    }

    table
        .rows
        .iter()
        .map(|row| ExpenseRecord {
            entity_id: normalize_identifier(table.cell(row, id_col)),
            entity_name: table.cell(row, name_col).trim().to_string(),
            quarter: parse_int(table.cell(row, quarter_col)),
            year: parse_int(table.cell(row, year_col)),
            expense_value: parse_decimal(table.cell(row, value_col)),
            inconsistency_flags: FlagSet::parse(table.cell(row, flag_col)),
        })
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "sim")
}

/// Aggregated artifact → groups. Unparsable numbers read as 0.
pub fn parse_groups(table: &RawTable) -> Vec<AggregatedGroup> {
    let col = |names: &[&str]| table.find_column(names);
    let (rank, name, region, total) = (
        col(RANK_COLUMNS),
        col(NAME_COLUMNS),
        col(REGION_COLUMNS),
        col(TOTAL_COLUMNS),
    );
    let (mean, per_period, std, cv, samples, high) = (
        col(MEAN_COLUMNS),
        col(MEAN_PER_PERIOD_COLUMNS),
        col(STD_COLUMNS),
        col(CV_COLUMNS),
        col(SAMPLE_COLUMNS),
        col(HIGH_VARIABILITY_COLUMNS),
    );
    let number = |row: &[String], c: Option<usize>| parse_decimal(table.cell(row, c)).unwrap_or(0.0);
    let count = |row: &[String], c: Option<usize>| {
        parse_int(table.cell(row, c)).map(|n| n.max(0) as usize).unwrap_or(0)
    };

    table
        .rows
        .iter()
        .map(|row| AggregatedGroup {
            rank: count(row, rank),
            entity_name: table.cell(row, name).trim().to_string(),
            region: table.cell(row, region).trim().to_string(),
            total: number(row, total),
            mean: number(row, mean),
            mean_per_period: number(row, per_period),
            std_dev: number(row, std),
            coefficient_of_variation: number(row, cv),
            sample_count: count(row, samples),
            high_variability: parse_bool(table.cell(row, high)),
        })
        .collect()
}

fn load_optional<T>(path: Option<&Path>, label: &str, parse: impl Fn(&Path) -> Result<Vec<T>>) -> Result<Vec<T>> {
    match path {
        Some(path) => {
            let items = parse(path).with_context(|| format!("Failed to load {} from {}", label, path.display()))?;
            info!("loaded {} {} rows from {}", items.len(), label, path.display());
            Ok(items)
        }
        None => {
            warn!("no {} artifact found; serving it as empty", label);
            Ok(Vec::new())
        }
    }
}

// ============================================================================
// REPOSITORY
// ============================================================================

pub struct Repository {
    expenses: Vec<ExpenseRecord>,
    groups: Vec<AggregatedGroup>,
    registry: Vec<RegistryEntry>,
    operators: Vec<OperatorView>,
    policy: Policy,
    cache_ttl: Duration,
    stats_cache: Mutex<Option<CachedStatistics>>,
}

impl Repository {
    /// Load the three artifacts from their resolved locations. A missing
    /// artifact is an empty dataset; an unreadable one is an error.
    pub fn load(settings: &Settings) -> Result<Self> {
        let expenses = load_optional(settings.resolved_consolidated().as_deref(), "consolidated", |p| {
            Ok(parse_expenses(&read_table(p)?))
        })?;
        let groups = load_optional(settings.resolved_aggregated().as_deref(), "aggregated", |p| {
            Ok(parse_groups(&read_table(p)?))
        })?;
        let registry = load_optional(settings.resolved_registry().as_deref(), "registry", |p| {
            Ok(load_registry_file(p)?)
        })?;

        Ok(Self::from_parts(
            expenses,
            groups,
            registry,
            settings.policy,
            Duration::from_secs(settings.cache_ttl_seconds),
        ))
    }

    pub fn from_parts(
        expenses: Vec<ExpenseRecord>,
        groups: Vec<AggregatedGroup>,
        registry: Vec<RegistryEntry>,
        policy: Policy,
        cache_ttl: Duration,
    ) -> Self {
        let registry: Vec<RegistryEntry> = registry
            .into_iter()
            .map(|mut e| {
                e.entity_id = normalize_identifier(&e.entity_id);
                e
            })
            .collect();
        let operators = build_operators(&expenses, &registry);
        info!("repository ready: {} operators", operators.len());

        Repository {
            expenses,
            groups,
            registry,
            operators,
            policy,
            cache_ttl,
            stats_cache: Mutex::new(None),
        }
    }

    pub fn operator_count(&self) -> usize {
        self.operators.len()
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Filter, order (operators with expenses first, then by name), paginate.
    /// `page` is 1-based.
    pub fn list_operators(&self, page: usize, limit: usize, search: Option<&str>) -> OperatorPage {
        let search = search.map(str::trim).filter(|s| !s.is_empty());

        let mut matched: Vec<&OperatorView> = match search {
            Some(term) => {
                let digits = clean_identifier(term);
                let needle = term.to_lowercase();
                self.operators
                    .iter()
                    .filter(|op| {
                        (!digits.is_empty() && op.entity_id.contains(&digits))
                            || op.entity_name.to_lowercase().contains(&needle)
                    })
                    .collect()
            }
            None => self.operators.iter().collect(),
        };

        matched.sort_by(|a, b| {
            b.has_expenses
                .cmp(&a.has_expenses)
                .then_with(|| a.entity_name.cmp(&b.entity_name))
        });

        let total = matched.len();
        let page = page.max(1);
        let items = matched
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect();

        OperatorPage {
            items,
            total,
            page,
            limit,
        }
    }

    pub fn get_operator(&self, entity_id: &str) -> Option<OperatorView> {
        let id = normalize_identifier(entity_id);
        if id.is_empty() {
            return None;
        }
        self.operators.iter().find(|op| op.entity_id == id).cloned()
    }

    /// Period sums for an operator, oldest first. Falls back to the
    /// operator's registered name when no row carries the identifier.
    pub fn get_history(&self, entity_id: &str) -> Vec<HistoryPoint> {
        let id = normalize_identifier(entity_id);
        let mut rows: Vec<&ExpenseRecord> = if id.is_empty() {
            Vec::new()
        } else {
            self.expenses.iter().filter(|r| r.entity_id == id).collect()
        };

        if rows.is_empty() {
            if let Some(op) = self.get_operator(&id) {
                let name = normalize_name(&op.entity_name);
                if !name.is_empty() {
                    debug!("history for {} falls back to name {}", id, name);
                    rows = self
                        .expenses
                        .iter()
                        .filter(|r| normalize_name(&r.entity_name) == name)
                        .collect();
                }
            }
        }

        let mut sums: BTreeMap<(i32, i32), f64> = BTreeMap::new();
        for r in rows {
            if let (Some(year), Some(quarter)) = (r.year, r.quarter) {
                *sums.entry((year, quarter)).or_insert(0.0) += r.expense_value.unwrap_or(0.0);
            }
        }

        if self.policy.empty_history_when_non_positive && sums.values().all(|v| *v <= 0.0) {
            return Vec::new();
        }

        sums.into_iter()
            .map(|((year, quarter), total)| HistoryPoint { year, quarter, total })
            .collect()
    }

    /// Statistics, served from cache until the TTL runs out
    pub fn get_statistics(&self) -> Statistics {
        if let Some(cached) = self.cached_statistics() {
            return cached;
        }

        let value = self.compute_statistics();
        let mut cache = self.stats_cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedStatistics {
            value: value.clone(),
            created_at: Instant::now(),
        });
        value
    }

    fn cached_statistics(&self) -> Option<Statistics> {
        let cache = self.stats_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .as_ref()
            .filter(|c| c.created_at.elapsed() < self.cache_ttl)
            .map(|c| c.value.clone())
    }

    /// When the cached statistics were computed, if they are still cached
    pub fn statistics_cached_at(&self) -> Option<Instant> {
        let cache = self.stats_cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.as_ref().map(|c| c.created_at)
    }

    /// Pure recomputation over the loaded datasets; bypasses the cache.
    pub fn compute_statistics(&self) -> Statistics {
        compute_statistics(&self.expenses, &self.groups, &self.registry, self.operators.len())
    }
}

// ============================================================================
// OPERATOR VIEWS
// ============================================================================

fn sum_by<K: std::hash::Hash + Eq>(expenses: &[ExpenseRecord], key: impl Fn(&ExpenseRecord) -> K) -> HashMap<K, f64> {
    let mut totals = HashMap::new();
    for r in expenses {
        *totals.entry(key(r)).or_insert(0.0) += r.expense_value.unwrap_or(0.0);
    }
    totals
}

/// Registry rows when there are any, otherwise identities seen in the
/// expenses. One view per identifier, first wins.
fn build_operators(expenses: &[ExpenseRecord], registry: &[RegistryEntry]) -> Vec<OperatorView> {
    let mut name_by_id: HashMap<&str, &str> = HashMap::new();
    for r in expenses {
        if !r.entity_id.is_empty() && !r.entity_name.is_empty() {
            name_by_id.entry(r.entity_id.as_str()).or_insert(r.entity_name.as_str());
        }
    }

    let totals_by_id = sum_by(expenses, |r| r.entity_id.clone());
    let totals_by_name = sum_by(expenses, |r| normalize_name(&r.entity_name));

    let base: Vec<OperatorView> = if !registry.is_empty() {
        registry
            .iter()
            .map(|e| OperatorView {
                entity_id: e.entity_id.clone(),
                entity_name: non_empty(&e.entity_name)
                    .or_else(|| name_by_id.get(e.entity_id.as_str()).map(|n| n.to_string()))
                    .unwrap_or_default(),
                registry_id: non_empty(&e.registry_id),
                modality: non_empty(&e.modality),
                region: non_empty(&e.region),
                has_expenses: false,
            })
            .collect()
    } else {
        expenses
            .iter()
            .filter(|r| !r.entity_name.is_empty())
            .map(|r| OperatorView {
                entity_id: r.entity_id.clone(),
                entity_name: r.entity_name.clone(),
                registry_id: None,
                modality: None,
                region: None,
                has_expenses: false,
            })
            .collect()
    };

    let mut seen = HashSet::new();
    base.into_iter()
        .filter(|op| !op.entity_id.is_empty() && seen.insert(op.entity_id.clone()))
        .map(|mut op| {
            let by_id = totals_by_id.get(&op.entity_id).copied().unwrap_or(0.0);
            let name = normalize_name(&op.entity_name);
            let by_name = if name.is_empty() {
                0.0
            } else {
                totals_by_name.get(&name).copied().unwrap_or(0.0)
            };
            op.has_expenses = by_id > 0.0 || by_name > 0.0;
            op
        })
        .collect()
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Region lookup: by identifier first, then by normalized name
struct RegionResolver {
    by_id: HashMap<String, String>,
    by_name: HashMap<String, String>,
}

impl RegionResolver {
    fn new(registry: &[RegistryEntry]) -> Self {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        for e in registry {
            let region = match non_empty(&e.region) {
                Some(r) => r,
                None => continue,
            };
            if !e.entity_id.is_empty() {
                by_id.entry(e.entity_id.clone()).or_insert_with(|| region.clone());
            }
            let name = normalize_name(&e.entity_name);
            if !name.is_empty() {
                by_name.entry(name).or_insert(region);
            }
        }
        RegionResolver { by_id, by_name }
    }

    fn resolve(&self, entity_id: &str, entity_name: &str) -> String {
        self.by_id
            .get(entity_id)
            .or_else(|| self.by_name.get(&normalize_name(entity_name)))
            .cloned()
            .unwrap_or_else(|| UNSPECIFIED.to_string())
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

fn by_total_desc<T>(items: &mut [T], total: impl Fn(&T) -> f64) {
    items.sort_by(|a, b| total(b).total_cmp(&total(a)));
}

/// Global statistics over the loaded datasets. Pure.
pub fn compute_statistics(
    expenses: &[ExpenseRecord],
    groups: &[AggregatedGroup],
    registry: &[RegistryEntry],
    operator_count: usize,
) -> Statistics {
    let values: Vec<f64> = expenses.iter().filter_map(|r| r.expense_value).collect();
    let total_expenses: f64 = values.iter().sum();
    let mean_expense = ratio(total_expenses, values.len() as f64);
    let mean_per_operator = ratio(total_expenses, operator_count as f64);

    let resolver = RegionResolver::new(registry);

    // per (identifier, name) totals
    let mut entity_totals: BTreeMap<(&str, &str), f64> = BTreeMap::new();
    for r in expenses {
        *entity_totals
            .entry((r.entity_id.as_str(), r.entity_name.as_str()))
            .or_insert(0.0) += r.expense_value.unwrap_or(0.0);
    }
    let mut entities: Vec<EntityTotal> = entity_totals
        .into_iter()
        .map(|((id, name), total)| EntityTotal {
            entity_name: name.to_string(),
            region: resolver.resolve(id, name),
            total,
        })
        .collect();
    by_total_desc(&mut entities, |e| e.total);
    entities.truncate(TOP_OPERATORS);

    let regions = if !expenses.is_empty() {
        region_totals_from_expenses(expenses, registry, &resolver)
    } else {
        region_totals_from_groups(groups)
    };

    let leading_region = regions
        .iter()
        .find(|r| r.region != UNSPECIFIED)
        .or_else(|| regions.first())
        .cloned();

    Statistics {
        total_expenses,
        mean_expense,
        mean_per_operator,
        operator_count,
        top_operator: entities.first().cloned(),
        top_operators: entities,
        regions,
        leading_region,
        high_variability_count: groups.iter().filter(|g| g.high_variability).count(),
    }
}

fn region_totals_from_expenses(
    expenses: &[ExpenseRecord],
    registry: &[RegistryEntry],
    resolver: &RegionResolver,
) -> Vec<RegionTotal> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    let mut expense_ids: HashMap<String, HashSet<&str>> = HashMap::new();
    for r in expenses {
        let region = resolver.resolve(&r.entity_id, &r.entity_name);
        *totals.entry(region.clone()).or_insert(0.0) += r.expense_value.unwrap_or(0.0);
        expense_ids.entry(region).or_default().insert(r.entity_id.as_str());
    }

    // operator counts come from the registry when there is one
    let counts: HashMap<String, usize> = if !registry.is_empty() {
        let mut ids: HashMap<String, HashSet<&str>> = HashMap::new();
        for e in registry {
            let region = non_empty(&e.region).unwrap_or_else(|| UNSPECIFIED.to_string());
            ids.entry(region).or_default().insert(e.entity_id.as_str());
        }
        ids.into_iter().map(|(k, v)| (k, v.len())).collect()
    } else {
        expense_ids.into_iter().map(|(k, v)| (k, v.len())).collect()
    };

    let mut regions: Vec<RegionTotal> = totals
        .into_iter()
        .map(|(region, total)| {
            let operator_count = counts.get(&region).copied().unwrap_or(0);
            RegionTotal {
                mean_per_operator: ratio(total, operator_count as f64),
                region,
                total,
                operator_count,
            }
        })
        .collect();
    by_total_desc(&mut regions, |r| r.total);
    regions
}

/// Without expense rows only the aggregated totals are known; operator
/// counts are unknown and reported as 0.
fn region_totals_from_groups(groups: &[AggregatedGroup]) -> Vec<RegionTotal> {
    let mut totals: BTreeMap<String, f64> = BTreeMap::new();
    for g in groups {
        let region = non_empty(&g.region).unwrap_or_else(|| UNSPECIFIED.to_string());
        *totals.entry(region).or_insert(0.0) += g.total;
    }
    let mut regions: Vec<RegionTotal> = totals
        .into_iter()
        .map(|(region, total)| RegionTotal {
            region,
            total,
            operator_count: 0,
            mean_per_operator: 0.0,
        })
        .collect();
    by_total_desc(&mut regions, |r| r.total);
    regions
}
