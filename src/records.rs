// 📒 Records - the values that flow through the pipeline
//
// ExpenseRecord     one declared expense (created by the normalizer)
// RegistryEntry     one operator registration (read-only snapshot)
// EnrichedRecord    ExpenseRecord + registry columns (left join output)
// AggregatedGroup   one (entity_name, region) statistical summary

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Placeholder for an absent region or name in aggregated outputs
pub const UNSPECIFIED: &str = "UNSPECIFIED";

// ============================================================================
// INCONSISTENCY FLAGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InconsistencyFlag {
    IdentifierEmpty,
    IdentifierInvalid,
    NameEmpty,
    ValueNull,
    ValueNegative,
    ValueZero,
    QuarterInvalid,
    YearInvalid,
    IdentifierNameMismatch,
    /// Token read back from an artifact that this build does not know
    Other(String),
}

impl InconsistencyFlag {
    pub fn as_str(&self) -> &str {
        match self {
            InconsistencyFlag::IdentifierEmpty => "IDENTIFIER_EMPTY",
            InconsistencyFlag::IdentifierInvalid => "IDENTIFIER_INVALID",
            InconsistencyFlag::NameEmpty => "NAME_EMPTY",
            InconsistencyFlag::ValueNull => "VALUE_NULL",
            InconsistencyFlag::ValueNegative => "VALUE_NEGATIVE",
            InconsistencyFlag::ValueZero => "VALUE_ZERO",
            InconsistencyFlag::QuarterInvalid => "QUARTER_INVALID",
            InconsistencyFlag::YearInvalid => "YEAR_INVALID",
            InconsistencyFlag::IdentifierNameMismatch => "IDENTIFIER_NAME_MISMATCH",
            InconsistencyFlag::Other(token) => token,
        }
    }

    pub fn parse(token: &str) -> Self {
        match token.trim() {
            "IDENTIFIER_EMPTY" => InconsistencyFlag::IdentifierEmpty,
            "IDENTIFIER_INVALID" => InconsistencyFlag::IdentifierInvalid,
            "NAME_EMPTY" => InconsistencyFlag::NameEmpty,
            "VALUE_NULL" => InconsistencyFlag::ValueNull,
            "VALUE_NEGATIVE" => InconsistencyFlag::ValueNegative,
            "VALUE_ZERO" => InconsistencyFlag::ValueZero,
            "QUARTER_INVALID" => InconsistencyFlag::QuarterInvalid,
            "YEAR_INVALID" => InconsistencyFlag::YearInvalid,
            "IDENTIFIER_NAME_MISMATCH" => InconsistencyFlag::IdentifierNameMismatch,
            other => InconsistencyFlag::Other(other.to_string()),
        }
    }
}

impl fmt::Display for InconsistencyFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, duplicate-free set of flags. Insertion order is kept; nothing is
/// ever removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FlagSet {
    flags: Vec<InconsistencyFlag>,
}

impl FlagSet {
    pub const SEPARATOR: char = ';';

    pub fn new() -> Self {
        FlagSet::default()
    }

    pub fn insert(&mut self, flag: InconsistencyFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }

    pub fn contains(&self, flag: &InconsistencyFlag) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InconsistencyFlag> {
        self.flags.iter()
    }

    /// Storage form: "A;B;C", no trailing separator, "" when clean
    pub fn to_field(&self) -> String {
        self.flags
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn parse(field: &str) -> Self {
        let mut set = FlagSet::new();
        for token in field.split(Self::SEPARATOR) {
            if !token.trim().is_empty() {
                set.insert(InconsistencyFlag::parse(token));
            }
        }
        set
    }
}

impl Serialize for FlagSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_field())
    }
}

// ============================================================================
// PERIOD
// ============================================================================

/// A reporting quarter. Ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub year: i32,
    pub quarter: u8,
}

impl Period {
    pub fn new(year: i32, quarter: u8) -> Self {
        Period { year, quarter }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/Q{}", self.year, self.quarter)
    }
}

// ============================================================================
// EXPENSE RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpenseRecord {
    pub entity_id: String,
    pub entity_name: String,
    pub quarter: Option<i32>,
    pub year: Option<i32>,
    pub expense_value: Option<f64>,
    pub inconsistency_flags: FlagSet,
}

impl ExpenseRecord {
    pub const HEADERS: [&'static str; 6] = [
        "entity_id",
        "entity_name",
        "quarter",
        "year",
        "expense_value",
        "inconsistency_flags",
    ];

    pub fn new(entity_id: &str, entity_name: &str, year: i32, quarter: i32, value: Option<f64>) -> Self {
        ExpenseRecord {
            entity_id: entity_id.to_string(),
            entity_name: entity_name.to_string(),
            quarter: Some(quarter),
            year: Some(year),
            expense_value: value,
            inconsistency_flags: FlagSet::new(),
        }
    }

    pub fn flag(&mut self, flag: InconsistencyFlag) {
        self.inconsistency_flags.insert(flag);
    }

    pub fn has_flag(&self, flag: &InconsistencyFlag) -> bool {
        self.inconsistency_flags.contains(flag)
    }

    pub fn is_clean(&self) -> bool {
        self.inconsistency_flags.is_empty()
    }

    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.entity_id.clone(),
            self.entity_name.clone(),
            opt_to_field(self.quarter),
            opt_to_field(self.year),
            opt_to_field(self.expense_value),
            self.inconsistency_flags.to_field(),
        ]
    }
}

pub(crate) fn opt_to_field<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

// ============================================================================
// REGISTRY ENTRY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub registry_id: String,
    pub entity_id: String,
    pub entity_name: String,
    pub modality: String,
    pub region: String,
}

// ============================================================================
// ENRICHED RECORD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Match,
    NoMatch,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Match => "MATCH",
            MatchStatus::NoMatch => "NO_MATCH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRecord {
    pub record: ExpenseRecord,
    pub registry_id: String,
    pub modality: String,
    pub region: String,
    pub match_status: MatchStatus,
}

impl EnrichedRecord {
    pub const HEADERS: [&'static str; 10] = [
        "entity_id",
        "entity_name",
        "quarter",
        "year",
        "expense_value",
        "inconsistency_flags",
        "registry_id",
        "modality",
        "region",
        "match_status",
    ];

    pub fn to_row(&self) -> Vec<String> {
        let mut row = self.record.to_row();
        row.push(self.registry_id.clone());
        row.push(self.modality.clone());
        row.push(self.region.clone());
        row.push(self.match_status.as_str().to_string());
        row
    }
}

// ============================================================================
// AGGREGATED GROUP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedGroup {
    pub rank: usize,
    pub entity_name: String,
    pub region: String,
    pub total: f64,
    pub mean: f64,
    pub mean_per_period: f64,
    pub std_dev: f64,
    pub coefficient_of_variation: f64,
    pub sample_count: usize,
    pub high_variability: bool,
}
