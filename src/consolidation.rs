// 🧮 Consolidation - merge per-file batches into one ordered dataset
//
// Exact duplicates (same identity, period, value and flags) collapse to the
// first occurrence. The result is ordered newest period first, then by
// identifier.

use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::info;

use crate::records::{opt_to_field, ExpenseRecord};

/// Content fingerprint of a record. Equal records share a fingerprint.
pub fn fingerprint(record: &ExpenseRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!(
        "{}|{}|{}|{}|{}|{}",
        record.entity_id,
        record.entity_name,
        opt_to_field(record.year),
        opt_to_field(record.quarter),
        opt_to_field(record.expense_value),
        record.inconsistency_flags.to_field()
    ));
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct Consolidated {
    pub records: Vec<ExpenseRecord>,
    pub duplicates_removed: usize,
}

impl Consolidated {
    /// Rows carrying at least one flag, for the inconsistency artifact
    pub fn inconsistent(&self) -> Vec<ExpenseRecord> {
        self.records.iter().filter(|r| !r.is_clean()).cloned().collect()
    }
}

/// Descending, absent values last
fn desc_absent_last(a: Option<i32>, b: Option<i32>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

pub fn consolidate(batches: Vec<Vec<ExpenseRecord>>) -> Consolidated {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut duplicates_removed = 0;

    for record in batches.into_iter().flatten() {
        if seen.insert(fingerprint(&record)) {
            records.push(record);
        } else {
            duplicates_removed += 1;
        }
    }

    // stable: equal keys keep file order
    records.sort_by(|a, b| {
        desc_absent_last(a.year, b.year)
            .then_with(|| desc_absent_last(a.quarter, b.quarter))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });

    info!(
        "consolidated {} records ({} exact duplicates removed)",
        records.len(),
        duplicates_removed
    );

    Consolidated {
        records,
        duplicates_removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::InconsistencyFlag;

    fn record(id: &str, year: i32, quarter: i32, value: f64) -> ExpenseRecord {
        ExpenseRecord::new(id, "OPERADORA", year, quarter, Some(value))
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = record("11222333000181", 2025, 1, 10.0);
        let hash1 = fingerprint(&a);
        let hash2 = fingerprint(&a.clone());

        println!("Fingerprint: {}", hash1);

        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_flags_change_fingerprint() {
        let a = record("11222333000181", 2025, 1, 10.0);
        let mut b = a.clone();
        b.flag(InconsistencyFlag::ValueZero);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_exact_duplicates_removed_across_batches() {
        let a = record("11222333000181", 2025, 1, 10.0);
        let b = record("11222333000181", 2025, 1, 20.0);

        let result = consolidate(vec![vec![a.clone(), b], vec![a]]);

        assert_eq!(result.records.len(), 2);
        assert_eq!(result.duplicates_removed, 1);
    }

    #[test]
    fn test_order_newest_first_then_identifier() {
        let result = consolidate(vec![vec![
            record("2", 2024, 4, 1.0),
            record("3", 2025, 1, 1.0),
            record("1", 2025, 1, 1.0),
            record("1", 2025, 2, 1.0),
        ]]);

        let keys: Vec<(Option<i32>, Option<i32>, &str)> = result
            .records
            .iter()
            .map(|r| (r.year, r.quarter, r.entity_id.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![
                (Some(2025), Some(2), "1"),
                (Some(2025), Some(1), "1"),
                (Some(2025), Some(1), "3"),
                (Some(2024), Some(4), "2"),
            ]
        );
    }

    #[test]
    fn test_absent_period_sorts_last() {
        let mut undated = record("1", 2025, 1, 1.0);
        undated.year = None;
        let result = consolidate(vec![vec![undated, record("2", 2001, 1, 1.0)]]);
        assert_eq!(result.records[1].year, None);
    }

    #[test]
    fn test_inconsistent_subset() {
        let mut flagged = record("1", 2025, 1, 0.0);
        flagged.flag(InconsistencyFlag::ValueZero);
        let result = consolidate(vec![vec![flagged, record("2", 2025, 1, 5.0)]]);

        let inconsistent = result.inconsistent();
        assert_eq!(inconsistent.len(), 1);
        assert_eq!(inconsistent[0].entity_id, "1");
    }
}
