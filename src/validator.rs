// ✅ Expense Validator - non-destructive row checks
//
// Every check only ADDS flags; rows are never dropped and validation never
// fails. Per-row checks run in flag order, then one cross-row pass flags
// identifiers reported under more than one name.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::identifier::{clean_identifier, is_valid_identifier, normalize_identifier};
use crate::records::{ExpenseRecord, InconsistencyFlag};

// ============================================================================
// VALIDATOR
// ============================================================================

pub struct ExpenseValidator {
    min_year: i32,
    max_year: i32,
}

impl ExpenseValidator {
    pub fn new() -> Self {
        ExpenseValidator {
            min_year: 2000,
            max_year: 2030,
        }
    }

    /// Validate a batch. Same length and order out as in.
    pub fn validate(&self, mut records: Vec<ExpenseRecord>) -> Vec<ExpenseRecord> {
        for record in records.iter_mut() {
            self.validate_record(record);
        }
        flag_name_mismatches(&mut records);

        let flagged = records.iter().filter(|r| !r.is_clean()).count();
        if flagged > 0 {
            warn!("{} of {} records carry inconsistency flags", flagged, records.len());
        }
        records
    }

    /// Per-row checks only
    pub fn validate_record(&self, record: &mut ExpenseRecord) {
        self.check_identifier(record);
        self.check_name(record);
        self.check_value(record);
        self.check_period(record);
    }

    // ========================================================================
    // VALIDATION RULES
    // ========================================================================

    /// Length is judged on the cleaned digits; the stored form is padded.
    fn check_identifier(&self, record: &mut ExpenseRecord) {
        let digits = clean_identifier(&record.entity_id);

        if digits.is_empty() {
            record.entity_id = String::new();
            record.flag(InconsistencyFlag::IdentifierEmpty);
            return;
        }

        if !is_valid_identifier(&digits) {
            record.flag(InconsistencyFlag::IdentifierInvalid);
        }
        record.entity_id = normalize_identifier(&digits);
    }

    fn check_name(&self, record: &mut ExpenseRecord) {
        let name = record.entity_name.trim();
        if name.is_empty() || name.eq_ignore_ascii_case("nan") {
            record.entity_name = String::new();
            record.flag(InconsistencyFlag::NameEmpty);
        } else if name.len() != record.entity_name.len() {
            record.entity_name = name.to_string();
        }
    }

    fn check_value(&self, record: &mut ExpenseRecord) {
        match record.expense_value {
            None => record.flag(InconsistencyFlag::ValueNull),
            Some(v) if v.is_nan() => {
                record.expense_value = None;
                record.flag(InconsistencyFlag::ValueNull);
            }
            Some(v) if v < 0.0 => record.flag(InconsistencyFlag::ValueNegative),
            Some(v) if v == 0.0 => record.flag(InconsistencyFlag::ValueZero),
            Some(_) => {}
        }
    }

    fn check_period(&self, record: &mut ExpenseRecord) {
        if !matches!(record.quarter, Some(q) if (1..=4).contains(&q)) {
            record.flag(InconsistencyFlag::QuarterInvalid);
        }
        if !matches!(record.year, Some(y) if (self.min_year..=self.max_year).contains(&y)) {
            record.flag(InconsistencyFlag::YearInvalid);
        }
    }

    // ========================================================================
    // SUMMARY
    // ========================================================================

    pub fn summary(&self, records: &[ExpenseRecord]) -> ValidationSummary {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for record in records {
            for flag in record.inconsistency_flags.iter() {
                *counts.entry(flag.as_str().to_string()).or_insert(0) += 1;
            }
        }

        let mut flag_counts: Vec<(String, usize)> = counts.into_iter().collect();
        flag_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let clean = records.iter().filter(|r| r.is_clean()).count();
        ValidationSummary {
            total: records.len(),
            clean,
            flagged: records.len() - clean,
            flag_counts,
        }
    }
}

impl Default for ExpenseValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Flag every row whose identifier appears with more than one distinct
/// trimmed name. Empty identifiers are not an identity and are skipped.
fn flag_name_mismatches(records: &mut [ExpenseRecord]) {
    let mut names: HashMap<&str, HashSet<&str>> = HashMap::new();
    for record in records.iter() {
        if !record.entity_id.is_empty() {
            names
                .entry(record.entity_id.as_str())
                .or_default()
                .insert(record.entity_name.trim());
        }
    }

    let conflicting: HashSet<String> = names
        .into_iter()
        .filter(|(_, set)| set.len() > 1)
        .map(|(id, _)| id.to_string())
        .collect();

    if conflicting.is_empty() {
        return;
    }
    info!("{} identifiers reported under more than one name", conflicting.len());

    for record in records.iter_mut() {
        if conflicting.contains(&record.entity_id) {
            record.flag(InconsistencyFlag::IdentifierNameMismatch);
        }
    }
}

// ============================================================================
// VALIDATION SUMMARY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub clean: usize,
    pub flagged: usize,
    /// (flag token, rows carrying it), most frequent first
    pub flag_counts: Vec<(String, usize)>,
}

impl ValidationSummary {
    pub fn summary(&self) -> String {
        let breakdown = self
            .flag_counts
            .iter()
            .map(|(flag, n)| format!("{}={}", flag, n))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} records: {} clean, {} flagged [{}]",
            self.total, self.clean, self.flagged, breakdown
        )
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_valid_record() -> ExpenseRecord {
        ExpenseRecord::new("11.222.333/0001-81", "Operadora Teste", 2025, 1, Some(100.5))
    }

    fn flags_of(record: &ExpenseRecord) -> String {
        record.inconsistency_flags.to_field()
    }

    #[test]
    fn test_validate_clean_record() {
        let validator = ExpenseValidator::new();
        let records = validator.validate(vec![create_valid_record()]);

        assert!(records[0].is_clean());
        assert_eq!(records[0].entity_id, "11222333000181");
    }

    #[test]
    fn test_empty_identifier() {
        let validator = ExpenseValidator::new();
        let mut record = create_valid_record();
        record.entity_id = "  --  ".to_string();

        let records = validator.validate(vec![record]);

        assert_eq!(flags_of(&records[0]), "IDENTIFIER_EMPTY");
        assert_eq!(records[0].entity_id, "");
    }

    #[test]
    fn test_bad_checksum() {
        let validator = ExpenseValidator::new();
        let mut record = create_valid_record();
        record.entity_id = "11222333000182".to_string();

        let records = validator.validate(vec![record]);
        assert_eq!(flags_of(&records[0]), "IDENTIFIER_INVALID");
    }

    #[test]
    fn test_short_identifier_flagged_then_padded() {
        let validator = ExpenseValidator::new();
        let mut record = create_valid_record();
        record.entity_id = "1222333000181".to_string();

        let records = validator.validate(vec![record]);

        assert!(records[0].has_flag(&InconsistencyFlag::IdentifierInvalid));
        assert_eq!(records[0].entity_id, "01222333000181");
    }

    #[test]
    fn test_name_nan_is_empty() {
        let validator = ExpenseValidator::new();
        let mut record = create_valid_record();
        record.entity_name = " nan ".to_string();

        let records = validator.validate(vec![record]);
        assert_eq!(flags_of(&records[0]), "NAME_EMPTY");
    }

    #[test]
    fn test_value_checks_are_exclusive() {
        let validator = ExpenseValidator::new();
        let cases = [
            (None, "VALUE_NULL"),
            (Some(-5.0), "VALUE_NEGATIVE"),
            (Some(0.0), "VALUE_ZERO"),
            (Some(f64::NAN), "VALUE_NULL"),
        ];

        for (value, expected) in cases {
            let mut record = create_valid_record();
            record.expense_value = value;
            let records = validator.validate(vec![record]);
            assert_eq!(flags_of(&records[0]), expected);
        }
    }

    #[test]
    fn test_period_ranges() {
        let validator = ExpenseValidator::new();
        let mut record = create_valid_record();
        record.quarter = Some(5);
        record.year = Some(1999);
        let mut absent = create_valid_record();
        absent.quarter = None;
        absent.year = None;

        let records = validator.validate(vec![record, absent]);

        assert_eq!(flags_of(&records[0]), "QUARTER_INVALID;YEAR_INVALID");
        assert_eq!(flags_of(&records[1]), "QUARTER_INVALID;YEAR_INVALID");
    }

    #[test]
    fn test_flags_accumulate_in_order() {
        let validator = ExpenseValidator::new();
        let record = ExpenseRecord {
            entity_id: "".into(),
            entity_name: "".into(),
            quarter: Some(0),
            year: Some(2031),
            expense_value: Some(-1.0),
            inconsistency_flags: Default::default(),
        };

        let records = validator.validate(vec![record]);

        assert_eq!(
            flags_of(&records[0]),
            "IDENTIFIER_EMPTY;NAME_EMPTY;VALUE_NEGATIVE;QUARTER_INVALID;YEAR_INVALID"
        );
    }

    #[test]
    fn test_existing_flags_are_kept() {
        let validator = ExpenseValidator::new();
        let mut record = create_valid_record();
        record.flag(InconsistencyFlag::Other("UPSTREAM".into()));

        let records = validator.validate(vec![record]);
        assert_eq!(flags_of(&records[0]), "UPSTREAM");
    }

    #[test]
    fn test_name_mismatch_flags_every_row() {
        let validator = ExpenseValidator::new();
        let a = create_valid_record();
        let mut b = create_valid_record();
        b.entity_name = "Outro Nome".into();
        let mut c = create_valid_record();
        c.entity_id = "11444777000161".into();

        let records = validator.validate(vec![a, b, c]);

        assert!(records[0].has_flag(&InconsistencyFlag::IdentifierNameMismatch));
        assert!(records[1].has_flag(&InconsistencyFlag::IdentifierNameMismatch));
        assert!(records[2].is_clean());
    }

    #[test]
    fn test_empty_ids_never_mismatch() {
        let validator = ExpenseValidator::new();
        let mut a = create_valid_record();
        a.entity_id = "".into();
        let mut b = a.clone();
        b.entity_name = "Other".into();

        let records = validator.validate(vec![a, b]);
        assert!(records
            .iter()
            .all(|r| !r.has_flag(&InconsistencyFlag::IdentifierNameMismatch)));
    }

    #[test]
    fn test_validation_summary() {
        let validator = ExpenseValidator::new();
        let mut zero = create_valid_record();
        zero.expense_value = Some(0.0);
        let mut zero_too = create_valid_record();
        zero_too.expense_value = Some(0.0);
        zero_too.quarter = Some(9);

        let records = validator.validate(vec![create_valid_record(), zero, zero_too]);
        let summary = validator.summary(&records);

        println!("Validation summary: {}", summary.summary());

        assert_eq!(summary.total, 3);
        assert_eq!(summary.clean, 1);
        assert_eq!(summary.flagged, 2);
        assert_eq!(summary.flag_counts[0], ("VALUE_ZERO".to_string(), 2));
    }
}
