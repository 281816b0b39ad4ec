// 🔗 Enricher - left join of validated expenses onto the registry
//
// Every input row comes out exactly once. Matched rows gain registry_id,
// modality and region; the rest are NO_MATCH with empty registry fields.

use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::records::{EnrichedRecord, ExpenseRecord, MatchStatus};
use crate::registry::Registry;

const TOP_UNMATCHED: usize = 10;

pub fn enrich(records: Vec<ExpenseRecord>, registry: &Registry) -> Vec<EnrichedRecord> {
    if registry.is_empty() {
        warn!("registry is empty; every record will be NO_MATCH");
    }

    let enriched: Vec<EnrichedRecord> = records
        .into_iter()
        .map(|record| match registry.lookup(&record.entity_id) {
            Some(entry) => EnrichedRecord {
                registry_id: entry.registry_id.clone(),
                modality: entry.modality.clone(),
                region: entry.region.clone(),
                match_status: MatchStatus::Match,
                record,
            },
            None => EnrichedRecord {
                registry_id: String::new(),
                modality: String::new(),
                region: String::new(),
                match_status: MatchStatus::NoMatch,
                record,
            },
        })
        .collect();

    let matched = enriched
        .iter()
        .filter(|r| r.match_status == MatchStatus::Match)
        .count();
    info!("enrichment: {}/{} records matched the registry", matched, enriched.len());

    enriched
}

// ============================================================================
// ENRICHMENT SUMMARY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct EnrichmentSummary {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    /// matched / total, in percent (0 for an empty batch)
    pub match_rate: f64,
    /// Most frequent unmatched identifiers with their row counts
    pub top_unmatched: Vec<(String, usize)>,
}

impl EnrichmentSummary {
    pub fn from_records(records: &[EnrichedRecord]) -> Self {
        let total = records.len();
        let matched = records
            .iter()
            .filter(|r| r.match_status == MatchStatus::Match)
            .count();

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for r in records.iter().filter(|r| r.match_status == MatchStatus::NoMatch) {
            *counts.entry(r.record.entity_id.as_str()).or_insert(0) += 1;
        }
        let mut top_unmatched: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(id, n)| (id.to_string(), n))
            .collect();
        top_unmatched.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_unmatched.truncate(TOP_UNMATCHED);

        EnrichmentSummary {
            total,
            matched,
            unmatched: total - matched,
            match_rate: if total == 0 {
                0.0
            } else {
                matched as f64 / total as f64 * 100.0
            },
            top_unmatched,
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} records: {} matched, {} unmatched ({:.1}% match rate)",
            self.total, self.matched, self.unmatched, self.match_rate
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RegistryEntry;

    fn registry() -> Registry {
        Registry::from_entries(vec![
            RegistryEntry {
                registry_id: "123".into(),
                entity_id: "11222333000181".into(),
                entity_name: "OPERADORA TESTE".into(),
                modality: "Medicina de Grupo".into(),
                region: "SP".into(),
            },
            RegistryEntry {
                registry_id: "456".into(),
                entity_id: "11222333000181".into(),
                entity_name: "SEGUNDA LINHA".into(),
                modality: "Odontologia".into(),
                region: "RJ".into(),
            },
        ])
    }

    fn record(id: &str) -> ExpenseRecord {
        ExpenseRecord::new(id, "X", 2025, 1, Some(1.0))
    }

    #[test]
    fn test_left_join_preserves_length() {
        let input = vec![
            record("11222333000181"),
            record("11444777000161"),
            record(""),
            record("11222333000181"),
        ];

        let output = enrich(input.clone(), &registry());

        assert_eq!(output.len(), input.len());
        for (before, after) in input.iter().zip(output.iter()) {
            assert_eq!(before, &after.record);
        }
    }

    #[test]
    fn test_matched_rows_gain_registry_fields_first_wins() {
        let output = enrich(vec![record("11222333000181")], &registry());

        assert_eq!(output[0].match_status, MatchStatus::Match);
        assert_eq!(output[0].registry_id, "123");
        assert_eq!(output[0].region, "SP");
        assert_eq!(output[0].modality, "Medicina de Grupo");
    }

    #[test]
    fn test_empty_identifier_never_matches() {
        let output = enrich(vec![record("")], &registry());

        assert_eq!(output[0].match_status, MatchStatus::NoMatch);
        assert_eq!(output[0].registry_id, "");
        assert_eq!(output[0].region, "");
    }

    #[test]
    fn test_registry_id_without_leading_zero_matches_validated_expense() {
        use crate::validator::ExpenseValidator;

        let registry = Registry::from_entries(vec![RegistryEntry {
            registry_id: "555".into(),
            entity_id: "1222333000181".into(),
            entity_name: "ZERO A ESQUERDA".into(),
            modality: "Autogestao".into(),
            region: "BA".into(),
        }]);
        let expenses = ExpenseValidator::new().validate(vec![ExpenseRecord::new(
            "01.222.333/0001-81",
            "ZERO A ESQUERDA",
            2025,
            1,
            Some(10.0),
        )]);

        let output = enrich(expenses, &registry);

        assert_eq!(output[0].record.entity_id, "01222333000181");
        assert_eq!(output[0].match_status, MatchStatus::Match);
        assert_eq!(output[0].registry_id, "555");
        assert_eq!(output[0].region, "BA");
    }

    #[test]
    fn test_empty_registry_means_no_match() {
        let output = enrich(vec![record("11222333000181")], &Registry::default());
        assert_eq!(output[0].match_status, MatchStatus::NoMatch);
    }

    #[test]
    fn test_enrichment_summary() {
        let output = enrich(
            vec![
                record("11222333000181"),
                record("11444777000161"),
                record("11444777000161"),
                record(""),
            ],
            &registry(),
        );
        let summary = EnrichmentSummary::from_records(&output);

        println!("Enrichment: {}", summary.summary());

        assert_eq!(summary.matched, 1);
        assert_eq!(summary.unmatched, 3);
        assert_eq!(summary.match_rate, 25.0);
        assert_eq!(summary.top_unmatched[0], ("11444777000161".to_string(), 2));
    }
}
