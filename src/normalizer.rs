// 🔀 Schema Normalizer - heterogeneous portal layouts → ExpenseRecord
//
// Three strategies, chosen from the header alone:
//   Ledger      registry-id column + description column (accounting export)
//   Flat        any known synonym column (tabular export)
//   Passthrough nothing recognised; best-effort records, warning logged
//
// Ledger wins whenever its two trigger columns exist, even if flat columns
// are also present. No strategy validates; that is the validator's job.

use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;
use crate::records::ExpenseRecord;
use crate::registry::Registry;
use crate::tabular::{parse_decimal, parse_int, read_table, RawTable};

// ============================================================================
// SYNONYMS
// ============================================================================

const ID_SYNONYMS: &[&str] = &["cnpj", "cnpj_operadora", "cd_cnpj", "num_cnpj", "entity_id"];
const NAME_SYNONYMS: &[&str] = &[
    "razao_social",
    "razaosocial",
    "nm_razao_social",
    "nome",
    "operadora",
    "entity_name",
];
const QUARTER_SYNONYMS: &[&str] = &["trimestre", "tri", "cd_trimestre", "num_trimestre", "quarter"];
const YEAR_SYNONYMS: &[&str] = &["ano", "ano_competencia", "cd_ano", "year"];
const VALUE_SYNONYMS: &[&str] = &[
    "valor",
    "valor_despesa",
    "valor_despesas",
    "vl_despesa",
    "despesa",
    "despesas",
    "eventos",
    "sinistros",
    "expense_value",
    "expense",
    "expenses",
];

const LEDGER_REGISTRY_COLUMNS: &[&str] = &["reg_ans", "registro_ans"];
const LEDGER_DESCRIPTION_COLUMNS: &[&str] = &["descricao", "description"];
const LEDGER_VALUE_COLUMNS: &[&str] = &["vl_saldo_final", "valor_saldo_final", "closing_balance"];
const LEDGER_KEEP_TOKENS: &[&str] = &["evento", "sinistro", "event", "claim"];

// ============================================================================
// STRATEGY
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Ledger,
    Flat,
    Passthrough,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Ledger => "ledger",
            Strategy::Flat => "flat",
            Strategy::Passthrough => "passthrough",
        }
    }
}

fn has_any(headers: &[String], candidates: &[&str]) -> bool {
    headers.iter().any(|h| candidates.contains(&h.as_str()))
}

/// Pick a strategy from normalized headers
pub fn detect_strategy(headers: &[String]) -> Strategy {
    if has_any(headers, LEDGER_REGISTRY_COLUMNS) && has_any(headers, LEDGER_DESCRIPTION_COLUMNS) {
        return Strategy::Ledger;
    }

    let flat_columns = [
        ID_SYNONYMS,
        NAME_SYNONYMS,
        QUARTER_SYNONYMS,
        YEAR_SYNONYMS,
        VALUE_SYNONYMS,
    ];
    if flat_columns.iter().any(|synonyms| has_any(headers, synonyms)) {
        Strategy::Flat
    } else {
        Strategy::Passthrough
    }
}

/// Dispatch a raw table to its strategy. Never fails.
pub fn normalize(table: &RawTable, year: i32, quarter: i32, registry: &Registry) -> Vec<ExpenseRecord> {
    let strategy = detect_strategy(&table.normalized_headers());

    let records = match strategy {
        Strategy::Ledger => ledger_records(table, year, quarter, registry),
        Strategy::Flat => flat_records(table, year, quarter),
        Strategy::Passthrough => {
            warn!(
                "no known columns in {:?}; keeping {} rows as empty records",
                table.headers,
                table.len()
            );
            passthrough_records(table, year, quarter)
        }
    };

    info!(
        "normalized {} rows into {} records ({} strategy)",
        table.len(),
        records.len(),
        strategy.name()
    );
    records
}

/// Read one file and normalize it. Only reading can fail.
pub fn normalize_file(path: &Path, year: i32, quarter: i32, registry: &Registry) -> Result<Vec<ExpenseRecord>> {
    let table = read_table(path)?;
    Ok(normalize(&table, year, quarter, registry))
}

// ============================================================================
// STRATEGIES
// ============================================================================

fn flat_records(table: &RawTable, year: i32, quarter: i32) -> Vec<ExpenseRecord> {
    let id_col = table.find_column(ID_SYNONYMS);
    let name_col = table.find_column(NAME_SYNONYMS);
    let quarter_col = table.find_column(QUARTER_SYNONYMS);
    let year_col = table.find_column(YEAR_SYNONYMS);
    let value_col = table.find_column(VALUE_SYNONYMS);

    table
        .rows
        .iter()
        .map(|row| ExpenseRecord {
            entity_id: table.cell(row, id_col).trim().to_string(),
            entity_name: table.cell(row, name_col).trim().to_string(),
            quarter: match quarter_col {
                Some(_) => parse_int(table.cell(row, quarter_col)),
                None => Some(quarter),
            },
            year: match year_col {
                Some(_) => parse_int(table.cell(row, year_col)),
                None => Some(year),
            },
            expense_value: parse_decimal(table.cell(row, value_col)),
            inconsistency_flags: Default::default(),
        })
        .collect()
}

fn ledger_records(table: &RawTable, year: i32, quarter: i32, registry: &Registry) -> Vec<ExpenseRecord> {
    let registry_col = table.find_column(LEDGER_REGISTRY_COLUMNS);
    let description_col = table.find_column(LEDGER_DESCRIPTION_COLUMNS);
    let value_col = table.find_column(LEDGER_VALUE_COLUMNS);

    let mut unresolved = 0usize;
    let records: Vec<ExpenseRecord> = table
        .rows
        .iter()
        .filter(|row| {
            let description = table.cell(row, description_col).to_lowercase();
            LEDGER_KEEP_TOKENS.iter().any(|t| description.contains(t))
        })
        .map(|row| {
            let (entity_id, entity_name) = match registry.resolve_registry_id(table.cell(row, registry_col)) {
                Some(entry) => (entry.entity_id.clone(), entry.entity_name.clone()),
                None => {
                    unresolved += 1;
                    (String::new(), String::new())
                }
            };

            ExpenseRecord {
                entity_id,
                entity_name,
                quarter: Some(quarter),
                year: Some(year),
                expense_value: parse_decimal(table.cell(row, value_col)),
                inconsistency_flags: Default::default(),
            }
        })
        .collect();

    if records.is_empty() {
        warn!("ledger file has no event/claim rows");
    }
    if unresolved > 0 {
        warn!("{} ledger rows reference unknown registry ids", unresolved);
    }
    records
}

fn passthrough_records(table: &RawTable, year: i32, quarter: i32) -> Vec<ExpenseRecord> {
    table
        .rows
        .iter()
        .map(|_| ExpenseRecord {
            entity_id: String::new(),
            entity_name: String::new(),
            quarter: Some(quarter),
            year: Some(year),
            expense_value: None,
            inconsistency_flags: Default::default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RegistryEntry;
    use crate::tabular::{parse_table, DELIMITER};

    fn registry() -> Registry {
        Registry::from_entries(vec![RegistryEntry {
            registry_id: "123".into(),
            entity_id: "11222333000181".into(),
            entity_name: "OPERADORA TESTE".into(),
            modality: "Medicina de Grupo".into(),
            region: "SP".into(),
        }])
    }

    fn table(text: &str) -> RawTable {
        parse_table(text, DELIMITER).unwrap()
    }

    #[test]
    fn test_detect_strategy() {
        let h = |cols: &[&str]| cols.iter().map(|c| c.to_string()).collect::<Vec<_>>();
        assert_eq!(detect_strategy(&h(&["reg_ans", "descricao"])), Strategy::Ledger);
        assert_eq!(detect_strategy(&h(&["cnpj", "valor"])), Strategy::Flat);
        assert_eq!(detect_strategy(&h(&["reg_ans", "valor"])), Strategy::Flat);
        assert_eq!(detect_strategy(&h(&["foo", "bar"])), Strategy::Passthrough);
    }

    #[test]
    fn test_ledger_wins_over_flat_columns() {
        let t = table(
            "REG_ANS;DESCRICAO;VL_SALDO_FINAL;CNPJ;VALOR\n\
             123;EVENTOS INDENIZAVEIS;1.500,25;99999999999999;1\n",
        );
        let records = normalize(&t, 2025, 2, &registry());

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entity_id, "11222333000181");
        assert_eq!(records[0].expense_value, Some(1500.25));
    }

    #[test]
    fn test_ledger_filters_and_keeps_unmatched() {
        let t = table(
            "reg_ans;descricao;vl_saldo_final\n\
             123;Eventos conhecidos;100\n\
             123;Receitas;999\n\
             777;SINISTROS A LIQUIDAR;50\n",
        );
        let records = normalize(&t, 2025, 1, &registry());

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entity_name, "OPERADORA TESTE");
        assert_eq!(records[0].year, Some(2025));
        assert_eq!(records[0].quarter, Some(1));
        // unknown registry id: empty identity, row kept
        assert_eq!(records[1].entity_id, "");
        assert_eq!(records[1].entity_name, "");
        assert_eq!(records[1].expense_value, Some(50.0));
    }

    #[test]
    fn test_flat_synonyms_and_injected_period() {
        let t = table(
            "CNPJ;Razao Social;Valor Despesas;Coluna Extra\n\
             11.222.333/0001-81;Operadora Teste;1.234,56;x\n",
        );
        let records = normalize(&t, 2024, 4, &registry());

        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.entity_id, "11.222.333/0001-81");
        assert_eq!(r.entity_name, "Operadora Teste");
        assert_eq!(r.expense_value, Some(1234.56));
        assert_eq!(r.year, Some(2024));
        assert_eq!(r.quarter, Some(4));
    }

    #[test]
    fn test_flat_keeps_source_period_when_present() {
        let t = table("cnpj;ano;trimestre;valor\n1;2023;x;10\n");
        let records = normalize(&t, 2025, 1, &registry());

        assert_eq!(records[0].year, Some(2023));
        // present but unparsable: absent, to be flagged
        assert_eq!(records[0].quarter, None);
    }

    #[test]
    fn test_flat_missing_value_column_is_absent() {
        let t = table("cnpj;nome\n11222333000181;X\n");
        let records = normalize(&t, 2025, 1, &registry());
        assert_eq!(records[0].expense_value, None);
    }

    #[test]
    fn test_passthrough_never_fails() {
        let t = table("foo;bar\n1;2\n3;4\n");
        let records = normalize(&t, 2025, 3, &registry());

        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.entity_id.is_empty() && r.expense_value.is_none()));
        assert_eq!(records[0].quarter, Some(3));
    }
}
