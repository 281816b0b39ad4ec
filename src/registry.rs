// 🏛️ Operator Registry - snapshot parsing, dedup, lookups
//
// The registry maps two keys onto one operator:
//   entity_id   (14 digits)  → used by the enricher's left join
//   registry_id (portal id)  → used by ledger-style files
//
// Both indices keep the FIRST occurrence of a key.

use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::config::REGISTRY_INDEX_URL;
use crate::error::{PipelineError, Result};
use crate::fetcher::Fetcher;
use crate::identifier::{normalize_identifier, IDENTIFIER_LEN};
use crate::records::RegistryEntry;
use crate::tabular::{read_table, RawTable};

const ENTITY_ID_COLUMNS: &[&str] = &["cnpj", "cd_cnpj", "entity_id"];
const REGISTRY_ID_COLUMNS: &[&str] = &[
    "registro_ans",
    "cd_registro_ans",
    "registro_operadora",
    "registro_operadora_ans",
    "reg_ans",
    "registry_id",
];
const NAME_COLUMNS: &[&str] = &["razao_social", "nm_razao_social", "entity_name"];
const MODALITY_COLUMNS: &[&str] = &["modalidade", "ds_modalidade", "sg_modalidade", "modality"];
const REGION_COLUMNS: &[&str] = &["uf", "sg_uf", "region"];

// ============================================================================
// PARSING
// ============================================================================

/// Map a registry table onto entries. Every row is kept with its identifier
/// cleaned and zero-padded; dedup happens in `Registry::from_entries`.
///
/// A table without an identifier column cannot be joined on and is a
/// structural error.
pub fn parse_registry(table: &RawTable) -> Result<Vec<RegistryEntry>> {
    let id_col = table.find_column(ENTITY_ID_COLUMNS).ok_or_else(|| {
        PipelineError::Structural(format!(
            "registry has no identifier column (expected one of {:?}, found {:?})",
            ENTITY_ID_COLUMNS,
            table.normalized_headers()
        ))
    })?;
    let registry_col = table.find_column(REGISTRY_ID_COLUMNS);
    let name_col = table.find_column(NAME_COLUMNS);
    let modality_col = table.find_column(MODALITY_COLUMNS);
    let region_col = table.find_column(REGION_COLUMNS);

    let entries = table
        .rows
        .iter()
        .map(|row| RegistryEntry {
            registry_id: table.cell(row, registry_col).trim().to_string(),
            entity_id: normalize_identifier(table.cell(row, Some(id_col))),
            entity_name: table.cell(row, name_col).trim().to_string(),
            modality: table.cell(row, modality_col).trim().to_string(),
            region: table.cell(row, region_col).trim().to_uppercase(),
        })
        .collect();

    Ok(entries)
}

/// Read and parse a registry snapshot file (encoding fallback applies)
pub fn load_registry_file(path: &Path) -> Result<Vec<RegistryEntry>> {
    let table = read_table(path)?;
    parse_registry(&table)
}

// ============================================================================
// INDEXED REGISTRY
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Registry {
    /// One entry per padded 14-digit entity_id, first occurrence wins.
    /// Ids still longer than 14 digits after cleaning are dropped.
    entries: Vec<RegistryEntry>,
    by_entity: HashMap<String, usize>,
    by_registry: HashMap<String, RegistryEntry>,
}

impl Registry {
    pub fn from_entries(raw: Vec<RegistryEntry>) -> Self {
        let mut registry = Registry::default();
        let mut dropped = 0;

        for mut entry in raw {
            entry.entity_id = normalize_identifier(&entry.entity_id);

            if !entry.registry_id.is_empty() {
                registry
                    .by_registry
                    .entry(entry.registry_id.clone())
                    .or_insert_with(|| entry.clone());
            }

            if entry.entity_id.len() != IDENTIFIER_LEN {
                dropped += 1;
                continue;
            }
            if registry.by_entity.contains_key(&entry.entity_id) {
                continue;
            }
            registry
                .by_entity
                .insert(entry.entity_id.clone(), registry.entries.len());
            registry.entries.push(entry);
        }

        if dropped > 0 {
            warn!("registry: {} rows without a usable identifier dropped", dropped);
        }
        registry
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup by entity identifier (normalized first). Empty never matches.
    pub fn lookup(&self, entity_id: &str) -> Option<&RegistryEntry> {
        let id = normalize_identifier(entity_id);
        if id.is_empty() {
            return None;
        }
        self.by_entity.get(&id).map(|idx| &self.entries[*idx])
    }

    /// Lookup by the portal's registry id
    pub fn resolve_registry_id(&self, registry_id: &str) -> Option<&RegistryEntry> {
        let key = registry_id.trim();
        if key.is_empty() {
            return None;
        }
        self.by_registry.get(key)
    }
}

// ============================================================================
// SOURCES
// ============================================================================

/// Where the registry comes from. `cache_path` is where a snapshot is (or
/// will be) persisted.
pub trait RegistrySource {
    fn get_or_fetch(&self, cache_path: &Path) -> Result<Vec<RegistryEntry>>;
}

/// Downloads the newest snapshot on first use and reuses the cached file
/// afterwards. Without a fetcher only the cache is consulted.
pub struct CachedRegistrySource {
    fetcher: Option<Fetcher>,
    index_url: String,
}

impl CachedRegistrySource {
    pub fn new(fetcher: Fetcher) -> Self {
        CachedRegistrySource {
            fetcher: Some(fetcher),
            index_url: REGISTRY_INDEX_URL.to_string(),
        }
    }

    pub fn offline() -> Self {
        CachedRegistrySource {
            fetcher: None,
            index_url: REGISTRY_INDEX_URL.to_string(),
        }
    }

    pub fn with_index_url(mut self, url: &str) -> Self {
        self.index_url = url.trim_end_matches('/').to_string();
        self
    }

    fn download_snapshot(&self, fetcher: &Fetcher, cache_path: &Path) -> Result<()> {
        info!("registry snapshot not cached, downloading");
        let listing_url = format!("{}/", self.index_url);
        let response = fetcher.client().get(&listing_url)?;
        if !response.is_success() {
            return Err(PipelineError::transport(
                &listing_url,
                format!("HTTP {}", response.status),
            ));
        }
        let listing = response.text()?;

        let pattern = Regex::new(r#"(?i)href="(Relatorio_cadop[^"]*\.csv)""#)
            .map_err(|e| PipelineError::Config(e.to_string()))?;
        // The newest snapshot is listed last
        let name = pattern
            .captures_iter(&listing)
            .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
            .last()
            .ok_or_else(|| PipelineError::transport(&listing_url, "no registry snapshot listed"))?;

        fetcher.download_to(&format!("{}{}", listing_url, name), cache_path)?;
        info!("registry snapshot saved to {}", cache_path.display());
        Ok(())
    }
}

impl RegistrySource for CachedRegistrySource {
    fn get_or_fetch(&self, cache_path: &Path) -> Result<Vec<RegistryEntry>> {
        let cached = fs::metadata(cache_path).map(|m| m.len() > 0).unwrap_or(false);

        if !cached {
            match &self.fetcher {
                Some(fetcher) => self.download_snapshot(fetcher, cache_path)?,
                None => {
                    return Err(PipelineError::Structural(format!(
                        "registry snapshot not found at {}",
                        cache_path.display()
                    )))
                }
            }
        }

        let entries = load_registry_file(cache_path)?;
        info!("registry: {} rows loaded from {}", entries.len(), cache_path.display());
        Ok(entries)
    }
}

/// Pre-seeded registry, ignores the cache path
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    entries: Vec<RegistryEntry>,
}

impl StaticRegistry {
    pub fn new(entries: Vec<RegistryEntry>) -> Self {
        StaticRegistry { entries }
    }
}

impl RegistrySource for StaticRegistry {
    fn get_or_fetch(&self, _cache_path: &Path) -> Result<Vec<RegistryEntry>> {
        Ok(self.entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::{Scripted, ScriptedClient};
    use crate::fetcher::RetryPolicy;
    use crate::tabular::{parse_table, DELIMITER};
    use std::time::Duration;

    const SNAPSHOT: &str = "Registro_Operadora;CNPJ;Razao_Social;Modalidade;UF\n\
                            123;11222333000181;OPERADORA TESTE;Medicina de Grupo;SP\n\
                            456;11.444.777/0001-61;OUTRA OPERADORA;Cooperativa Medica;rj\n\
                            789;11222333000181;DUPLICADA;Odontologia;MG\n\
                            999;123;CURTA;Autogestao;BA\n\
                            321;112223330001811;LONGA;Autogestao;PR\n";

    fn snapshot_entries() -> Vec<RegistryEntry> {
        parse_registry(&parse_table(SNAPSHOT, DELIMITER).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_maps_synonyms() {
        let entries = snapshot_entries();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[1].entity_id, "11444777000161");
        assert_eq!(entries[3].entity_id, "00000000000123");
        assert_eq!(entries[1].registry_id, "456");
        assert_eq!(entries[1].region, "RJ");
        assert_eq!(entries[0].modality, "Medicina de Grupo");
    }

    #[test]
    fn test_missing_identifier_column_is_structural() {
        let table = parse_table("Registro_ANS;Razao_Social\n1;X\n", DELIMITER).unwrap();
        let result = parse_registry(&table);
        assert!(matches!(result, Err(PipelineError::Structural(_))));
    }

    #[test]
    fn test_dedup_first_wins() {
        let registry = Registry::from_entries(snapshot_entries());

        // Duplicate id and over-long id dropped, short id padded
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.lookup("123").unwrap().entity_name, "CURTA");
        let entry = registry.lookup("11.222.333/0001-81").unwrap();
        assert_eq!(entry.entity_name, "OPERADORA TESTE");
        assert_eq!(entry.registry_id, "123");
    }

    #[test]
    fn test_identifier_missing_leading_zero_is_padded() {
        let table = parse_table(
            "Registro_ANS;CNPJ;Razao_Social\n555;1222333000181;ZERO A ESQUERDA\n",
            DELIMITER,
        )
        .unwrap();
        let registry = Registry::from_entries(parse_registry(&table).unwrap());

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.entries()[0].entity_id, "01222333000181");
        assert_eq!(
            registry.lookup("01.222.333/0001-81").unwrap().entity_name,
            "ZERO A ESQUERDA"
        );
    }

    #[test]
    fn test_unpadded_seed_entries_are_normalized() {
        let registry = Registry::from_entries(vec![RegistryEntry {
            registry_id: "555".into(),
            entity_id: "1222333000181".into(),
            entity_name: "ZERO A ESQUERDA".into(),
            modality: "".into(),
            region: "SP".into(),
        }]);
        assert!(registry.lookup("01222333000181").is_some());
    }

    #[test]
    fn test_registry_id_index_keeps_every_registration() {
        let registry = Registry::from_entries(snapshot_entries());
        assert_eq!(registry.resolve_registry_id(" 456 ").unwrap().entity_name, "OUTRA OPERADORA");
        assert_eq!(registry.resolve_registry_id("789").unwrap().entity_name, "DUPLICADA");
        assert!(registry.resolve_registry_id("").is_none());
    }

    #[test]
    fn test_empty_identifier_never_matches() {
        let mut entries = snapshot_entries();
        entries.push(RegistryEntry {
            registry_id: "1".into(),
            entity_id: "".into(),
            entity_name: "SEM CNPJ".into(),
            modality: "".into(),
            region: "".into(),
        });
        let registry = Registry::from_entries(entries);
        assert!(registry.lookup("").is_none());
        assert!(registry.lookup("abc").is_none());
    }

    #[test]
    fn test_offline_source_requires_cache() {
        let dir = tempfile::tempdir().unwrap();
        let result = CachedRegistrySource::offline().get_or_fetch(&dir.path().join("missing.csv"));
        assert!(matches!(result, Err(PipelineError::Structural(_))));
    }

    #[test]
    fn test_cached_source_downloads_newest_snapshot_once() {
        let dir = tempfile::tempdir().unwrap();
        let index = "http://portal.test/registry";
        let client = ScriptedClient::new()
            .on(
                &format!("{}/", index),
                vec![Scripted::ok(
                    r#"<a href="Relatorio_cadop_old.csv">a</a><a href="Relatorio_cadop.csv">b</a>"#,
                )],
            )
            .on(&format!("{}/Relatorio_cadop.csv", index), vec![Scripted::ok(SNAPSHOT)]);
        let fetcher = Fetcher::new(Box::new(client.clone()), dir.path()).with_retry_policy(RetryPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
        });
        let source = CachedRegistrySource::new(fetcher).with_index_url(index);
        let cache = dir.path().join("data").join("registry_snapshot.csv");

        let first = source.get_or_fetch(&cache).unwrap();
        let calls = client.calls();
        let second = source.get_or_fetch(&cache).unwrap();

        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
        assert_eq!(calls, 2);
        assert_eq!(client.calls(), calls);
    }

    #[test]
    fn test_static_registry_returns_seed() {
        let source = StaticRegistry::new(snapshot_entries());
        assert_eq!(source.get_or_fetch(Path::new("/nowhere")).unwrap().len(), 5);
    }
}
