// 🚚 Pipeline - acquisition → normalize → validate → consolidate → enrich → aggregate
//
// Runs sequentially, period by period and file by file. A failing file is
// logged and skipped; only a structural registry problem aborts the run.
//
// Two entry points:
//   run_online   download the latest periods from the portal first
//   run_offline  work from whatever already sits under data/raw

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::aggregator::{AggregateAnalysis, Aggregator};
use crate::config::{
    Settings, AGGREGATED_FILE, CONSOLIDATED_ARCHIVE, CONSOLIDATED_FILE, ENRICHED_FILE,
    INCONSISTENT_FILE,
};
use crate::consolidation::consolidate;
use crate::container::{compress_file, is_tabular, ContainerExpander, ZipExpander};
use crate::enricher::{enrich, EnrichmentSummary};
use crate::fetcher::{Fetcher, ReqwestHttpClient, DEFAULT_TIMEOUT};
use crate::normalizer::normalize_file;
use crate::records::{AggregatedGroup, EnrichedRecord, ExpenseRecord, Period};
use crate::registry::{CachedRegistrySource, Registry, RegistrySource};
use crate::tabular::{write_rows, write_serialized};
use crate::validator::{ExpenseValidator, ValidationSummary};

/// Number of most recent periods an online run downloads
pub const DEFAULT_PERIODS: usize = 3;

/// A tabular file together with the period it reports on
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodFile {
    pub period: Period,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPaths {
    pub consolidated: PathBuf,
    pub inconsistent: PathBuf,
    pub enriched: PathBuf,
    pub aggregated: PathBuf,
    pub archive: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path) -> Self {
        ArtifactPaths {
            consolidated: dir.join(CONSOLIDATED_FILE),
            inconsistent: dir.join(INCONSISTENT_FILE),
            enriched: dir.join(ENRICHED_FILE),
            aggregated: dir.join(AGGREGATED_FILE),
            archive: dir.join(CONSOLIDATED_ARCHIVE),
        }
    }
}

/// Everything a run produced, minus the row data itself
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub periods: Vec<Period>,
    pub files_processed: usize,
    pub files_failed: usize,
    pub validation: ValidationSummary,
    pub duplicates_removed: usize,
    pub enrichment: EnrichmentSummary,
    pub analysis: AggregateAnalysis,
    pub artifacts: ArtifactPaths,
}

impl RunReport {
    pub fn summary(&self) -> String {
        let periods = self
            .periods
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "periods [{}]; files {} ok / {} failed; {}; {} duplicates removed; {}; {}",
            periods,
            self.files_processed,
            self.files_failed,
            self.validation.summary(),
            self.duplicates_removed,
            self.enrichment.summary(),
            self.analysis.summary()
        )
    }
}

/// In-memory result of a run, for callers that keep going (export)
pub struct RunOutput {
    pub report: RunReport,
    pub enriched: Vec<EnrichedRecord>,
    pub groups: Vec<AggregatedGroup>,
    pub registry: Registry,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    settings: Settings,
    registry_source: Box<dyn RegistrySource>,
    expander: Box<dyn ContainerExpander>,
    validator: ExpenseValidator,
}

impl Pipeline {
    pub fn new(settings: Settings, registry_source: Box<dyn RegistrySource>) -> Self {
        Pipeline {
            settings,
            registry_source,
            expander: Box::new(ZipExpander::new()),
            validator: ExpenseValidator::new(),
        }
    }

    pub fn with_expander(mut self, expander: Box<dyn ContainerExpander>) -> Self {
        self.expander = expander;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    /// Expand bundles and keep tabular files, tagging each with its period.
    pub fn collect_files(&self, downloads: Vec<(Period, Vec<PathBuf>)>) -> Vec<PeriodFile> {
        let extract_dir = self.settings.extracted_dir();
        let mut files = Vec::new();

        for (period, paths) in downloads {
            for path in paths {
                if is_bundle(&path) {
                    match self.expander.extract(&path, &extract_dir) {
                        Ok(extracted) => files.extend(
                            extracted
                                .into_iter()
                                .filter(|p| is_tabular(p))
                                .map(|path| PeriodFile { period, path }),
                        ),
                        Err(e) => warn!("could not expand {}: {}", path.display(), e),
                    }
                } else if is_tabular(&path) {
                    files.push(PeriodFile { period, path });
                } else {
                    warn!("ignoring {} (not a bundle or table)", path.display());
                }
            }
        }

        info!("{} tabular files ready for normalization", files.len());
        files
    }

    /// Files already under data/raw, grouped by the period in their name.
    /// Names without a recognisable period are skipped.
    pub fn discover_local(&self) -> Result<Vec<(Period, Vec<PathBuf>)>> {
        let raw_dir = self.settings.raw_dir();
        if !raw_dir.exists() {
            warn!("{} does not exist; nothing to process", raw_dir.display());
            return Ok(Vec::new());
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(&raw_dir)
            .with_context(|| format!("Failed to list {}", raw_dir.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        let mut grouped: Vec<(Period, Vec<PathBuf>)> = Vec::new();
        for path in entries {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            let period = match period_from_name(name) {
                Some(p) => p,
                None => {
                    warn!("no period in file name {}; skipping", name);
                    continue;
                }
            };
            match grouped.iter_mut().find(|(p, _)| *p == period) {
                Some((_, paths)) => paths.push(path),
                None => grouped.push((period, vec![path])),
            }
        }

        // newest first, as the portal lists them
        grouped.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(grouped)
    }

    // ------------------------------------------------------------------------
    // Processing
    // ------------------------------------------------------------------------

    pub fn load_registry(&self) -> Result<Registry> {
        let cache_path = self
            .settings
            .registry_path
            .clone()
            .unwrap_or_else(|| self.settings.registry_cache_path());
        let entries = self
            .registry_source
            .get_or_fetch(&cache_path)
            .context("Failed to load the operator registry")?;
        Ok(Registry::from_entries(entries))
    }

    /// Normalize, validate, consolidate, enrich and aggregate, then write
    /// every artifact into the output directory.
    pub fn process(&self, files: Vec<PeriodFile>) -> Result<RunOutput> {
        let registry = self.load_registry()?;
        info!("registry ready: {} operators", registry.len());

        let mut periods: Vec<Period> = Vec::new();
        let mut batches: Vec<Vec<ExpenseRecord>> = Vec::new();
        let mut files_failed = 0;

        for file in &files {
            if !periods.contains(&file.period) {
                periods.push(file.period);
            }
            info!("normalizing {} ({})", file.path.display(), file.period);

            match normalize_file(
                &file.path,
                file.period.year,
                file.period.quarter as i32,
                &registry,
            ) {
                Ok(records) => batches.push(records),
                Err(e) => {
                    error!("failed to read {}: {}", file.path.display(), e);
                    files_failed += 1;
                }
            }
        }

        let normalized: Vec<ExpenseRecord> = batches.into_iter().flatten().collect();
        let validated = self.validator.validate(normalized);
        let validation = self.validator.summary(&validated);
        info!("validation: {}", validation.summary());

        let consolidated = consolidate(vec![validated]);
        let inconsistent = consolidated.inconsistent();

        let enriched = enrich(consolidated.records.clone(), &registry);
        let enrichment = EnrichmentSummary::from_records(&enriched);
        info!("enrichment: {}", enrichment.summary());

        let groups = Aggregator::new(self.settings.policy).run(&enriched);
        let analysis = AggregateAnalysis::from_groups(&groups);
        info!("aggregation: {}", analysis.summary());

        let artifacts = ArtifactPaths::in_dir(&self.settings.output_dir());
        write_artifacts(&artifacts, &consolidated.records, &inconsistent, &enriched, &groups)?;

        let report = RunReport {
            periods,
            files_processed: files.len() - files_failed,
            files_failed,
            validation,
            duplicates_removed: consolidated.duplicates_removed,
            enrichment,
            analysis,
            artifacts,
        };

        Ok(RunOutput {
            report,
            enriched,
            groups,
            registry,
        })
    }
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Download the latest `periods` from the portal and run the whole pipeline
pub fn run_online(settings: Settings, periods: usize) -> Result<RunOutput> {
    let statements = Fetcher::new(
        Box::new(ReqwestHttpClient::new(DEFAULT_TIMEOUT)?),
        settings.raw_dir(),
    );
    let registry_fetcher = Fetcher::new(
        Box::new(ReqwestHttpClient::new(DEFAULT_TIMEOUT)?),
        settings.data_dir.join("data"),
    );

    let pipeline = Pipeline::new(settings, Box::new(CachedRegistrySource::new(registry_fetcher)));

    info!("downloading the latest {} periods", periods);
    let downloads = statements.download_latest(periods);
    let files = pipeline.collect_files(downloads);
    pipeline.process(files)
}

/// Process files already present under data/raw. The registry must be cached.
pub fn run_offline(settings: Settings) -> Result<RunOutput> {
    let pipeline = Pipeline::new(settings, Box::new(CachedRegistrySource::offline()));
    let downloads = pipeline.discover_local()?;
    let files = pipeline.collect_files(downloads);
    pipeline.process(files)
}

// ============================================================================
// ARTIFACTS
// ============================================================================

pub fn write_artifacts(
    paths: &ArtifactPaths,
    consolidated: &[ExpenseRecord],
    inconsistent: &[ExpenseRecord],
    enriched: &[EnrichedRecord],
    groups: &[AggregatedGroup],
) -> Result<()> {
    let rows = |records: &[ExpenseRecord]| records.iter().map(|r| r.to_row()).collect::<Vec<_>>();

    write_rows(&paths.consolidated, &ExpenseRecord::HEADERS, &rows(consolidated))
        .with_context(|| format!("Failed to write {}", paths.consolidated.display()))?;
    write_rows(&paths.inconsistent, &ExpenseRecord::HEADERS, &rows(inconsistent))
        .with_context(|| format!("Failed to write {}", paths.inconsistent.display()))?;

    let enriched_rows: Vec<Vec<String>> = enriched.iter().map(|r| r.to_row()).collect();
    write_rows(&paths.enriched, &EnrichedRecord::HEADERS, &enriched_rows)
        .with_context(|| format!("Failed to write {}", paths.enriched.display()))?;

    write_serialized(&paths.aggregated, groups)
        .with_context(|| format!("Failed to write {}", paths.aggregated.display()))?;

    compress_file(&paths.consolidated, &paths.archive)
        .with_context(|| format!("Failed to write {}", paths.archive.display()))?;

    info!(
        "artifacts written: {} consolidated, {} inconsistent, {} groups",
        consolidated.len(),
        inconsistent.len(),
        groups.len()
    );
    Ok(())
}

fn is_bundle(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// `2025_Q3_...` (downloaded name) or `3T2025...` (portal bundle name)
pub fn period_from_name(name: &str) -> Option<Period> {
    let patterns = [
        (r"^(\d{4})_Q([1-4])_", false),
        (r"(?i)^([1-4])T(\d{4})", true),
    ];
    for (pattern, quarter_first) in patterns {
        let re = Regex::new(pattern).ok()?;
        if let Some(caps) = re.captures(name) {
            let (year, quarter) = if quarter_first {
                (caps.get(2)?, caps.get(1)?)
            } else {
                (caps.get(1)?, caps.get(2)?)
            };
            return Some(Period::new(
                year.as_str().parse().ok()?,
                quarter.as_str().parse().ok()?,
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{InconsistencyFlag, MatchStatus, RegistryEntry};
    use crate::registry::StaticRegistry;
    use crate::tabular::read_table;
    use std::io::Write;
    use zip::write::FileOptions;
    use zip::ZipWriter;

    fn create_registry() -> StaticRegistry {
        StaticRegistry::new(vec![RegistryEntry {
            registry_id: "123".into(),
            entity_id: "11222333000181".into(),
            entity_name: "OPERADORA TESTE".into(),
            modality: "Medicina de Grupo".into(),
            region: "SP".into(),
        }])
    }

    fn settings_in(dir: &Path) -> Settings {
        Settings {
            data_dir: dir.to_path_buf(),
            ..Settings::default()
        }
    }

    fn write_file(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_period_from_name() {
        assert_eq!(period_from_name("2025_Q3_despesas.zip"), Some(Period::new(2025, 3)));
        assert_eq!(period_from_name("1T2024.zip"), Some(Period::new(2024, 1)));
        assert_eq!(period_from_name("1t2024.csv"), Some(Period::new(2024, 1)));
        assert_eq!(period_from_name("despesas.csv"), None);
        assert_eq!(period_from_name("2025_Q5_x.csv"), None);
    }

    #[test]
    fn test_end_to_end_flat_files() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let raw = settings.raw_dir();

        write_file(
            &raw.join("2025_Q1_despesas.csv"),
            "CNPJ;Razao_Social;Valor\n11.222.333/0001-81;OPERADORA TESTE;100,50\n11222333000182;OUTRA;0\n",
        );
        write_file(
            &raw.join("2025_Q2_despesas.csv"),
            "CNPJ;Razao_Social;Valor\n11.222.333/0001-81;OPERADORA TESTE;200,00\n",
        );
        write_file(&raw.join("notes.txt"), "no period here");

        let pipeline = Pipeline::new(settings.clone(), Box::new(create_registry()));
        let downloads = pipeline.discover_local().unwrap();
        let files = pipeline.collect_files(downloads);
        let output = pipeline.process(files).unwrap();

        println!("Run: {}", output.report.summary());

        assert_eq!(output.report.files_processed, 2);
        assert_eq!(output.report.periods, vec![Period::new(2025, 2), Period::new(2025, 1)]);
        assert_eq!(output.enriched.len(), 3);

        // newest period first
        assert_eq!(output.enriched[0].record.quarter, Some(2));
        assert_eq!(output.enriched[0].match_status, MatchStatus::Match);

        let bad = output
            .enriched
            .iter()
            .find(|r| r.record.entity_id == "11222333000182")
            .unwrap();
        assert!(bad.record.has_flag(&InconsistencyFlag::IdentifierInvalid));
        assert!(bad.record.has_flag(&InconsistencyFlag::ValueZero));
        assert_eq!(bad.match_status, MatchStatus::NoMatch);

        // one group per (name, region)
        assert_eq!(output.groups.len(), 2);
        assert_eq!(output.groups[0].entity_name, "OPERADORA TESTE");
        assert_eq!(output.groups[0].rank, 1);
        assert!((output.groups[0].total - 300.5).abs() < 1e-9);

        let artifacts = &output.report.artifacts;
        let consolidated = read_table(&artifacts.consolidated).unwrap();
        assert_eq!(consolidated.headers, ExpenseRecord::HEADERS.to_vec());
        assert_eq!(consolidated.len(), 3);
        assert_eq!(read_table(&artifacts.inconsistent).unwrap().len(), 1);
        assert_eq!(read_table(&artifacts.aggregated).unwrap().len(), 2);
        assert!(artifacts.archive.exists());
    }

    #[test]
    fn test_bundles_are_expanded() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let bundle = settings.raw_dir().join("2025_Q1_despesas.zip");
        fs::create_dir_all(bundle.parent().unwrap()).unwrap();

        let mut writer = ZipWriter::new(fs::File::create(&bundle).unwrap());
        writer.start_file("nested/eventos.csv", FileOptions::default()).unwrap();
        writer
            .write_all(b"cnpj;razao_social;valor\n11222333000181;OPERADORA TESTE;50\n")
            .unwrap();
        writer.start_file("leia-me.pdf", FileOptions::default()).unwrap();
        writer.write_all(b"%PDF").unwrap();
        writer.finish().unwrap();

        let pipeline = Pipeline::new(settings, Box::new(create_registry()));
        let files = pipeline.collect_files(vec![(Period::new(2025, 1), vec![bundle])]);

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].period, Period::new(2025, 1));
        assert!(files[0].path.ends_with("eventos.csv"));
    }

    #[test]
    fn test_unreadable_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let settings = settings_in(dir.path());
        let good = dir.path().join("good.csv");
        write_file(&good, "cnpj;razao_social;valor\n11222333000181;OPERADORA TESTE;10\n");

        let pipeline = Pipeline::new(settings, Box::new(create_registry()));
        let output = pipeline
            .process(vec![
                PeriodFile {
                    period: Period::new(2025, 1),
                    path: good,
                },
                PeriodFile {
                    period: Period::new(2025, 1),
                    path: dir.path().join("missing.csv"),
                },
            ])
            .unwrap();

        assert_eq!(output.report.files_processed, 1);
        assert_eq!(output.report.files_failed, 1);
        assert_eq!(output.enriched.len(), 1);
    }

    #[test]
    fn test_missing_registry_is_fatal_offline() {
        let dir = tempfile::tempdir().unwrap();
        let result = run_offline(settings_in(dir.path()));
        assert!(result.is_err());
    }
}
