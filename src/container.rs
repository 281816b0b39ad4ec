// 🗜️ Container Expander - zip bundles in, flat files out
//
// Portal bundles may nest folders; entries are flattened into one directory
// per bundle (`{extract_dir}/{bundle_stem}/{entry_file_name}`).

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::Result;

/// Lists and extracts entries of a compressed bundle
pub trait ContainerExpander {
    /// File entries (directories skipped), in archive order
    fn list(&self, archive: &Path) -> Result<Vec<String>>;

    /// Extract all file entries into `dest_dir`, returning the written paths
    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ZipExpander;

impl ZipExpander {
    pub fn new() -> Self {
        ZipExpander
    }
}

impl ContainerExpander for ZipExpander {
    fn list(&self, archive: &Path) -> Result<Vec<String>> {
        let mut zip = ZipArchive::new(File::open(archive)?)?;
        let mut names = Vec::new();
        for i in 0..zip.len() {
            let entry = zip.by_index(i)?;
            if !entry.is_dir() {
                names.push(entry.name().to_string());
            }
        }
        Ok(names)
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<Vec<PathBuf>> {
        info!("extracting {}", archive.display());

        let stem = archive
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("bundle");
        let target = dest_dir.join(stem);
        fs::create_dir_all(&target)?;

        let mut zip = ZipArchive::new(File::open(archive)?)?;
        let mut extracted = Vec::new();

        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            if entry.is_dir() {
                continue;
            }

            let file_name = match Path::new(entry.name()).file_name() {
                Some(name) => name.to_os_string(),
                None => continue,
            };
            let path = target.join(file_name);

            let mut out = File::create(&path)?;
            io::copy(&mut entry, &mut out)?;
            debug!("  extracted {}", entry.name());
            extracted.push(path);
        }

        info!("extracted {} files", extracted.len());
        Ok(extracted)
    }
}

/// Files the tabular reader can handle
pub fn is_tabular(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref(),
        Some("csv") | Some("txt")
    )
}

/// Write `source` as the single deflated entry of a new zip at `archive`
pub fn compress_file(source: &Path, archive: &Path) -> Result<PathBuf> {
    let entry_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("data.csv");

    let mut writer = ZipWriter::new(File::create(archive)?);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.start_file(entry_name, options)?;
    writer.write_all(&fs::read(source)?)?;
    writer.finish()?;

    Ok(archive.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn make_bundle(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, FileOptions::default()).unwrap();
            } else {
                writer.start_file(*name, FileOptions::default()).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn test_extract_flattens_and_skips_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("1T2025.zip");
        make_bundle(
            &bundle,
            &[("inner/", ""), ("inner/despesas.csv", "a;b\n1;2\n"), ("readme.txt", "hi")],
        );

        let expander = ZipExpander::new();
        assert_eq!(expander.list(&bundle).unwrap(), vec!["inner/despesas.csv", "readme.txt"]);

        let files = expander.extract(&bundle, &dir.path().join("out")).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0], dir.path().join("out").join("1T2025").join("despesas.csv"));
        assert_eq!(fs::read_to_string(&files[0]).unwrap(), "a;b\n1;2\n");
    }

    #[test]
    fn test_not_a_zip_is_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.zip");
        fs::write(&bogus, "not a zip").unwrap();

        let result = ZipExpander::new().extract(&bogus, dir.path());
        assert!(matches!(result, Err(crate::error::PipelineError::Archive(_))));
    }

    #[test]
    fn test_compress_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("consolidated_expenses.csv");
        fs::write(&source, "entity_id;entity_name\n").unwrap();

        let archive = compress_file(&source, &dir.path().join("consolidated_expenses.zip")).unwrap();

        let mut zip = ZipArchive::new(File::open(archive).unwrap()).unwrap();
        let mut entry = zip.by_name("consolidated_expenses.csv").unwrap();
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "entity_id;entity_name\n");
    }

    #[test]
    fn test_is_tabular() {
        assert!(is_tabular(Path::new("a/Despesas.CSV")));
        assert!(is_tabular(Path::new("b.txt")));
        assert!(!is_tabular(Path::new("c.xlsx")));
    }
}
