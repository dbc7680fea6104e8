use anyhow::{anyhow, bail, Context, Result};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};
use zip::ZipArchive;

/// Resource-fork metadata that macOS adds to archives it creates.
const MACOS_METADATA_DIR: &str = "__MACOSX";

/// Extract every entry of `zip_path` into `out_dir` and return the path of
/// the one data file it contained.
///
/// Directory entries and `__MACOSX/` metadata don't count as data files. An
/// archive with no data file, or with more than one, is rejected after
/// extraction so nothing is loaded from a guess.
#[instrument(level = "info", skip(zip_path, out_dir), fields(zip = %zip_path.as_ref().display()))]
pub fn unzip_archive<P: AsRef<Path>, Q: AsRef<Path>>(zip_path: P, out_dir: Q) -> Result<PathBuf> {
    let zip_path = zip_path.as_ref();
    let out_dir = out_dir.as_ref();
    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating extraction directory {}", out_dir.display()))?;

    let file = File::open(zip_path)
        .with_context(|| format!("Failed to open ZIP file: {}", zip_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read ZIP archive: {}", zip_path.display()))?;

    let mut data_files: Vec<PathBuf> = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i).with_context(|| {
            format!("Failed to access ZIP entry #{} in {}", i, zip_path.display())
        })?;
        if !entry.is_file() {
            continue;
        }
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| anyhow!("ZIP entry {:?} escapes the extraction directory", entry.name()))?;
        if rel.starts_with(MACOS_METADATA_DIR) {
            debug!(entry = %rel.display(), "skipping macOS metadata entry");
            continue;
        }
        data_files.push(rel);
    }

    archive
        .extract(out_dir)
        .with_context(|| format!("extracting {} into {}", zip_path.display(), out_dir.display()))?;
    info!(entries = archive.len(), out = %out_dir.display(), "extracted archive");

    match data_files.as_slice() {
        [] => bail!("archive {} contains no files", zip_path.display()),
        [only] => Ok(out_dir.join(only)),
        many => {
            let names: Vec<String> = many.iter().map(|p| p.display().to_string()).collect();
            bail!(
                "archive {} must contain exactly one file, found {}: {}",
                zip_path.display(),
                many.len(),
                names.join(", ")
            )
        }
    }
}

/// Write a stored (uncompressed) archive holding `entries`; names ending in
/// `/` become directory entries.
#[cfg(test)]
pub(crate) fn write_test_zip(path: &Path, entries: &[(&str, &str)]) -> Result<()> {
    use std::io::Write;
    use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

    let mut zip = ZipWriter::new(File::create(path)?);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    for (name, body) in entries {
        if name.ends_with('/') {
            zip.add_directory(*name, options)?;
        } else {
            zip.start_file(*name, options)?;
            zip.write_all(body.as_bytes())?;
        }
    }
    zip.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn returns_the_single_csv_and_extracts_it() -> Result<()> {
        let dir = tempdir()?;
        let zip_path = dir.path().join("upload.zip");
        write_test_zip(&zip_path, &[("data.csv", "Revenue ($)\n10\n")])?;

        let out = dir.path().join("temp_csv_folder");
        let csv = unzip_archive(&zip_path, &out)?;

        assert_eq!(csv, out.join("data.csv"));
        assert_eq!(fs::read_to_string(&csv)?, "Revenue ($)\n10\n");
        Ok(())
    }

    #[test]
    fn ignores_directories_and_macos_metadata() -> Result<()> {
        let dir = tempdir()?;
        let zip_path = dir.path().join("mac.zip");
        write_test_zip(
            &zip_path,
            &[
                ("export/", ""),
                ("export/data.csv", "a,b\n1,2\n"),
                ("__MACOSX/", ""),
                ("__MACOSX/export/._data.csv", "junk"),
            ],
        )?;

        let out = dir.path().join("out");
        let csv = unzip_archive(&zip_path, &out)?;
        assert_eq!(csv, out.join("export").join("data.csv"));
        assert!(csv.is_file());
        Ok(())
    }

    #[test]
    fn empty_archive_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let zip_path = dir.path().join("empty.zip");
        write_test_zip(&zip_path, &[])?;

        let err = unzip_archive(&zip_path, dir.path().join("out")).unwrap_err();
        assert!(err.to_string().contains("contains no files"), "{err:#}");
        Ok(())
    }

    #[test]
    fn multiple_files_are_rejected_by_name() -> Result<()> {
        let dir = tempdir()?;
        let zip_path = dir.path().join("two.zip");
        write_test_zip(&zip_path, &[("a.csv", "x\n"), ("b.csv", "y\n")])?;

        let err = unzip_archive(&zip_path, dir.path().join("out")).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exactly one file, found 2"), "{msg}");
        assert!(msg.contains("a.csv") && msg.contains("b.csv"), "{msg}");
        Ok(())
    }

    #[test]
    fn missing_and_corrupt_archives_name_the_path() -> Result<()> {
        let dir = tempdir()?;

        let missing = dir.path().join("nope.zip");
        let err = unzip_archive(&missing, dir.path().join("out")).unwrap_err();
        assert!(format!("{err:#}").contains("nope.zip"));

        let corrupt = dir.path().join("corrupt.zip");
        fs::write(&corrupt, b"this is not a zip archive")?;
        let err = unzip_archive(&corrupt, dir.path().join("out")).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read ZIP archive"));
        Ok(())
    }
}
