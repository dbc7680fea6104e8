use anyhow::{bail, Context, Result};
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Scratch directory used when none is given, relative to the working directory.
pub const DEFAULT_WORK_DIR: &str = "temp_csv_folder";

/// A directory that lives exactly as long as this guard.
///
/// A directory the guard created is removed on drop. An existing empty
/// directory is emptied on drop but kept. An existing directory that holds
/// anything is refused. Removal failures are logged, never returned.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    created: bool,
}

impl ScratchDir {
    /// Create `path` (and any missing parents), or adopt it if it is an
    /// existing empty directory.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let created = match fs::metadata(&path) {
            Ok(meta) if !meta.is_dir() => {
                bail!("scratch path {} exists and is not a directory", path.display())
            }
            Ok(_) => {
                let occupied = fs::read_dir(&path)
                    .with_context(|| format!("listing scratch directory {}", path.display()))?
                    .next()
                    .is_some();
                if occupied {
                    bail!(
                        "refusing to use non-empty directory {} as scratch space",
                        path.display()
                    );
                }
                false
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&path)
                    .with_context(|| format!("creating scratch directory {}", path.display()))?;
                true
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("inspecting scratch directory {}", path.display()))
            }
        };
        debug!(path = %path.display(), created, "scratch directory ready");
        Ok(Self { path, created })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove everything inside the directory, keeping the directory.
    fn clear_contents(&self) -> std::io::Result<()> {
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        let result = if self.created {
            fs::remove_dir_all(&self.path)
        } else {
            self.clear_contents()
        };
        match result {
            Ok(()) => debug!(
                path = %self.path.display(),
                created = self.created,
                "cleaned scratch directory"
            ),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "failed to clean scratch directory"
            ),
        }
    }
}
