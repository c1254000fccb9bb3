//! Bundle archive installation
//!
//! Extracts a zipped bundle into the bundle root as `<api_id>_<revision>/`
//! so it can be handed to `Dispatcher::load_bundle`.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use zip::ZipArchive;

use super::manifest::{BundleManifest, MANIFEST_FILENAMES};
use crate::error::{DispatchError, LoadError};

/// Result of installing a bundle archive
#[derive(Debug)]
pub struct InstalledBundle {
    /// Directory name, `<api_id>_<revision>`
    pub bundle_id: String,

    /// Directory the bundle was extracted to
    pub path: PathBuf,

    /// Number of files written (0 if the revision was already present)
    pub files_extracted: usize,

    pub manifest: BundleManifest,
}

/// Installs bundle archives into a bundle root
pub struct BundleArchive;

impl BundleArchive {
    /// Extract `zip_bytes` for `api_id` under `bundle_root`.
    ///
    /// The revision is the manifest checksum, or the SHA-256 of the archive
    /// when the manifest carries none. An already installed revision is left
    /// untouched. Extraction goes through a temporary directory that is
    /// renamed into place, so a partially written bundle is never visible.
    pub fn install(zip_bytes: &[u8], bundle_root: &Path, api_id: &str) -> Result<InstalledBundle, DispatchError> {
        if api_id.is_empty() || api_id.contains('_') || api_id.contains(['/', '\\']) {
            return Err(DispatchError::Config(format!("invalid API id for bundle: {:?}", api_id)));
        }

        let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;
        let manifest = read_manifest(&mut archive)?;
        manifest.validate()?;

        let revision = match manifest.checksum.as_deref().map(str::trim) {
            Some(checksum) if !checksum.is_empty() && is_safe_revision(checksum) => checksum.to_string(),
            _ => archive_hash(zip_bytes),
        };
        let bundle_id = format!("{}_{}", api_id, revision);
        let target = bundle_root.join(&bundle_id);

        if target.is_dir() {
            tracing::debug!(bundle_id = %bundle_id, "Bundle revision already installed");
            return Ok(InstalledBundle {
                bundle_id,
                path: target,
                files_extracted: 0,
                manifest,
            });
        }

        fs::create_dir_all(bundle_root).map_err(LoadError::from)?;
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(bundle_root)
            .map_err(LoadError::from)?;

        let mut files_extracted = 0;
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            let Some(relative) = file.enclosed_name() else {
                tracing::warn!(entry = %file.name(), "Skipping archive entry outside the bundle");
                continue;
            };
            let out_path = staging.path().join(relative);

            if file.is_dir() {
                fs::create_dir_all(&out_path).map_err(LoadError::from)?;
                continue;
            }
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(LoadError::from)?;
            }
            let mut out = fs::File::create(&out_path).map_err(LoadError::from)?;
            std::io::copy(&mut file, &mut out).map_err(LoadError::from)?;
            files_extracted += 1;
        }

        let staged = staging.into_path();
        if let Err(e) = fs::rename(&staged, &target) {
            let _ = fs::remove_dir_all(&staged);
            // Lost a race with another installer of the same revision
            if !target.is_dir() {
                return Err(LoadError::from(e).into());
            }
        }

        tracing::info!(bundle_id = %bundle_id, files = files_extracted, "Installed bundle archive");
        Ok(InstalledBundle {
            bundle_id,
            path: target,
            files_extracted,
            manifest,
        })
    }
}

fn read_manifest(archive: &mut ZipArchive<Cursor<&[u8]>>) -> Result<BundleManifest, DispatchError> {
    for file_name in MANIFEST_FILENAMES {
        let Ok(mut file) = archive.by_name(file_name) else {
            continue;
        };
        let mut content = String::new();
        file.read_to_string(&mut content).map_err(LoadError::from)?;
        return Ok(BundleManifest::parse_named(file_name, &content)?);
    }
    Err(LoadError::Manifest("no manifest found in archive".to_string()).into())
}

fn is_safe_revision(revision: &str) -> bool {
    revision.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// SHA-256 of the archive, hex encoded
fn archive_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
