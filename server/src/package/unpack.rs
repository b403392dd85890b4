//! Package verification and extraction

use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};

use ed25519_dalek::{Signature, VerifyingKey};
use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, info, warn};

use crate::errors::HostError;
use crate::package::{digest_reader, PackageDigest};

/// Counts of what an extraction created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub dirs: usize,
    pub bytes: u64,
}

/// Hash `reader` to EOF and check `signature` over the digest.
///
/// Exactly one distinct trusted key must validate the signature.
pub fn verify<R: Read>(
    reader: &mut R,
    signature: &[u8],
    trusted_keys: &[VerifyingKey],
) -> Result<PackageDigest, HostError> {
    let summary = digest_reader(reader)?;
    let signature = Signature::from_slice(signature).map_err(|_| HostError::InvalidSignature)?;

    let mut seen = HashSet::new();
    let matches = trusted_keys
        .iter()
        .filter(|key| seen.insert(key.to_bytes()))
        .filter(|key| {
            key.verify_strict(summary.digest.as_bytes(), &signature)
                .is_ok()
        })
        .count();

    if matches != 1 {
        warn!(
            "Package signature rejected (digest {}, {} trusted keys)",
            summary.digest,
            seen.len()
        );
        return Err(HostError::InvalidSignature);
    }

    debug!("Package signature verified (digest {})", summary.digest);
    Ok(summary.digest)
}

/// Verify a package and extract it into an existing `destination` directory.
///
/// Nothing is written unless the signature checks out.
pub fn unpack<R: Read + Seek>(
    mut reader: R,
    signature: &[u8],
    destination: &Path,
    trusted_keys: &[VerifyingKey],
) -> Result<PackageDigest, HostError> {
    ensure_directory(destination)?;
    let digest = verify(&mut reader, signature, trusted_keys)?;
    reader.seek(SeekFrom::Start(0))?;
    extract(reader, destination)?;
    Ok(digest)
}

/// Extract a gzip+tar stream into `destination`, which must already be a directory.
///
/// Only regular files and directories are accepted, and every entry must land inside
/// `destination`. Directory modes are applied last, deepest first, so a read-only
/// directory still receives its contents.
pub fn extract<R: Read>(reader: R, destination: &Path) -> Result<ExtractReport, HostError> {
    ensure_directory(destination)?;
    let destination = destination.canonicalize()?;

    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut report = ExtractReport::default();
    let mut dir_modes: Vec<(PathBuf, u32)> = Vec::new();

    for entry in archive
        .entries()
        .map_err(|e| HostError::InvalidPackage(format!("failed to read archive: {}", e)))?
    {
        let mut entry =
            entry.map_err(|e| HostError::InvalidPackage(format!("failed to read entry: {}", e)))?;

        let name = entry
            .path()
            .map_err(|e| HostError::InvalidPackage(format!("invalid entry path: {}", e)))?
            .into_owned();
        let entry_type = entry.header().entry_type();
        let mode = entry
            .header()
            .mode()
            .map_err(|e| HostError::InvalidPackage(format!("invalid mode for {}: {}", name.display(), e)))?;
        let target = resolve_entry_path(&destination, &name)?;

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                ensure_contained(&destination, &target)?;
                dir_modes.push((target, mode));
                report.dirs += 1;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                    ensure_contained(&destination, parent)?;
                }
                let mut file = fs::File::create(&target)?;
                report.bytes += io::copy(&mut entry, &mut file)?;
                set_permissions(&target, mode)?;
                report.files += 1;
            }
            other => {
                return Err(HostError::InvalidPackage(format!(
                    "unsupported entry type {:?} for {}",
                    other,
                    name.display()
                )));
            }
        }
    }

    dir_modes.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
    for (path, mode) in &dir_modes {
        set_permissions(path, *mode)?;
    }

    info!(
        "Extracted package into {}: {} files, {} directories, {} bytes",
        destination.display(),
        report.files,
        report.dirs,
        report.bytes
    );
    Ok(report)
}

fn ensure_directory(path: &Path) -> Result<(), HostError> {
    if !path.is_dir() {
        return Err(HostError::StageFailure(format!(
            "destination {} is not an existing directory",
            path.display()
        )));
    }
    Ok(())
}

/// Resolve an entry name against `destination` lexically, rejecting anything that escapes it
fn resolve_entry_path(destination: &Path, name: &Path) -> Result<PathBuf, HostError> {
    let mut parts: Vec<&std::ffi::OsStr> = Vec::new();

    for component in name.components() {
        match component {
            Component::Normal(part) => parts.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(HostError::InvalidPackage(format!(
                        "entry {} escapes the destination",
                        name.display()
                    )));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(HostError::InvalidPackage(format!(
                    "entry {} is an absolute path",
                    name.display()
                )));
            }
        }
    }

    if parts.is_empty() {
        return Err(HostError::InvalidPackage(format!(
            "entry {} does not name anything inside the destination",
            name.display()
        )));
    }

    let mut resolved = destination.to_path_buf();
    resolved.extend(parts);
    Ok(resolved)
}

/// Guard against directories that resolve elsewhere on disk
fn ensure_contained(destination: &Path, path: &Path) -> Result<(), HostError> {
    if !path.canonicalize()?.starts_with(destination) {
        return Err(HostError::InvalidPackage(format!(
            "{} resolves outside the destination",
            path.display()
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
