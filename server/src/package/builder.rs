//! Reproducible package builder

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha512_256};
use tar::{EntryType, Header};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::HostError;
use crate::package::{PackageDigest, PackageSummary};

/// Size of the chunks handed to a package stream
const CHUNK_SIZE: usize = 64 * 1024;

/// One file or directory in a package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    /// `/`-separated path relative to the package root (no trailing slash)
    pub path: String,

    /// Permission bits
    pub mode: u32,

    /// Content length; zero for directories
    pub size: u64,

    pub is_dir: bool,

    /// Location on disk
    pub source: PathBuf,
}

/// An ordered snapshot of a directory tree, ready to be serialized
#[derive(Debug, Clone)]
pub struct Package {
    root: PathBuf,
    entries: Vec<PackageEntry>,
}

impl Package {
    /// Walk `root` depth first, siblings in file name order.
    ///
    /// Regular files and directories are recorded; symlinks and special files are skipped.
    pub fn scan(root: impl Into<PathBuf>) -> Result<Self, HostError> {
        let root = root.into();
        let mut entries = Vec::new();

        let walker = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            let file_type = entry.file_type();
            if !file_type.is_file() && !file_type.is_dir() {
                debug!("Skipping non-regular entry: {}", entry.path().display());
                continue;
            }

            let metadata = entry.metadata().map_err(io::Error::from)?;
            let relative = entry
                .path()
                .strip_prefix(&root)
                .map_err(|e| HostError::Internal(e.to_string()))?;

            entries.push(PackageEntry {
                path: to_package_path(relative)?,
                mode: permission_bits(&metadata),
                size: if file_type.is_dir() { 0 } else { metadata.len() },
                is_dir: file_type.is_dir(),
                source: entry.path().to_path_buf(),
            });
        }

        Ok(Self { root, entries })
    }

    /// Root directory the package was scanned from
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Entries in serialization order
    pub fn entries(&self) -> &[PackageEntry] {
        &self.entries
    }

    /// Check whether an entry with the given package path exists
    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    /// Serialize the package into `writer`, returning the digest and length of the bytes written
    pub fn write_to<W: Write>(&self, writer: W) -> Result<PackageSummary, HostError> {
        let mut digesting = DigestWriter::new(writer);

        {
            let encoder = GzEncoder::new(&mut digesting, Compression::default());
            let mut builder = tar::Builder::new(encoder);

            for entry in &self.entries {
                append_entry(&mut builder, entry)?;
            }

            let encoder = builder.into_inner()?;
            encoder.finish()?;
        }

        digesting.flush()?;
        let (_, summary) = digesting.finish();
        debug!(
            "Package written: {} entries, {} bytes, digest {}",
            self.entries.len(),
            summary.size,
            summary.digest
        );
        Ok(summary)
    }

    /// Serialize the package on a blocking thread, yielding the bytes as they are produced.
    ///
    /// At most `capacity` chunks are buffered; the summary resolves once the final chunk has
    /// been queued.
    pub fn stream(self, capacity: usize) -> PackageStream {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (summary_tx, summary_rx) = oneshot::channel();

        tokio::task::spawn_blocking(move || {
            let writer = io::BufWriter::with_capacity(CHUNK_SIZE, ChannelWriter { tx: tx.clone() });
            let result = self.write_to(writer);
            if let Err(e) = &result {
                warn!("Package stream aborted: {}", e);
                let _ = tx.blocking_send(Err(io::Error::other(e.to_string())));
            }
            let _ = summary_tx.send(result);
        });

        PackageStream {
            chunks: ReceiverStream::new(rx),
            summary: summary_rx,
        }
    }
}

/// Package bytes produced on a background thread
pub struct PackageStream {
    /// Compressed package bytes
    pub chunks: ReceiverStream<io::Result<Bytes>>,

    /// Digest and length, available after the last chunk
    pub summary: oneshot::Receiver<Result<PackageSummary, HostError>>,
}

/// A writer that hashes and counts everything passing through it
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha512_256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha512_256::new(),
            written: 0,
        }
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(self) -> (W, PackageSummary) {
        let summary = PackageSummary {
            digest: PackageDigest(self.hasher.finalize().into()),
            size: self.written,
        };
        (self.inner, summary)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct ChannelWriter {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(buf)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "package receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn append_entry<W: Write>(builder: &mut tar::Builder<W>, entry: &PackageEntry) -> Result<(), HostError> {
    let mut header = Header::new_gnu();
    header.set_mode(entry.mode);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mtime(0);

    let result = if entry.is_dir {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder.append_data(&mut header, format!("{}/", entry.path), io::empty())
    } else {
        let file = fs::File::open(&entry.source)?;
        let len = file.metadata()?.len();
        if len != entry.size {
            return Err(HostError::IoError(io::Error::other(format!(
                "{} changed size while packaging",
                entry.path
            ))));
        }
        header.set_entry_type(EntryType::Regular);
        header.set_size(entry.size);
        builder.append_data(&mut header, &entry.path, file.take(entry.size))
    };

    result.map_err(|e| {
        HostError::IoError(io::Error::new(
            e.kind(),
            format!("failed to add {} to package: {}", entry.path, e),
        ))
    })
}

fn to_package_path(relative: &Path) -> Result<String, HostError> {
    let mut parts = Vec::new();
    for component in relative.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            HostError::InvalidPackage(format!("path is not valid UTF-8: {}", relative.display()))
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

#[cfg(unix)]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(metadata: &fs::Metadata) -> u32 {
    match (metadata.is_dir(), metadata.permissions().readonly()) {
        (true, _) => 0o755,
        (false, true) => 0o444,
        (false, false) => 0o644,
    }
}
