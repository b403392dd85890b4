//! Deployment package codec
//!
//! A package is a gzip-compressed tar stream of an application tree. Its identity is the
//! SHA-512/256 digest of the compressed bytes, so the builder must be byte-for-byte
//! reproducible for an unchanged tree.

pub mod builder;
pub mod unpack;

use std::fmt;
use std::io::{self, Read};

use sha2::{Digest, Sha512_256};

pub use builder::{DigestWriter, Package, PackageEntry, PackageStream};
pub use unpack::{extract, unpack, verify, ExtractReport};

/// Length of a package digest in bytes
pub const DIGEST_LEN: usize = 32;

/// SHA-512/256 digest of a serialized package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackageDigest(pub [u8; DIGEST_LEN]);

impl PackageDigest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PackageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Digest and byte count of a serialized package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageSummary {
    pub digest: PackageDigest,
    pub size: u64,
}

/// Hash a reader to EOF
pub fn digest_reader<R: Read>(reader: &mut R) -> io::Result<PackageSummary> {
    let mut hasher = Sha512_256::new();
    let size = io::copy(reader, &mut hasher)?;
    Ok(PackageSummary {
        digest: PackageDigest(hasher.finalize().into()),
        size,
    })
}
