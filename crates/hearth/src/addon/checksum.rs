//! SHA256SUMS verification
//!
//! Lines are `<64 hex digits> <relative path>`, with an optional `*` before
//! the path marking binary mode.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

pub const SUMS_FILE: &str = "SHA256SUMS";

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Malformed line {line} in SHA256SUMS")]
    Malformed { line: usize },

    #[error("File {0} listed in SHA256SUMS is missing")]
    MissingFile(String),

    #[error("No checksum found for file {0}")]
    Unlisted(String),

    #[error("Checksum failed for file {0}")]
    Mismatch(String),

    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Parse SHA256SUMS text into relative path → lowercase hex digest
pub fn parse_sums(text: &str) -> Result<BTreeMap<String, String>, ChecksumError> {
    let mut sums = BTreeMap::new();
    for (index, line) in text.lines().enumerate() {
        let line = line.trim_end();
        if line.trim().is_empty() {
            continue;
        }
        let malformed = || ChecksumError::Malformed { line: index + 1 };
        let digest = line.get(..64).ok_or_else(malformed)?;
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed());
        }
        let name = line[64..].trim_start();
        let name = name.strip_prefix('*').unwrap_or(name);
        if name.is_empty() {
            return Err(malformed());
        }
        sums.insert(
            name.trim_start_matches("./").to_string(),
            digest.to_ascii_lowercase(),
        );
    }
    Ok(sums)
}

/// Streaming SHA-256 of a file, hex encoded
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn read_sums(dir: &Path) -> Result<BTreeMap<String, String>, ChecksumError> {
    let path = dir.join(SUMS_FILE);
    let text = std::fs::read_to_string(&path).map_err(|source| ChecksumError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_sums(&text)
}

fn check_one(dir: &Path, name: &str, expected: &str) -> Result<(), ChecksumError> {
    let path = dir.join(name);
    if !path.is_file() {
        return Err(ChecksumError::MissingFile(name.to_string()));
    }
    let actual = hash_file(&path).map_err(|source| ChecksumError::Read {
        path: path.display().to_string(),
        source,
    })?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(ChecksumError::Mismatch(name.to_string()));
    }
    Ok(())
}

/// Verify every file listed in SHA256SUMS. Unlisted files are not checked.
pub fn verify_listed(dir: &Path) -> Result<(), ChecksumError> {
    for (name, expected) in read_sums(dir)? {
        check_one(dir, &name, &expected)?;
    }
    Ok(())
}

/// Verify the whole tree: every regular file except SHA256SUMS itself and
/// anything under `.git` must be listed and match.
pub fn verify_tree(dir: &Path) -> Result<(), ChecksumError> {
    let sums = read_sums(dir)?;
    for (name, expected) in &sums {
        check_one(dir, name, expected)?;
    }

    let mut files = Vec::new();
    collect_files(dir, dir, &mut files)?;
    for relative in files {
        let name = relative.to_string_lossy().replace('\\', "/");
        if name == SUMS_FILE {
            continue;
        }
        if !sums.contains_key(&name) {
            return Err(ChecksumError::Unlisted(name));
        }
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), ChecksumError> {
    let read_err = |source| ChecksumError::Read {
        path: dir.display().to_string(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(read_err)? {
        let entry = entry.map_err(read_err)?;
        let path = entry.path();
        let file_type = entry.file_type().map_err(read_err)?;
        if file_type.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_path_buf());
            }
        }
    }
    Ok(())
}
