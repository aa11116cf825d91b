//! Deterministic fingerprints used to build idempotency keys.
//!
//! These are SHA-256 digests, but nothing here is meant to be security-grade:
//! folder fingerprints in particular only look at file names and sizes.

pub mod scan;

pub use scan::{image_files, is_image_file, IMAGE_EXTENSIONS};

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const CHUNK: usize = 64 * 1024;

pub fn fingerprint_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Streams the file through SHA-256. Only content goes into the digest.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Cheap folder identity: the folder path plus sorted `name:size` pairs of its
/// image files. Content edits that keep both name and size are not detected.
pub fn fingerprint_folder(folder: &Path) -> io::Result<String> {
    let mut parts = Vec::new();
    for path in image_files(folder)? {
        let size = std::fs::metadata(&path)?.len();
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        parts.push(format!("{}:{}", name, size));
    }
    let info = format!("{}|{}", folder.to_string_lossy(), parts.join("|"));
    Ok(fingerprint_bytes(info.as_bytes()))
}

/// Idempotency key over (input fingerprint, prompt, params).
///
/// `params` is serialized with sorted object keys, so two maps with the same
/// entries in different order produce the same key.
pub fn idempotency_key(input_fingerprint: &str, prompt: &str, params: &serde_json::Value) -> String {
    let prompt_hash = fingerprint_bytes(prompt.as_bytes());
    let params_hash = fingerprint_bytes(canonical_json(params).as_bytes());
    let key = format!("{}|{}|{}", input_fingerprint, &prompt_hash[..16], &params_hash[..16]);
    fingerprint_bytes(key.as_bytes())
}

/// serde_json's default `Map` is a `BTreeMap`, so plain serialization is already key-sorted.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "{}".to_string(),
        v => v.to_string(),
    }
}
