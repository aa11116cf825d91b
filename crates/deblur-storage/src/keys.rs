use std::path::Path;

use deblur_fingerprint::{canonical_json, fingerprint_folder, idempotency_key};

use crate::{NewTask, StorageError, StorageResult};

/// Identity fields a task row is stored with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DerivedKeys {
    pub input_fingerprint: String,
    pub idempotency_key: String,
    pub params_blob: String,
}

/// Fills in whatever the caller did not supply: the input folder fingerprint
/// and the idempotency key over (fingerprint, prompt, params).
pub fn derive_keys(new: &NewTask) -> StorageResult<DerivedKeys> {
    let input_fingerprint = match &new.input_fingerprint {
        Some(fp) => fp.clone(),
        None => fingerprint_folder(Path::new(&new.input_path)).map_err(|source| StorageError::Fingerprint {
            path: new.input_path.clone(),
            source,
        })?,
    };
    let idempotency_key = match &new.idempotency_key {
        Some(key) => key.clone(),
        None => idempotency_key(&input_fingerprint, &new.prompt, &new.params),
    };
    Ok(DerivedKeys {
        input_fingerprint,
        idempotency_key,
        params_blob: canonical_json(&new.params),
    })
}
