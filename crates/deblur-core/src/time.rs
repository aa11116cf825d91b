use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since UNIX epoch.
pub type EpochSecs = i64;

pub fn now_unix() -> EpochSecs {
    let dur = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_secs() as i64
}
