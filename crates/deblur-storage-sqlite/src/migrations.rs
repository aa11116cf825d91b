use rusqlite::Connection;
use tracing::info;

/// Ordered schema steps; `PRAGMA user_version` records how many have run.
pub const MIGRATIONS: &[(&str, &str)] = &[("0001_init", include_str!("../migrations/0001_init.sql"))];

/// Applies every migration newer than the database's `user_version`, each in
/// its own transaction. Returns the resulting version.
pub fn apply_migrations(conn: &mut Connection) -> rusqlite::Result<u32> {
    let current: u32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    for (idx, (name, sql)) in MIGRATIONS.iter().enumerate().skip(current as usize) {
        let version = idx as u32 + 1;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
        info!(migration = name, version, "applied schema migration");
    }
    Ok(MIGRATIONS.len().max(current as usize) as u32)
}
