use rusqlite::{params, Connection, OptionalExtension};

use super::quoted_identifier;
use crate::{error::LimiterError, tracker::PeerLimitSettings};

/// Read the per-peer limit settings row from the interface's table.
///
/// The dashboard keeps one table per interface, named after the interface
/// itself, with the peer's public key as the primary key. A missing table
/// or row is not an error: it means the peer is unlimited and runs with
/// defaults. Rows are re-read every tick so dashboard edits take effect on
/// the next pass.
pub fn get_peer_settings(
    conn: &Connection,
    interface: &str,
    peer_id: &str,
) -> Result<PeerLimitSettings, LimiterError> {
    let table = quoted_identifier(interface)?;
    if !table_exists(conn, interface)? {
        return Ok(PeerLimitSettings::default());
    }

    let mut stmt = conn.prepare_cached(&format!(
        "SELECT max_concurrent, connection_policy, session_ttl, grace_seconds
         FROM {table} WHERE id = ?1"
    ))?;
    let row = stmt
        .query_row(params![peer_id], |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })
        .optional()?;

    match row {
        Some((max_concurrent, policy, session_ttl, grace_seconds)) => {
            PeerLimitSettings::from_columns(
                max_concurrent,
                policy.as_deref(),
                session_ttl,
                grace_seconds,
            )
        },
        None => Ok(PeerLimitSettings::default()),
    }
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, LimiterError> {
    let mut stmt =
        conn.prepare_cached("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1")?;
    Ok(stmt.exists(params![name])?)
}
