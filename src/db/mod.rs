use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::Connection;

use crate::error::LimiterError;

pub mod session;
pub mod settings;

pub use session::DatabaseSession;

/// Matches the names the kernel accepts for network interfaces. Interface
/// names reach SQL as table identifiers (a convention inherited from the
/// dashboard), so nothing outside this set may ever be interpolated.
static INTERFACE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,14}$").unwrap());

pub static CREATE_SESSIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS PeerLimiterSessions (
      Interface     TEXT NOT NULL,                /* Interface the peer was observed on.               */
      PeerID        TEXT NOT NULL,                /* The peer's WireGuard public key.                  */
      Endpoint      TEXT NOT NULL,                /* Source host:port the peer's packets came from.    */
      LastHandshake TEXT,                         /* Most recent handshake, if there ever was one.     */
      FirstSeen     TEXT NOT NULL,
      LastSeen      TEXT NOT NULL,
      RxBytes       INTEGER NOT NULL DEFAULT 0,   /* Cumulative counters from the data plane.          */
      TxBytes       INTEGER NOT NULL DEFAULT 0,
      RxDelta       INTEGER NOT NULL DEFAULT 0,   /* Per-tick deltas, clamped at zero.                 */
      TxDelta       INTEGER NOT NULL DEFAULT 0,
      IsAllowed     INTEGER NOT NULL DEFAULT 1,   /* The tracker's decision as of the latest tick.     */
      UpdatedAt     TEXT NOT NULL,
      PRIMARY KEY (Interface, PeerID, Endpoint)
    )";

/// Open the shared dashboard database and make sure the limiter's state
/// table exists.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection, LimiterError> {
    let conn = Connection::open(path)?;
    auto_migrate(&conn)?;
    Ok(conn)
}

pub fn auto_migrate(conn: &Connection) -> Result<(), LimiterError> {
    conn.execute(CREATE_SESSIONS_TABLE_SQL, [])?;
    Ok(())
}

/// Quote an interface name for use as a table identifier, refusing anything
/// that does not look like an interface name.
pub fn quoted_identifier(name: &str) -> Result<String, LimiterError> {
    if INTERFACE_NAME_REGEX.is_match(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(LimiterError::InvalidIdentifier(name.to_string()))
    }
}
