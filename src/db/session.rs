use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::{error::LimiterError, tracker::PeerSession};

/// One persisted session row: the tracker's view of an endpoint plus the
/// allow/deny decision for the latest tick. Other processes (the dashboard)
/// read these rows for display; the tracker never reads them back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSession {
    pub interface: String,
    pub peer_id: String,
    pub endpoint: String,
    pub last_handshake: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_delta: u64,
    pub tx_delta: u64,
    pub is_allowed: bool,
    pub updated_at: DateTime<Utc>,
}

impl DatabaseSession {
    pub fn from_session(
        interface: &str,
        peer_id: &str,
        session: &PeerSession,
        is_allowed: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            interface: interface.to_string(),
            peer_id: peer_id.to_string(),
            endpoint: session.endpoint.clone(),
            last_handshake: session.last_handshake,
            first_seen: session.first_seen,
            last_seen: session.last_seen,
            rx_bytes: session.rx_bytes,
            tx_bytes: session.tx_bytes,
            rx_delta: session.rx_delta,
            tx_delta: session.tx_delta,
            is_allowed,
            updated_at: now,
        }
    }

    /// Seconds since the last handshake, relative to `now`.
    pub fn handshake_age(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_handshake
            .map(|handshake| (now - handshake).num_seconds())
    }

    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            interface: row.get(0)?,
            peer_id: row.get(1)?,
            endpoint: row.get(2)?,
            last_handshake: row.get(3)?,
            first_seen: row.get(4)?,
            last_seen: row.get(5)?,
            rx_bytes: row.get::<_, i64>(6)? as u64,
            tx_bytes: row.get::<_, i64>(7)? as u64,
            rx_delta: row.get::<_, i64>(8)? as u64,
            tx_delta: row.get::<_, i64>(9)? as u64,
            is_allowed: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    /// Replace the persisted snapshot for one peer in a single transaction.
    ///
    /// Snapshot replace is correct because the tracker is the sole source of
    /// truth: the rows for a peer never outlive the tick that produced them.
    pub fn upsert_sessions(
        conn: &mut Connection,
        interface: &str,
        peer_id: &str,
        records: &[DatabaseSession],
    ) -> Result<(), LimiterError> {
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM PeerLimiterSessions WHERE Interface = ?1 AND PeerID = ?2",
            params![interface, peer_id],
        )?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO PeerLimiterSessions
                 (Interface, PeerID, Endpoint, LastHandshake, FirstSeen, LastSeen,
                  RxBytes, TxBytes, RxDelta, TxDelta, IsAllowed, UpdatedAt)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for record in records {
                stmt.execute(params![
                    interface,
                    peer_id,
                    record.endpoint,
                    record.last_handshake,
                    record.first_seen,
                    record.last_seen,
                    record.rx_bytes as i64,
                    record.tx_bytes as i64,
                    record.rx_delta as i64,
                    record.tx_delta as i64,
                    record.is_allowed,
                    record.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete every row for an interface that no longer exists.
    pub fn purge_interface(conn: &Connection, interface: &str) -> Result<usize, LimiterError> {
        Ok(conn.execute(
            "DELETE FROM PeerLimiterSessions WHERE Interface = ?1",
            params![interface],
        )?)
    }

    /// Rows for one peer, most recently seen first.
    pub fn get_sessions(
        conn: &Connection,
        interface: &str,
        peer_id: &str,
    ) -> Result<Vec<Self>, LimiterError> {
        let mut stmt = conn.prepare_cached(
            "SELECT Interface, PeerID, Endpoint, LastHandshake, FirstSeen, LastSeen,
                    RxBytes, TxBytes, RxDelta, TxDelta, IsAllowed, UpdatedAt
             FROM PeerLimiterSessions
             WHERE Interface = ?1 AND PeerID = ?2
             ORDER BY LastSeen DESC",
        )?;
        let rows = stmt.query_map(params![interface, peer_id], Self::from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}
