//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::models::*;

mod embedded {
    refinery::embed_migrations!("migrations");
}

const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn.lock();
        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;
        Ok(())
    }

    // --- Subjects ---

    /// Remember a subject so the threshold checker evaluates it. Idempotent.
    pub fn register_subject(&self, subject_id: i64) -> Result<(), DbError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO subjects (id, registered_at) VALUES (?1, ?2)",
            params![subject_id, format_db_time(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_subject_ids(&self) -> Result<Vec<i64>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM subjects ORDER BY id ASC")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<i64>>>()?;
        Ok(ids)
    }

    // --- Samples ---

    /// Append a resource/traffic pair in one transaction.
    pub fn add_samples(&self, resource: &ResourceSample, traffic: &TrafficSample) -> Result<(), DbError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        tx.execute(
            "INSERT INTO resource_samples (time, cpu_percent, memory_percent, memory_used, memory_total, disk_percent, disk_used, disk_total)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                format_db_time(resource.sampled_at),
                resource.cpu_percent,
                resource.memory_percent,
                to_sql_int(resource.memory_used),
                to_sql_int(resource.memory_total),
                resource.disk_percent,
                to_sql_int(resource.disk_used),
                to_sql_int(resource.disk_total),
            ],
        )?;
        tx.execute(
            "INSERT INTO traffic_samples (time, bytes_sent, bytes_recv, packets_sent, packets_recv)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format_db_time(traffic.sampled_at),
                to_sql_int(traffic.bytes_sent),
                to_sql_int(traffic.bytes_recv),
                to_sql_int(traffic.packets_sent),
                to_sql_int(traffic.packets_recv),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Resource samples taken at or after `since`, newest first.
    pub fn get_resource_history(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<ResourceSample>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, cpu_percent, memory_percent, memory_used, memory_total, disk_percent, disk_used, disk_total
             FROM resource_samples WHERE time >= ?1 ORDER BY time DESC LIMIT ?2",
        )?;

        let samples = stmt
            .query_map(params![format_db_time(since), to_sql_limit(limit)], |row| {
                Ok(ResourceSample {
                    sampled_at: row_time(row, 0)?,
                    cpu_percent: row.get(1)?,
                    memory_percent: row.get(2)?,
                    memory_used: row_u64(row, 3)?,
                    memory_total: row_u64(row, 4)?,
                    disk_percent: row.get(5)?,
                    disk_used: row_u64(row, 6)?,
                    disk_total: row_u64(row, 7)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// Traffic samples taken at or after `since`, newest first.
    pub fn get_traffic_history(&self, since: DateTime<Utc>, limit: usize) -> Result<Vec<TrafficSample>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, bytes_sent, bytes_recv, packets_sent, packets_recv
             FROM traffic_samples WHERE time >= ?1 ORDER BY time DESC LIMIT ?2",
        )?;

        let samples = stmt
            .query_map(params![format_db_time(since), to_sql_limit(limit)], map_traffic_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    /// All traffic samples at or after `since`, oldest first.
    pub fn get_traffic_since(&self, since: DateTime<Utc>) -> Result<Vec<TrafficSample>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT time, bytes_sent, bytes_recv, packets_sent, packets_recv
             FROM traffic_samples WHERE time >= ?1 ORDER BY time ASC",
        )?;

        let samples = stmt
            .query_map(params![format_db_time(since)], map_traffic_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    // --- Packets ---

    /// Persist a finished capture run. When `clear_previous` is set the
    /// owner's older packets are deleted in the same transaction. Assigns
    /// row ids to `packets`.
    pub fn commit_capture(
        &self,
        owner_id: i64,
        clear_previous: bool,
        packets: &mut [PacketRecord],
    ) -> Result<usize, DbError> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;

        let mut cleared = 0;
        if clear_previous {
            cleared = tx.execute("DELETE FROM packets WHERE owner_id = ?1", params![owner_id])?;
        }

        {
            let mut stmt = tx.prepare(
                "INSERT INTO packets (time, owner_id, protocol, src_addr, dst_addr, src_port, dst_port, length, info)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;

            for p in packets.iter_mut() {
                stmt.execute(params![
                    format_db_time(p.captured_at),
                    owner_id,
                    p.protocol.as_str(),
                    p.src_addr,
                    p.dst_addr,
                    p.src_port,
                    p.dst_port,
                    p.length,
                    p.info,
                ])?;
                p.id = tx.last_insert_rowid();
                p.owner_id = owner_id;
            }
        }

        tx.commit()?;
        Ok(cleared)
    }

    pub fn count_packets(&self, owner_id: i64) -> Result<i64, DbError> {
        let conn = self.conn.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM packets WHERE owner_id = ?1",
            params![owner_id],
            |r| r.get(0),
        )?)
    }

    /// Packets captured by `owner_id` since `since`, newest first.
    pub fn get_packets(
        &self,
        owner_id: i64,
        since: DateTime<Utc>,
        protocol: Option<Protocol>,
        limit: usize,
    ) -> Result<Vec<PacketRecord>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, time, owner_id, protocol, src_addr, dst_addr, src_port, dst_port, length, info
             FROM packets
             WHERE owner_id = ?1 AND time >= ?2 AND (?3 IS NULL OR protocol = ?3)
             ORDER BY time DESC, id DESC LIMIT ?4",
        )?;

        let packets = stmt
            .query_map(
                params![
                    owner_id,
                    format_db_time(since),
                    protocol.map(|p| p.as_str()),
                    to_sql_limit(limit),
                ],
                |row| {
                    let protocol: String = row.get(3)?;
                    Ok(PacketRecord {
                        id: row.get(0)?,
                        captured_at: row_time(row, 1)?,
                        owner_id: row.get(2)?,
                        protocol: Protocol::from_db(&protocol),
                        src_addr: row.get(4)?,
                        dst_addr: row.get(5)?,
                        src_port: row.get(6)?,
                        dst_port: row.get(7)?,
                        length: row.get(8)?,
                        info: row.get(9)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(packets)
    }

    /// Packet count and byte sum per protocol. Missing lengths count as 0.
    pub fn get_protocol_counts(&self, owner_id: i64, since: DateTime<Utc>) -> Result<Vec<ProtocolStat>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT protocol, COUNT(*) AS packet_count, COALESCE(SUM(length), 0)
             FROM packets
             WHERE owner_id = ?1 AND time >= ?2
             GROUP BY protocol
             ORDER BY packet_count DESC, protocol ASC",
        )?;

        let stats = stmt
            .query_map(params![owner_id, format_db_time(since)], |row| {
                let protocol: String = row.get(0)?;
                Ok(ProtocolStat {
                    protocol: Protocol::from_db(&protocol),
                    packet_count: row.get(1)?,
                    total_bytes: row.get(2)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(stats)
    }

    // --- Alerts ---

    /// Insert each candidate unless an active alert of the same type already
    /// exists for the subject. Returns the rows actually written. All
    /// candidates are written in one transaction.
    pub fn insert_alerts_if_absent(
        &self,
        subject_id: i64,
        candidates: &[NewAlert],
        now: DateTime<Utc>,
    ) -> Result<Vec<Alert>, DbError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let mut created = Vec::new();

        {
            // The partial unique index on active alerts turns a duplicate into a no-op.
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO alerts (alert_type, message, severity, status, subject_id, device_id, created_at)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6)",
            )?;

            for c in candidates {
                let changed = stmt.execute(params![
                    c.alert_type.as_str(),
                    c.message,
                    c.severity.as_str(),
                    subject_id,
                    c.device_id,
                    format_db_time(now),
                ])?;
                if changed == 0 {
                    continue;
                }
                created.push(Alert {
                    id: tx.last_insert_rowid(),
                    alert_type: c.alert_type,
                    message: c.message.clone(),
                    severity: c.severity,
                    status: AlertStatus::Active,
                    subject_id,
                    device_id: c.device_id,
                    created_at: now,
                    resolved_at: None,
                });
            }
        }

        tx.commit()?;
        Ok(created)
    }

    /// Alerts for a subject with the given status, newest first.
    pub fn get_alerts(&self, subject_id: i64, status: AlertStatus, limit: usize) -> Result<Vec<Alert>, DbError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, alert_type, message, severity, status, subject_id, device_id, created_at, resolved_at
             FROM alerts WHERE subject_id = ?1 AND status = ?2
             ORDER BY created_at DESC, id DESC LIMIT ?3",
        )?;

        let alerts = stmt
            .query_map(params![subject_id, status.as_str(), to_sql_limit(limit)], map_alert_row)?
            .collect::<SqlResult<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        Ok(alerts)
    }

    pub fn get_alert(&self, id: i64, subject_id: i64) -> Result<Alert, DbError> {
        let conn = self.conn.lock();
        let alert = conn
            .query_row(
                "SELECT id, alert_type, message, severity, status, subject_id, device_id, created_at, resolved_at
                 FROM alerts WHERE id = ?1 AND subject_id = ?2",
                params![id, subject_id],
                map_alert_row,
            )
            .optional()?
            .flatten();

        alert.ok_or(DbError::NotFound)
    }

    /// Mark an alert resolved. Resolving an already resolved alert leaves it unchanged.
    pub fn resolve_alert(&self, id: i64, subject_id: i64) -> Result<Alert, DbError> {
        {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE alerts SET status = 'resolved', resolved_at = ?1
                 WHERE id = ?2 AND subject_id = ?3 AND status = 'active'",
                params![format_db_time(Utc::now()), id, subject_id],
            )?;
        }
        self.get_alert(id, subject_id)
    }

    /// Alert counts by type and severity created since `since`.
    pub fn get_alert_statistics(&self, subject_id: i64, since: DateTime<Utc>) -> Result<AlertStatistics, DbError> {
        let conn = self.conn.lock();
        let since = format_db_time(since);

        let mut by_type = conn.prepare(
            "SELECT alert_type, COUNT(*) FROM alerts
             WHERE subject_id = ?1 AND created_at >= ?2
             GROUP BY alert_type ORDER BY alert_type",
        )?;
        let by_type = by_type
            .query_map(params![subject_id, since], map_count_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut by_severity = conn.prepare(
            "SELECT severity, COUNT(*) FROM alerts
             WHERE subject_id = ?1 AND created_at >= ?2
             GROUP BY severity ORDER BY severity",
        )?;
        let by_severity = by_severity
            .query_map(params![subject_id, since], map_count_row)?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(AlertStatistics { by_type, by_severity })
    }
}

fn map_traffic_row(row: &Row<'_>) -> SqlResult<TrafficSample> {
    Ok(TrafficSample {
        sampled_at: row_time(row, 0)?,
        bytes_sent: row_u64(row, 1)?,
        bytes_recv: row_u64(row, 2)?,
        packets_sent: row_u64(row, 3)?,
        packets_recv: row_u64(row, 4)?,
    })
}

/// Rows with an unrecognised alert type map to `None` and are skipped.
fn map_alert_row(row: &Row<'_>) -> SqlResult<Option<Alert>> {
    let alert_type: String = row.get(1)?;
    let Some(alert_type) = AlertType::from_db(&alert_type) else {
        return Ok(None);
    };
    let severity: String = row.get(3)?;
    let status: String = row.get(4)?;
    let resolved_at = match row.get_ref(8)? {
        ValueRef::Null => None,
        _ => Some(row_time(row, 8)?),
    };

    Ok(Some(Alert {
        id: row.get(0)?,
        alert_type,
        message: row.get(2)?,
        severity: AlertSeverity::from_db(&severity),
        status: AlertStatus::from_db(&status),
        subject_id: row.get(5)?,
        device_id: row.get(6)?,
        created_at: row_time(row, 7)?,
        resolved_at,
    }))
}

fn map_count_row(row: &Row<'_>) -> SqlResult<CountByKey> {
    Ok(CountByKey {
        key: row.get(0)?,
        count: row.get(1)?,
    })
}

fn row_time(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| {
        tracing::warn!("Store: unparseable timestamp {:?} in column {}", s, idx);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, format!("invalid timestamp: {}", s).into())
    })
}

fn row_u64(row: &Row<'_>, idx: usize) -> SqlResult<u64> {
    let v: i64 = row.get(idx)?;
    u64::try_from(v).map_err(|e| {
        tracing::warn!("Store: negative counter {} in column {}", v, idx);
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e))
    })
}

/// SQLite integers are signed; counters beyond i64::MAX saturate.
fn to_sql_int(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

pub(crate) fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(DB_TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}
