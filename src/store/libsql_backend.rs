//! libSQL backend: async `Database` trait implementation.
//!
//! One shared connection serves every operation. Writes take `write_lock`
//! first so a multi-statement transaction on that connection never
//! interleaves with another writer; reads go straight through.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::content::SendableContent;
use crate::delivery::DeliveryRecord;
use crate::error::DatabaseError;
use crate::funnels::model::{
    Advance, DueEnrollment, EnrollmentStatus, Funnel, FunnelEnrollment, FunnelStep,
};
use crate::immediate::{ImmediateSend, ImmediateStatus, PendingImmediate};
use crate::leader::LeaseRecord;
use crate::leads::{Lead, LeadStatus};
use crate::sending::{SendSlot, SendingAccount, SendingConfig, SendingSettings};
use crate::store::migrations;
use crate::store::traits::{Database, FailureKind, LaunchResult};
use crate::suppression::SuppressionEntry;
use crate::transmissions::model::{
    Audience, PendingRecipient, RecipientState, SendOrder, Transmission, TransmissionMode,
    TransmissionRecipient, TransmissionStatus,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Start a `BEGIN IMMEDIATE` transaction. Caller must hold `write_lock`.
    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: begin: {e}")))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Commit on success, roll back on error.
async fn finish<T>(
    tx: Transaction,
    result: Result<T, DatabaseError>,
    op: &str,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op}: commit: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(op, error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Canonical timestamp format. Fixed width, so text comparison in SQL
/// orders the same way as time.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s:?}: {e}")))
}

fn parse_field<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

fn row_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(format!("row decode: {e}"))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

/// `"a, b"` -> `"x.a, x.b"`, for joins over the column-list consts.
fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(", ")
        .map(|c| format!("{alias}.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

const LEAD_COLUMNS: &str = "id, email, name, status, suppressed, fields, created_at, updated_at";

const FUNNEL_COLUMNS: &str = "id, name, enabled, created_at";

const STEP_COLUMNS: &str =
    "id, funnel_id, position, delay_value, delay_unit, send_time, enabled, subject, html";

const ENROLLMENT_COLUMNS: &str = "id, lead_id, funnel_id, current_step_position, next_send_at, status, attempts, last_error, created_at, updated_at";

const IMMEDIATE_COLUMNS: &str =
    "id, lead_id, subject, html, status, attempts, last_error, sent_at, created_at, updated_at";

const TRANSMISSION_COLUMNS: &str = "id, name, mode, scheduled_at, min_interval_seconds, max_interval_seconds, send_order, enabled, status, audience, subject, html, total_recipients, sent_count, failed_count, pending_count, next_dispatch_at, failure_reason, launched_at, completed_at, created_at, updated_at";

const RECIPIENT_COLUMNS: &str =
    "id, transmission_id, lead_id, state, attempts, last_error, sent_at, created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "id, name, from_address, smtp_host, smtp_port, smtp_username, smtp_password, enabled, position";

const CONFIG_COLUMNS: &str = "daily_limit, min_interval_seconds, rotation_chunk_size, emails_sent_today, counter_date, last_sent_at, current_account_index, remaining_chunk";

const DELIVERY_COLUMNS: &str = "id, kind, reference_id, lead_id, email, account_id, account_name, subject, sent, error_class, error, variation_applied, attempted_at";

const NOT_SUPPRESSED: &str =
    "l.suppressed = 0 AND NOT EXISTS (SELECT 1 FROM suppressions x WHERE x.email = l.email)";

// ── Row mapping ─────────────────────────────────────────────────────

/// Lead columns start at `o`.
fn row_to_lead(row: &libsql::Row, o: i32) -> Result<Lead, DatabaseError> {
    let fields_str: String = row.get(o + 5).unwrap_or_else(|_| "{}".to_string());
    Ok(Lead {
        id: parse_uuid(&row.get::<String>(o).map_err(row_err)?)?,
        email: row.get(o + 1).map_err(row_err)?,
        name: row.get(o + 2).ok(),
        status: parse_field::<LeadStatus>(&row.get::<String>(o + 3).map_err(row_err)?)?,
        suppressed: row.get::<i64>(o + 4).unwrap_or(0) != 0,
        fields: serde_json::from_str(&fields_str).unwrap_or(serde_json::json!({})),
        created_at: parse_datetime(&row.get::<String>(o + 6).map_err(row_err)?),
        updated_at: parse_datetime(&row.get::<String>(o + 7).map_err(row_err)?),
    })
}

fn row_to_funnel(row: &libsql::Row) -> Result<Funnel, DatabaseError> {
    Ok(Funnel {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        name: row.get(1).map_err(row_err)?,
        enabled: row.get::<i64>(2).unwrap_or(0) != 0,
        created_at: parse_datetime(&row.get::<String>(3).map_err(row_err)?),
    })
}

fn row_to_step(row: &libsql::Row, o: i32) -> Result<FunnelStep, DatabaseError> {
    let send_time: Option<String> = row.get(o + 5).ok();
    Ok(FunnelStep {
        id: parse_uuid(&row.get::<String>(o).map_err(row_err)?)?,
        funnel_id: parse_uuid(&row.get::<String>(o + 1).map_err(row_err)?)?,
        position: row.get(o + 2).map_err(row_err)?,
        delay_value: row.get(o + 3).map_err(row_err)?,
        delay_unit: parse_field(&row.get::<String>(o + 4).map_err(row_err)?)?,
        send_time: send_time.and_then(|s| NaiveTime::parse_from_str(&s, "%H:%M:%S").ok()),
        enabled: row.get::<i64>(o + 6).unwrap_or(0) != 0,
        content: SendableContent::new(
            row.get::<String>(o + 7).map_err(row_err)?,
            row.get::<String>(o + 8).map_err(row_err)?,
        ),
    })
}

fn row_to_enrollment(row: &libsql::Row, o: i32) -> Result<FunnelEnrollment, DatabaseError> {
    Ok(FunnelEnrollment {
        id: parse_uuid(&row.get::<String>(o).map_err(row_err)?)?,
        lead_id: parse_uuid(&row.get::<String>(o + 1).map_err(row_err)?)?,
        funnel_id: parse_uuid(&row.get::<String>(o + 2).map_err(row_err)?)?,
        current_step_position: row.get(o + 3).map_err(row_err)?,
        next_send_at: parse_datetime(&row.get::<String>(o + 4).map_err(row_err)?),
        status: parse_field(&row.get::<String>(o + 5).map_err(row_err)?)?,
        attempts: row.get::<i64>(o + 6).unwrap_or(0) as u32,
        last_error: row.get(o + 7).ok(),
        created_at: parse_datetime(&row.get::<String>(o + 8).map_err(row_err)?),
        updated_at: parse_datetime(&row.get::<String>(o + 9).map_err(row_err)?),
    })
}

fn row_to_immediate(row: &libsql::Row, o: i32) -> Result<ImmediateSend, DatabaseError> {
    let sent_at: Option<String> = row.get(o + 7).ok();
    Ok(ImmediateSend {
        id: parse_uuid(&row.get::<String>(o).map_err(row_err)?)?,
        lead_id: parse_uuid(&row.get::<String>(o + 1).map_err(row_err)?)?,
        content: SendableContent::new(
            row.get::<String>(o + 2).map_err(row_err)?,
            row.get::<String>(o + 3).map_err(row_err)?,
        ),
        status: parse_field(&row.get::<String>(o + 4).map_err(row_err)?)?,
        attempts: row.get::<i64>(o + 5).unwrap_or(0) as u32,
        last_error: row.get(o + 6).ok(),
        sent_at: parse_optional_datetime(&sent_at),
        created_at: parse_datetime(&row.get::<String>(o + 8).map_err(row_err)?),
        updated_at: parse_datetime(&row.get::<String>(o + 9).map_err(row_err)?),
    })
}

fn row_to_transmission(row: &libsql::Row) -> Result<Transmission, DatabaseError> {
    let scheduled_at: Option<String> = row.get(3).ok();
    let audience_str: String = row.get(9).map_err(row_err)?;
    let audience: Audience = serde_json::from_str(&audience_str)
        .map_err(|e| DatabaseError::Serialization(format!("audience: {e}")))?;
    let next_dispatch_at: Option<String> = row.get(16).ok();
    let launched_at: Option<String> = row.get(18).ok();
    let completed_at: Option<String> = row.get(19).ok();

    Ok(Transmission {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        name: row.get(1).map_err(row_err)?,
        mode: parse_field(&row.get::<String>(2).map_err(row_err)?)?,
        scheduled_at: parse_optional_datetime(&scheduled_at),
        min_interval_seconds: row.get::<i64>(4).unwrap_or(0).max(0) as u64,
        max_interval_seconds: row.get::<i64>(5).unwrap_or(0).max(0) as u64,
        send_order: parse_field(&row.get::<String>(6).map_err(row_err)?)?,
        enabled: row.get::<i64>(7).unwrap_or(0) != 0,
        status: parse_field(&row.get::<String>(8).map_err(row_err)?)?,
        audience,
        content: SendableContent::new(
            row.get::<String>(10).map_err(row_err)?,
            row.get::<String>(11).map_err(row_err)?,
        ),
        total_recipients: row.get::<i64>(12).unwrap_or(0),
        sent_count: row.get::<i64>(13).unwrap_or(0),
        failed_count: row.get::<i64>(14).unwrap_or(0),
        pending_count: row.get::<i64>(15).unwrap_or(0),
        next_dispatch_at: parse_optional_datetime(&next_dispatch_at),
        failure_reason: row.get(17).ok(),
        launched_at: parse_optional_datetime(&launched_at),
        completed_at: parse_optional_datetime(&completed_at),
        created_at: parse_datetime(&row.get::<String>(20).map_err(row_err)?),
        updated_at: parse_datetime(&row.get::<String>(21).map_err(row_err)?),
    })
}

fn row_to_recipient(row: &libsql::Row, o: i32) -> Result<TransmissionRecipient, DatabaseError> {
    let sent_at: Option<String> = row.get(o + 6).ok();
    Ok(TransmissionRecipient {
        id: parse_uuid(&row.get::<String>(o).map_err(row_err)?)?,
        transmission_id: parse_uuid(&row.get::<String>(o + 1).map_err(row_err)?)?,
        lead_id: parse_uuid(&row.get::<String>(o + 2).map_err(row_err)?)?,
        state: parse_field(&row.get::<String>(o + 3).map_err(row_err)?)?,
        attempts: row.get::<i64>(o + 4).unwrap_or(0) as u32,
        last_error: row.get(o + 5).ok(),
        sent_at: parse_optional_datetime(&sent_at),
        created_at: parse_datetime(&row.get::<String>(o + 7).map_err(row_err)?),
        updated_at: parse_datetime(&row.get::<String>(o + 8).map_err(row_err)?),
    })
}

fn row_to_account(row: &libsql::Row) -> Result<SendingAccount, DatabaseError> {
    Ok(SendingAccount {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        name: row.get(1).map_err(row_err)?,
        from_address: row.get(2).map_err(row_err)?,
        smtp_host: row.get(3).map_err(row_err)?,
        smtp_port: row.get::<i64>(4).unwrap_or(587) as u16,
        smtp_username: row.get(5).map_err(row_err)?,
        smtp_password: SecretString::from(row.get::<String>(6).unwrap_or_default()),
        enabled: row.get::<i64>(7).unwrap_or(0) != 0,
        position: row.get::<i64>(8).unwrap_or(0),
    })
}

fn row_to_sending_config(row: &libsql::Row) -> Result<SendingConfig, DatabaseError> {
    let counter_date: String = row.get(4).map_err(row_err)?;
    let last_sent_at: Option<String> = row.get(5).ok();
    Ok(SendingConfig {
        settings: SendingSettings {
            daily_limit: row.get::<i64>(0).map_err(row_err)?.max(0) as u32,
            min_interval_seconds: row.get::<i64>(1).map_err(row_err)?.max(0) as u64,
            rotation_chunk_size: row.get::<i64>(2).map_err(row_err)?.max(1) as u32,
        },
        emails_sent_today: row.get::<i64>(3).unwrap_or(0).max(0) as u32,
        counter_date: NaiveDate::parse_from_str(&counter_date, "%Y-%m-%d").unwrap_or_default(),
        last_sent_at: parse_optional_datetime(&last_sent_at),
        current_account_index: row.get::<i64>(6).unwrap_or(0).max(0) as u32,
        remaining_chunk: row.get::<i64>(7).unwrap_or(0).max(0) as u32,
    })
}

fn row_to_suppression(row: &libsql::Row) -> Result<SuppressionEntry, DatabaseError> {
    Ok(SuppressionEntry {
        email: row.get(0).map_err(row_err)?,
        reason: parse_field(&row.get::<String>(1).map_err(row_err)?)?,
        source: row.get(2).map_err(row_err)?,
        created_at: parse_datetime(&row.get::<String>(3).map_err(row_err)?),
    })
}

fn row_to_delivery(row: &libsql::Row) -> Result<DeliveryRecord, DatabaseError> {
    let error_class: Option<String> = row.get(9).ok();
    Ok(DeliveryRecord {
        id: parse_uuid(&row.get::<String>(0).map_err(row_err)?)?,
        kind: row.get(1).map_err(row_err)?,
        reference_id: parse_uuid(&row.get::<String>(2).map_err(row_err)?)?,
        lead_id: parse_uuid(&row.get::<String>(3).map_err(row_err)?)?,
        email: row.get(4).map_err(row_err)?,
        account_id: parse_uuid(&row.get::<String>(5).map_err(row_err)?)?,
        account_name: row.get(6).map_err(row_err)?,
        subject: row.get(7).map_err(row_err)?,
        sent: row.get::<i64>(8).unwrap_or(0) != 0,
        error_class: error_class.map(|s| parse_field(&s)).transpose()?,
        error: row.get(10).ok(),
        variation_applied: row.get::<i64>(11).unwrap_or(0) != 0,
        attempted_at: parse_datetime(&row.get::<String>(12).map_err(row_err)?),
    })
}

// ── Connection-level operations ─────────────────────────────────────
//
// Shared by plain calls and by transactions (a `Transaction` derefs to
// `Connection`).

async fn select_transmission(
    conn: &Connection,
    id: Uuid,
) -> Result<Option<Transmission>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TRANSMISSION_COLUMNS} FROM transmissions WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_transmission: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_transmission(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_transmission: {e}"))),
    }
}

/// Lead ids an audience resolves to, suppressed leads excluded.
async fn resolve_audience(
    conn: &Connection,
    audience: &Audience,
) -> Result<Vec<String>, DatabaseError> {
    let base = format!("SELECT l.id FROM leads l WHERE {NOT_SUPPRESSED}");
    let mut rows = match audience {
        Audience::AllLeads => conn.query(&base, ()).await,
        Audience::LeadStatus(status) => {
            conn.query(
                &format!("{base} AND l.status = ?1"),
                params![status.to_string()],
            )
            .await
        }
        Audience::Funnel(funnel_id) => {
            conn.query(
                &format!(
                    "{base} AND l.id IN (SELECT lead_id FROM funnel_enrollments WHERE funnel_id = ?1)"
                ),
                params![funnel_id.to_string()],
            )
            .await
        }
        Audience::Leads(ids) => {
            let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
            let json = serde_json::to_string(&ids)
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            conn.query(
                &format!("{base} AND l.id IN (SELECT value FROM json_each(?1))"),
                params![json],
            )
            .await
        }
    }
    .map_err(|e| DatabaseError::Query(format!("resolve_audience: {e}")))?;

    let mut ids = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("resolve_audience: {e}")))?
    {
        ids.push(row.get::<String>(0).map_err(row_err)?);
    }
    Ok(ids)
}

async fn launch_in(
    conn: &Connection,
    id: Uuid,
    now: DateTime<Utc>,
) -> Result<LaunchResult, DatabaseError> {
    let Some(transmission) = select_transmission(conn, id).await? else {
        return Ok(LaunchResult::NotFound);
    };
    if transmission.status != TransmissionStatus::Draft {
        return Ok(LaunchResult::AlreadyLaunched(transmission));
    }

    let lead_ids = resolve_audience(conn, &transmission.audience).await?;
    let stamp = ts(now);
    let mut inserted: i64 = 0;
    for lead_id in &lead_ids {
        inserted += conn
            .execute(
                "INSERT OR IGNORE INTO transmission_recipients (id, transmission_id, lead_id, state, attempts, created_at, updated_at) VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
                params![Uuid::new_v4().to_string(), id.to_string(), lead_id.clone(), stamp.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("launch_transmission: insert recipient: {e}")))?
            as i64;
    }

    let status = transmission.launch_status(inserted as usize);
    let next_dispatch_at = match transmission.mode {
        TransmissionMode::Scheduled => transmission.scheduled_at,
        TransmissionMode::Immediate => Some(now),
    };
    let completed_at = (status == TransmissionStatus::Completed).then_some(now);

    conn.execute(
        "UPDATE transmissions SET status = ?2, total_recipients = ?3, pending_count = ?3, sent_count = 0, failed_count = 0, next_dispatch_at = ?4, launched_at = ?5, completed_at = ?6, updated_at = ?5 WHERE id = ?1 AND status = 'draft'",
        params![
            id.to_string(),
            status.to_string(),
            inserted,
            opt_ts(next_dispatch_at),
            stamp,
            opt_ts(completed_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("launch_transmission: update: {e}")))?;

    let launched = select_transmission(conn, id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "transmission".into(),
            id: id.to_string(),
        })?;
    Ok(LaunchResult::Launched(launched))
}

async fn read_sending_config(conn: &Connection) -> Result<SendingConfig, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {CONFIG_COLUMNS} FROM sending_config WHERE id = 1"),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_sending_config: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => row_to_sending_config(&row),
        Ok(None) => Err(DatabaseError::NotFound {
            entity: "sending_config".into(),
            id: "1".into(),
        }),
        Err(e) => Err(DatabaseError::Query(format!("get_sending_config: {e}"))),
    }
}

async fn select_accounts(
    conn: &Connection,
    enabled_only: bool,
) -> Result<Vec<SendingAccount>, DatabaseError> {
    let filter = if enabled_only { "WHERE enabled = 1" } else { "" };
    let mut rows = conn
        .query(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM sending_accounts {filter} ORDER BY position, id"),
            (),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("list_sending_accounts: {e}")))?;

    let mut accounts = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match row_to_account(&row) {
            Ok(a) => accounts.push(a),
            Err(e) => warn!("Skipping sending account row: {e}"),
        }
    }
    Ok(accounts)
}

async fn acquire_slot_in(conn: &Connection, now: DateTime<Utc>) -> Result<SendSlot, DatabaseError> {
    let mut config = read_sending_config(conn).await?;
    let accounts = select_accounts(conn, true).await?;
    let decision = config.try_acquire(now, accounts.len());

    conn.execute(
        "UPDATE sending_config SET emails_sent_today = ?1, counter_date = ?2, last_sent_at = ?3, current_account_index = ?4, remaining_chunk = ?5, updated_at = ?6 WHERE id = 1",
        params![
            config.emails_sent_today as i64,
            config.counter_date.format("%Y-%m-%d").to_string(),
            opt_ts(config.last_sent_at),
            config.current_account_index as i64,
            config.remaining_chunk as i64,
            ts(now),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("acquire_send_slot: update: {e}")))?;

    match decision {
        Ok(index) => accounts
            .get(index)
            .cloned()
            .map(SendSlot::Allowed)
            .ok_or_else(|| DatabaseError::Query(format!("acquire_send_slot: no account at {index}"))),
        Err(denied) => Ok(SendSlot::Denied(denied)),
    }
}

const LEADS_BY_EMAIL: &str = "SELECT id FROM leads WHERE email = ?1";

async fn suppress_in(conn: &Connection, entry: &SuppressionEntry) -> Result<bool, DatabaseError> {
    let inserted = conn
        .execute(
            "INSERT OR IGNORE INTO suppressions (email, reason, source, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.email.clone(),
                entry.reason.to_string(),
                entry.source.clone(),
                ts(entry.created_at)
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("suppress: insert: {e}")))?;
    if inserted == 0 {
        return Ok(false);
    }

    let email = entry.email.clone();
    let now = ts(entry.created_at);
    let note = format!("suppressed: {}", entry.reason);

    conn.execute(
        "UPDATE leads SET suppressed = 1, updated_at = ?2 WHERE email = ?1",
        params![email.clone(), now.clone()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("suppress: leads: {e}")))?;

    conn.execute(
        &format!(
            "UPDATE funnel_enrollments SET status = 'skipped', last_error = ?2, updated_at = ?3 WHERE status = 'active' AND lead_id IN ({LEADS_BY_EMAIL})"
        ),
        params![email.clone(), note.clone(), now.clone()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("suppress: enrollments: {e}")))?;

    // Counters first, while the recipients are still pending.
    conn.execute(
        &format!(
            "UPDATE transmissions SET
                failed_count = failed_count + (SELECT COUNT(*) FROM transmission_recipients r WHERE r.transmission_id = transmissions.id AND r.state = 'pending' AND r.lead_id IN ({LEADS_BY_EMAIL})),
                pending_count = pending_count - (SELECT COUNT(*) FROM transmission_recipients r WHERE r.transmission_id = transmissions.id AND r.state = 'pending' AND r.lead_id IN ({LEADS_BY_EMAIL})),
                updated_at = ?2
             WHERE id IN (SELECT transmission_id FROM transmission_recipients WHERE state = 'pending' AND lead_id IN ({LEADS_BY_EMAIL}))"
        ),
        params![email.clone(), now.clone()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("suppress: transmissions: {e}")))?;

    conn.execute(
        &format!(
            "UPDATE transmission_recipients SET state = 'failed', last_error = ?2, updated_at = ?3 WHERE state = 'pending' AND lead_id IN ({LEADS_BY_EMAIL})"
        ),
        params![email.clone(), note.clone(), now.clone()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("suppress: recipients: {e}")))?;

    conn.execute(
        &format!(
            "UPDATE immediate_sends SET status = 'failed', last_error = ?2, updated_at = ?3 WHERE status = 'pending' AND lead_id IN ({LEADS_BY_EMAIL})"
        ),
        params![email, note, now],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("suppress: immediate sends: {e}")))?;

    Ok(true)
}

async fn record_recipient_failure_in(
    conn: &Connection,
    recipient_id: Uuid,
    error: &str,
    kind: FailureKind,
    now: DateTime<Utc>,
) -> Result<RecipientState, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT transmission_id, state, attempts FROM transmission_recipients WHERE id = ?1",
            params![recipient_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_recipient_failure: {e}")))?;
    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("record_recipient_failure: {e}")))?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "transmission_recipient".into(),
            id: recipient_id.to_string(),
        })?;
    let transmission_id: String = row.get(0).map_err(row_err)?;
    let state: RecipientState = parse_field(&row.get::<String>(1).map_err(row_err)?)?;
    let attempts = row.get::<i64>(2).unwrap_or(0) + 1;
    if state != RecipientState::Pending {
        return Ok(state);
    }

    let terminal = match kind {
        FailureKind::Permanent => true,
        FailureKind::Transient { max_attempts } => attempts >= max_attempts as i64,
    };
    let new_state = if terminal {
        RecipientState::Failed
    } else {
        RecipientState::Pending
    };

    conn.execute(
        "UPDATE transmission_recipients SET state = ?2, attempts = ?3, last_error = ?4, updated_at = ?5 WHERE id = ?1 AND state = 'pending'",
        params![
            recipient_id.to_string(),
            new_state.to_string(),
            attempts,
            error,
            ts(now)
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("record_recipient_failure: update: {e}")))?;

    if terminal {
        conn.execute(
            "UPDATE transmissions SET failed_count = failed_count + 1, pending_count = pending_count - 1, updated_at = ?2 WHERE id = ?1",
            params![transmission_id, ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("record_recipient_failure: counters: {e}")))?;
    }
    Ok(new_state)
}

async fn mark_recipient_sent_in(
    conn: &Connection,
    recipient_id: Uuid,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn
        .execute(
            "UPDATE transmission_recipients SET state = 'sent', attempts = attempts + 1, last_error = NULL, sent_at = ?2, updated_at = ?2 WHERE id = ?1 AND state = 'pending'",
            params![recipient_id.to_string(), ts(now)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("mark_recipient_sent: {e}")))?;
    if changed == 0 {
        return Ok(false);
    }
    conn.execute(
        "UPDATE transmissions SET sent_count = sent_count + 1, pending_count = pending_count - 1, updated_at = ?2 WHERE id = (SELECT transmission_id FROM transmission_recipients WHERE id = ?1)",
        params![recipient_id.to_string(), ts(now)],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("mark_recipient_sent: counters: {e}")))?;
    Ok(true)
}

async fn fail_transmission_in(
    conn: &Connection,
    id: Uuid,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let stamp = ts(now);
    let changed = conn
        .execute(
            "UPDATE transmissions SET status = 'failed', failure_reason = ?2, next_dispatch_at = NULL, updated_at = ?3 WHERE id = ?1 AND status NOT IN ('completed', 'failed')",
            params![id.to_string(), reason, stamp.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fail_transmission: {e}")))?;
    if changed == 0 {
        return Ok(false);
    }

    // Remaining recipients can no longer be sent; close them out.
    let closed = conn
        .execute(
            "UPDATE transmission_recipients SET state = 'failed', last_error = ?2, updated_at = ?3 WHERE transmission_id = ?1 AND state = 'pending'",
            params![id.to_string(), format!("transmission failed: {reason}"), stamp.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("fail_transmission: recipients: {e}")))?;
    conn.execute(
        "UPDATE transmissions SET failed_count = failed_count + ?2, pending_count = pending_count - ?2 WHERE id = ?1",
        params![id.to_string(), closed as i64],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("fail_transmission: counters: {e}")))?;
    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let fields = serde_json::to_string(&lead.fields)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                "INSERT INTO leads (id, email, name, status, suppressed, fields, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, CASE WHEN ?5 = 1 OR EXISTS (SELECT 1 FROM suppressions WHERE email = ?2) THEN 1 ELSE 0 END, ?6, ?7, ?8)",
                params![
                    lead.id.to_string(),
                    lead.email.clone(),
                    opt_text(lead.name.as_deref()),
                    lead.status.to_string(),
                    lead.suppressed as i64,
                    fields,
                    ts(lead.created_at),
                    ts(lead.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_lead: {e}")))?;
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn get_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE email = ?1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_lead(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead_by_email: {e}"))),
        }
    }

    async fn update_lead_status(
        &self,
        id: Uuid,
        status: LeadStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE leads SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id.to_string(), status.to_string(), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_lead_status: {e}")))?;
        Ok(n > 0)
    }

    // ── Funnels ─────────────────────────────────────────────────────

    async fn create_funnel(&self, funnel: &Funnel) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "INSERT INTO funnels (id, name, enabled, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    funnel.id.to_string(),
                    funnel.name.clone(),
                    funnel.enabled as i64,
                    ts(funnel.created_at)
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_funnel: {e}")))?;
        Ok(())
    }

    async fn get_funnel(&self, id: Uuid) -> Result<Option<Funnel>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {FUNNEL_COLUMNS} FROM funnels WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_funnel: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_funnel(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_funnel: {e}"))),
        }
    }

    async fn set_funnel_enabled(&self, id: Uuid, enabled: bool) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE funnels SET enabled = ?2 WHERE id = ?1",
                params![id.to_string(), enabled as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_funnel_enabled: {e}")))?;
        Ok(n > 0)
    }

    async fn create_funnel_step(&self, step: &FunnelStep) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let send_time = step.send_time.map(|t| t.format("%H:%M:%S").to_string());
        self.conn()
            .execute(
                &format!("INSERT INTO funnel_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    step.id.to_string(),
                    step.funnel_id.to_string(),
                    step.position,
                    step.delay_value,
                    step.delay_unit.to_string(),
                    opt_text(send_time.as_deref()),
                    step.enabled as i64,
                    step.content.subject.clone(),
                    step.content.html.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_funnel_step: {e}")))?;
        Ok(())
    }

    async fn set_funnel_step_enabled(
        &self,
        funnel_id: Uuid,
        position: i64,
        enabled: bool,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE funnel_steps SET enabled = ?3 WHERE funnel_id = ?1 AND position = ?2",
                params![funnel_id.to_string(), position, enabled as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_funnel_step_enabled: {e}")))?;
        Ok(n > 0)
    }

    async fn list_funnel_steps(&self, funnel_id: Uuid) -> Result<Vec<FunnelStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM funnel_steps WHERE funnel_id = ?1 ORDER BY position"
                ),
                params![funnel_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_funnel_steps: {e}")))?;

        let mut steps = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_step(&row, 0) {
                Ok(s) => steps.push(s),
                Err(e) => warn!("Skipping funnel step row: {e}"),
            }
        }
        Ok(steps)
    }

    async fn enroll_lead(&self, enrollment: &FunnelEnrollment) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                &format!("INSERT OR IGNORE INTO funnel_enrollments ({ENROLLMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    enrollment.id.to_string(),
                    enrollment.lead_id.to_string(),
                    enrollment.funnel_id.to_string(),
                    enrollment.current_step_position,
                    ts(enrollment.next_send_at),
                    enrollment.status.to_string(),
                    enrollment.attempts as i64,
                    opt_text(enrollment.last_error.as_deref()),
                    ts(enrollment.created_at),
                    ts(enrollment.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enroll_lead: {e}")))?;
        Ok(n > 0)
    }

    async fn get_enrollment(&self, id: Uuid) -> Result<Option<FunnelEnrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ENROLLMENT_COLUMNS} FROM funnel_enrollments WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_enrollment: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_enrollment(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_enrollment: {e}"))),
        }
    }

    async fn list_due_enrollments(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DueEnrollment>, DatabaseError> {
        let sql = format!(
            "SELECT {}, {}, {} FROM funnel_enrollments e
             JOIN leads l ON l.id = e.lead_id
             JOIN funnels f ON f.id = e.funnel_id
             JOIN funnel_steps s ON s.funnel_id = e.funnel_id AND s.position = e.current_step_position
             WHERE e.status = 'active' AND e.next_send_at <= ?1
               AND f.enabled = 1 AND s.enabled = 1 AND {NOT_SUPPRESSED}
             ORDER BY e.next_send_at, e.id
             LIMIT ?2",
            prefixed(ENROLLMENT_COLUMNS, "e"),
            prefixed(LEAD_COLUMNS, "l"),
            prefixed(STEP_COLUMNS, "s"),
        );
        let mut rows = self
            .conn()
            .query(&sql, params![ts(now), limit as i64])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_due_enrollments: {e}")))?;

        let mut due = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let mapped = row_to_enrollment(&row, 0).and_then(|enrollment| {
                Ok(DueEnrollment {
                    enrollment,
                    lead: row_to_lead(&row, 10)?,
                    step: row_to_step(&row, 18)?,
                })
            });
            match mapped {
                Ok(d) => due.push(d),
                Err(e) => warn!("Skipping due enrollment row: {e}"),
            }
        }
        Ok(due)
    }

    async fn advance_enrollment(
        &self,
        id: Uuid,
        from_position: i64,
        advance: Advance,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let result = match advance {
            Advance::To {
                position,
                next_send_at,
            } => {
                self.conn()
                    .execute(
                        "UPDATE funnel_enrollments SET current_step_position = ?3, next_send_at = ?4, attempts = 0, last_error = NULL, updated_at = ?5 WHERE id = ?1 AND status = 'active' AND current_step_position = ?2 AND ?3 > current_step_position",
                        params![id.to_string(), from_position, position, ts(next_send_at), ts(now)],
                    )
                    .await
            }
            Advance::Complete => {
                self.conn()
                    .execute(
                        "UPDATE funnel_enrollments SET status = 'completed', attempts = 0, last_error = NULL, updated_at = ?3 WHERE id = ?1 AND status = 'active' AND current_step_position = ?2",
                        params![id.to_string(), from_position, ts(now)],
                    )
                    .await
            }
        };
        let n = result.map_err(|e| DatabaseError::Query(format!("advance_enrollment: {e}")))?;
        Ok(n > 0)
    }

    async fn record_enrollment_failure(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<EnrollmentStatus, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let (permanent, max_attempts) = match kind {
            FailureKind::Permanent => (1_i64, 0_i64),
            FailureKind::Transient { max_attempts } => (0, max_attempts as i64),
        };
        self.conn()
            .execute(
                "UPDATE funnel_enrollments SET attempts = attempts + 1, last_error = ?2, updated_at = ?3,
                    status = CASE WHEN ?4 = 1 OR attempts + 1 >= ?5 THEN 'failed' ELSE status END
                 WHERE id = ?1 AND status = 'active'",
                params![id.to_string(), error, ts(now), permanent, max_attempts],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_enrollment_failure: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM funnel_enrollments WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_enrollment_failure: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => parse_field(&row.get::<String>(0).map_err(row_err)?),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "funnel_enrollment".into(),
                id: id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("record_enrollment_failure: {e}"))),
        }
    }

    async fn finish_enrollment(
        &self,
        id: Uuid,
        status: EnrollmentStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE funnel_enrollments SET status = ?2, last_error = COALESCE(?3, last_error), updated_at = ?4 WHERE id = ?1 AND status = 'active'",
                params![id.to_string(), status.to_string(), opt_text(error), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("finish_enrollment: {e}")))?;
        Ok(n > 0)
    }

    // ── Immediate sends ─────────────────────────────────────────────

    async fn enqueue_immediate_send(&self, send: &ImmediateSend) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!("INSERT INTO immediate_sends ({IMMEDIATE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
                params![
                    send.id.to_string(),
                    send.lead_id.to_string(),
                    send.content.subject.clone(),
                    send.content.html.clone(),
                    send.status.to_string(),
                    send.attempts as i64,
                    opt_text(send.last_error.as_deref()),
                    opt_ts(send.sent_at),
                    ts(send.created_at),
                    ts(send.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_immediate_send: {e}")))?;
        Ok(())
    }

    async fn get_immediate_send(&self, id: Uuid) -> Result<Option<ImmediateSend>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {IMMEDIATE_COLUMNS} FROM immediate_sends WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_immediate_send: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_immediate(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_immediate_send: {e}"))),
        }
    }

    async fn list_pending_immediate_sends(
        &self,
        limit: usize,
    ) -> Result<Vec<PendingImmediate>, DatabaseError> {
        let sql = format!(
            "SELECT {}, {} FROM immediate_sends i
             JOIN leads l ON l.id = i.lead_id
             WHERE i.status = 'pending' AND {NOT_SUPPRESSED}
             ORDER BY i.created_at, i.id
             LIMIT ?1",
            prefixed(IMMEDIATE_COLUMNS, "i"),
            prefixed(LEAD_COLUMNS, "l"),
        );
        let mut rows = self
            .conn()
            .query(&sql, params![limit as i64])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_immediate_sends: {e}")))?;

        let mut pending = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let mapped = row_to_immediate(&row, 0).and_then(|send| {
                Ok(PendingImmediate {
                    send,
                    lead: row_to_lead(&row, 10)?,
                })
            });
            match mapped {
                Ok(p) => pending.push(p),
                Err(e) => warn!("Skipping immediate send row: {e}"),
            }
        }
        Ok(pending)
    }

    async fn mark_immediate_sent(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE immediate_sends SET status = 'sent', attempts = attempts + 1, last_error = NULL, sent_at = ?2, updated_at = ?2 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_immediate_sent: {e}")))?;
        Ok(n > 0)
    }

    async fn record_immediate_failure(
        &self,
        id: Uuid,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<ImmediateStatus, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let (permanent, max_attempts) = match kind {
            FailureKind::Permanent => (1_i64, 0_i64),
            FailureKind::Transient { max_attempts } => (0, max_attempts as i64),
        };
        self.conn()
            .execute(
                "UPDATE immediate_sends SET attempts = attempts + 1, last_error = ?2, updated_at = ?3,
                    status = CASE WHEN ?4 = 1 OR attempts + 1 >= ?5 THEN 'failed' ELSE status END
                 WHERE id = ?1 AND status = 'pending'",
                params![id.to_string(), error, ts(now), permanent, max_attempts],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_immediate_failure: {e}")))?;

        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM immediate_sends WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_immediate_failure: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => parse_field(&row.get::<String>(0).map_err(row_err)?),
            Ok(None) => Err(DatabaseError::NotFound {
                entity: "immediate_send".into(),
                id: id.to_string(),
            }),
            Err(e) => Err(DatabaseError::Query(format!("record_immediate_failure: {e}"))),
        }
    }

    // ── Transmissions ───────────────────────────────────────────────

    async fn create_transmission(&self, transmission: &Transmission) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let audience = serde_json::to_string(&transmission.audience)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn()
            .execute(
                &format!("INSERT INTO transmissions ({TRANSMISSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)"),
                params![
                    transmission.id.to_string(),
                    transmission.name.clone(),
                    transmission.mode.to_string(),
                    opt_ts(transmission.scheduled_at),
                    transmission.min_interval_seconds as i64,
                    transmission.max_interval_seconds as i64,
                    transmission.send_order.to_string(),
                    transmission.enabled as i64,
                    transmission.status.to_string(),
                    audience,
                    transmission.content.subject.clone(),
                    transmission.content.html.clone(),
                    transmission.total_recipients,
                    transmission.sent_count,
                    transmission.failed_count,
                    transmission.pending_count,
                    opt_ts(transmission.next_dispatch_at),
                    opt_text(transmission.failure_reason.as_deref()),
                    opt_ts(transmission.launched_at),
                    opt_ts(transmission.completed_at),
                    ts(transmission.created_at),
                    ts(transmission.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_transmission: {e}")))?;
        Ok(())
    }

    async fn get_transmission(&self, id: Uuid) -> Result<Option<Transmission>, DatabaseError> {
        select_transmission(self.conn(), id).await
    }

    async fn launch_transmission(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<LaunchResult, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin("launch_transmission").await?;
        let result = launch_in(&tx, id, now).await;
        finish(tx, result, "launch_transmission").await
    }

    async fn list_active_transmissions(&self) -> Result<Vec<Transmission>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TRANSMISSION_COLUMNS} FROM transmissions WHERE enabled = 1 AND status IN ('scheduled', 'processing') ORDER BY created_at, id"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_active_transmissions: {e}")))?;

        let mut transmissions = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_transmission(&row) {
                Ok(t) => transmissions.push(t),
                Err(e) => warn!("Skipping transmission row: {e}"),
            }
        }
        Ok(transmissions)
    }

    async fn start_scheduled_transmission(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE transmissions SET status = 'processing', updated_at = ?2 WHERE id = ?1 AND status = 'scheduled' AND enabled = 1 AND scheduled_at <= ?2",
                params![id.to_string(), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("start_scheduled_transmission: {e}")))?;
        Ok(n > 0)
    }

    async fn set_transmission_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Transmission>, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE transmissions SET enabled = ?2,
                    status = CASE
                        WHEN ?2 = 0 AND status = 'processing' THEN 'paused'
                        WHEN ?2 = 1 AND status = 'paused' THEN 'processing'
                        ELSE status END,
                    updated_at = ?3
                 WHERE id = ?1",
                params![id.to_string(), enabled as i64, ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_transmission_enabled: {e}")))?;
        select_transmission(self.conn(), id).await
    }

    async fn set_next_dispatch_at(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE transmissions SET next_dispatch_at = ?2 WHERE id = ?1",
                params![id.to_string(), ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_next_dispatch_at: {e}")))?;
        Ok(())
    }

    async fn list_pending_recipients(
        &self,
        transmission_id: Uuid,
        order: SendOrder,
        limit: usize,
    ) -> Result<Vec<PendingRecipient>, DatabaseError> {
        let direction = match order {
            SendOrder::NewestFirst => "DESC",
            SendOrder::OldestFirst => "ASC",
        };
        let sql = format!(
            "SELECT {}, {} FROM transmission_recipients r
             JOIN leads l ON l.id = r.lead_id
             WHERE r.transmission_id = ?1 AND r.state = 'pending'
             ORDER BY l.created_at {direction}, r.id
             LIMIT ?2",
            prefixed(RECIPIENT_COLUMNS, "r"),
            prefixed(LEAD_COLUMNS, "l"),
        );
        let mut rows = self
            .conn()
            .query(&sql, params![transmission_id.to_string(), limit as i64])
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending_recipients: {e}")))?;

        let mut pending = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let mapped = row_to_recipient(&row, 0).and_then(|recipient| {
                Ok(PendingRecipient {
                    recipient,
                    lead: row_to_lead(&row, 9)?,
                })
            });
            match mapped {
                Ok(p) => pending.push(p),
                Err(e) => warn!("Skipping recipient row: {e}"),
            }
        }
        Ok(pending)
    }

    async fn list_recipients(
        &self,
        transmission_id: Uuid,
    ) -> Result<Vec<TransmissionRecipient>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RECIPIENT_COLUMNS} FROM transmission_recipients WHERE transmission_id = ?1 ORDER BY created_at, id"
                ),
                params![transmission_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recipients: {e}")))?;

        let mut recipients = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_recipient(&row, 0) {
                Ok(r) => recipients.push(r),
                Err(e) => warn!("Skipping recipient row: {e}"),
            }
        }
        Ok(recipients)
    }

    async fn mark_recipient_sent(
        &self,
        recipient_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin("mark_recipient_sent").await?;
        let result = mark_recipient_sent_in(&tx, recipient_id, now).await;
        finish(tx, result, "mark_recipient_sent").await
    }

    async fn record_recipient_failure(
        &self,
        recipient_id: Uuid,
        error: &str,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> Result<RecipientState, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin("record_recipient_failure").await?;
        let result = record_recipient_failure_in(&tx, recipient_id, error, kind, now).await;
        finish(tx, result, "record_recipient_failure").await
    }

    async fn complete_transmission_if_drained(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE transmissions SET status = 'completed', completed_at = ?2, next_dispatch_at = NULL, updated_at = ?2 WHERE id = ?1 AND status = 'processing' AND pending_count <= 0",
                params![id.to_string(), ts(now)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_transmission_if_drained: {e}")))?;
        Ok(n > 0)
    }

    async fn fail_transmission(
        &self,
        id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin("fail_transmission").await?;
        let result = fail_transmission_in(&tx, id, reason, now).await;
        finish(tx, result, "fail_transmission").await
    }

    // ── Sending accounts & limits ───────────────────────────────────

    async fn insert_sending_account(&self, account: &SendingAccount) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!("INSERT INTO sending_accounts ({ACCOUNT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    account.id.to_string(),
                    account.name.clone(),
                    account.from_address.clone(),
                    account.smtp_host.clone(),
                    account.smtp_port as i64,
                    account.smtp_username.clone(),
                    account.smtp_password.expose_secret().to_string(),
                    account.enabled as i64,
                    account.position,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_sending_account: {e}")))?;
        Ok(())
    }

    async fn list_sending_accounts(&self) -> Result<Vec<SendingAccount>, DatabaseError> {
        select_accounts(self.conn(), false).await
    }

    async fn set_sending_account_enabled(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "UPDATE sending_accounts SET enabled = ?2 WHERE id = ?1",
                params![id.to_string(), enabled as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_sending_account_enabled: {e}")))?;
        Ok(n > 0)
    }

    async fn get_sending_config(&self) -> Result<SendingConfig, DatabaseError> {
        read_sending_config(self.conn()).await
    }

    async fn save_sending_settings(
        &self,
        settings: &SendingSettings,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                "UPDATE sending_config SET daily_limit = ?1, min_interval_seconds = ?2, rotation_chunk_size = ?3, remaining_chunk = MIN(remaining_chunk, ?3), updated_at = ?4 WHERE id = 1",
                params![
                    settings.daily_limit as i64,
                    settings.min_interval_seconds as i64,
                    settings.rotation_chunk_size.max(1) as i64,
                    ts(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_sending_settings: {e}")))?;
        debug!(
            daily_limit = settings.daily_limit,
            min_interval_seconds = settings.min_interval_seconds,
            rotation_chunk_size = settings.rotation_chunk_size,
            "Sending settings saved"
        );
        Ok(())
    }

    async fn acquire_send_slot(&self, now: DateTime<Utc>) -> Result<SendSlot, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin("acquire_send_slot").await?;
        let result = acquire_slot_in(&tx, now).await;
        finish(tx, result, "acquire_send_slot").await
    }

    // ── Suppression ─────────────────────────────────────────────────

    async fn is_suppressed(&self, email: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM suppressions WHERE email = ?1 LIMIT 1",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_suppressed: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("is_suppressed: {e}"))),
        }
    }

    async fn suppress(&self, entry: &SuppressionEntry) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self.begin("suppress").await?;
        let result = suppress_in(&tx, entry).await;
        finish(tx, result, "suppress").await
    }

    async fn list_suppressions(&self, limit: usize) -> Result<Vec<SuppressionEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT email, reason, source, created_at FROM suppressions ORDER BY created_at DESC, email LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_suppressions: {e}")))?;

        let mut entries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_suppression(&row) {
                Ok(s) => entries.push(s),
                Err(e) => warn!("Skipping suppression row: {e}"),
            }
        }
        Ok(entries)
    }

    // ── Delivery log ────────────────────────────────────────────────

    async fn record_delivery(&self, record: &DeliveryRecord) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        self.conn()
            .execute(
                &format!("INSERT INTO delivery_log ({DELIVERY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
                params![
                    record.id.to_string(),
                    record.kind.clone(),
                    record.reference_id.to_string(),
                    record.lead_id.to_string(),
                    record.email.clone(),
                    record.account_id.to_string(),
                    record.account_name.clone(),
                    record.subject.clone(),
                    record.sent as i64,
                    opt_text(record.error_class.map(|c| c.as_str())),
                    opt_text(record.error.as_deref()),
                    record.variation_applied as i64,
                    ts(record.attempted_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_delivery: {e}")))?;
        Ok(())
    }

    async fn list_delivery_log(&self, limit: usize) -> Result<Vec<DeliveryRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {DELIVERY_COLUMNS} FROM delivery_log ORDER BY seq DESC LIMIT ?1"),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_delivery_log: {e}")))?;

        let mut records = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_delivery(&row) {
                Ok(r) => records.push(r),
                Err(e) => warn!("Skipping delivery log row: {e}"),
            }
        }
        records.reverse();
        Ok(records)
    }

    // ── Scheduler leases ────────────────────────────────────────────

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "INSERT INTO scheduler_leases (name, holder, acquired_at, expires_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    acquired_at = CASE WHEN scheduler_leases.holder = excluded.holder
                        THEN scheduler_leases.acquired_at ELSE excluded.acquired_at END,
                    holder = excluded.holder,
                    expires_at = excluded.expires_at
                 WHERE scheduler_leases.holder = excluded.holder
                    OR scheduler_leases.expires_at <= excluded.acquired_at",
                params![name, holder, ts(now), ts(now + ttl)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_acquire_lease: {e}")))?;
        Ok(n > 0)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let n = self
            .conn()
            .execute(
                "DELETE FROM scheduler_leases WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_lease: {e}")))?;
        Ok(n > 0)
    }

    async fn get_lease(&self, name: &str) -> Result<Option<LeaseRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name, holder, acquired_at, expires_at FROM scheduler_leases WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lease: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(LeaseRecord {
                name: row.get(0).map_err(row_err)?,
                holder: row.get(1).map_err(row_err)?,
                acquired_at: parse_datetime(&row.get::<String>(2).map_err(row_err)?),
                expires_at: parse_datetime(&row.get::<String>(3).map_err(row_err)?),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lease: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::funnels::model::DelayUnit;
    use crate::suppression::SuppressionReason;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn content() -> SendableContent {
        SendableContent::new("Hello {{first_name}}", "<p>Hi</p>")
    }

    async fn lead(db: &LibSqlBackend, email: &str, created: &str) -> Lead {
        let lead = Lead::new(email, Some("Test Lead")).with_created_at(at(created));
        db.insert_lead(&lead).await.unwrap();
        lead
    }

    async fn funnel_with_steps(db: &LibSqlBackend, delays: &[(i64, DelayUnit)]) -> (Funnel, Vec<FunnelStep>) {
        let funnel = Funnel::new("welcome", Utc::now());
        db.create_funnel(&funnel).await.unwrap();
        let mut steps = Vec::new();
        for (i, (value, unit)) in delays.iter().enumerate() {
            let step = FunnelStep::new(funnel.id, i as i64, *value, *unit, content());
            db.create_funnel_step(&step).await.unwrap();
            steps.push(step);
        }
        (funnel, steps)
    }

    // ── Lead tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_lead() {
        let db = test_db().await;
        let mut lead = Lead::new("Ana@Example.com", Some("Ana Lima"));
        lead.fields = serde_json::json!({"plan": "pro"});
        db.insert_lead(&lead).await.unwrap();

        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.email, "ana@example.com");
        assert_eq!(fetched.name.as_deref(), Some("Ana Lima"));
        assert_eq!(fetched.fields["plan"], "pro");
        assert!(!fetched.suppressed);

        let by_email = db.get_lead_by_email("ana@example.com").await.unwrap();
        assert_eq!(by_email.unwrap().id, lead.id);
        assert!(db.get_lead(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lead_inserted_after_suppression_is_flagged() {
        let db = test_db().await;
        let entry = SuppressionEntry::new("late@example.com", SuppressionReason::Unsubscribe, "test", Utc::now());
        assert!(db.suppress(&entry).await.unwrap());

        let l = lead(&db, "late@example.com", "2026-01-01T00:00:00Z").await;
        assert!(db.get_lead(l.id).await.unwrap().unwrap().suppressed);
    }

    // ── Funnel tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn due_enrollments_respect_time_and_step_flag() {
        let db = test_db().await;
        let (funnel, steps) = funnel_with_steps(&db, &[(2, DelayUnit::Days)]).await;
        let l = lead(&db, "due@example.com", "2026-01-01T00:00:00Z").await;
        let t = at("2026-03-01T10:00:00Z");
        let enrollment = FunnelEnrollment::new(l.id, &steps[0], t).unwrap();
        assert!(db.enroll_lead(&enrollment).await.unwrap());
        assert!(!db.enroll_lead(&FunnelEnrollment::new(l.id, &steps[0], t).unwrap()).await.unwrap());

        let before = t + Duration::days(2) - Duration::seconds(1);
        assert!(db.list_due_enrollments(before, 10).await.unwrap().is_empty());

        let due_at = t + Duration::days(2);
        let due = db.list_due_enrollments(due_at, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].lead.id, l.id);
        assert_eq!(due[0].step.position, 0);

        db.set_funnel_step_enabled(funnel.id, 0, false).await.unwrap();
        assert!(db.list_due_enrollments(due_at, 10).await.unwrap().is_empty());
        db.set_funnel_step_enabled(funnel.id, 0, true).await.unwrap();

        db.set_funnel_enabled(funnel.id, false).await.unwrap();
        assert!(db.list_due_enrollments(due_at, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn advance_is_conditional_on_position() {
        let db = test_db().await;
        let (_, steps) = funnel_with_steps(&db, &[(0, DelayUnit::Minutes), (1, DelayUnit::Hours)]).await;
        let l = lead(&db, "adv@example.com", "2026-01-01T00:00:00Z").await;
        let t = at("2026-03-01T10:00:00Z");
        let enrollment = FunnelEnrollment::new(l.id, &steps[0], t).unwrap();
        db.enroll_lead(&enrollment).await.unwrap();

        let to_next = Advance::To {
            position: 1,
            next_send_at: t + Duration::hours(1),
        };
        assert!(db.advance_enrollment(enrollment.id, 0, to_next, t).await.unwrap());
        // Replayed advance from the old position does nothing.
        assert!(!db.advance_enrollment(enrollment.id, 0, to_next, t).await.unwrap());

        assert!(db.advance_enrollment(enrollment.id, 1, Advance::Complete, t).await.unwrap());
        let stored = db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Completed);
        assert_eq!(stored.current_step_position, 1);
    }

    #[tokio::test]
    async fn enrollment_failure_is_bounded() {
        let db = test_db().await;
        let (_, steps) = funnel_with_steps(&db, &[(0, DelayUnit::Minutes)]).await;
        let l = lead(&db, "retry@example.com", "2026-01-01T00:00:00Z").await;
        let enrollment = FunnelEnrollment::new(l.id, &steps[0], Utc::now()).unwrap();
        db.enroll_lead(&enrollment).await.unwrap();

        let kind = FailureKind::Transient { max_attempts: 3 };
        for _ in 0..2 {
            let status = db
                .record_enrollment_failure(enrollment.id, "421 try later", kind, Utc::now())
                .await
                .unwrap();
            assert_eq!(status, EnrollmentStatus::Active);
        }
        let status = db
            .record_enrollment_failure(enrollment.id, "421 try later", kind, Utc::now())
            .await
            .unwrap();
        assert_eq!(status, EnrollmentStatus::Failed);
        let stored = db.get_enrollment(enrollment.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
        assert_eq!(stored.last_error.as_deref(), Some("421 try later"));
    }

    // ── Transmission tests ──────────────────────────────────────────

    #[tokio::test]
    async fn launch_snapshots_audience_once() {
        let db = test_db().await;
        lead(&db, "a@example.com", "2026-01-01T00:00:00Z").await;
        lead(&db, "b@example.com", "2026-01-02T00:00:00Z").await;
        let blocked = lead(&db, "c@example.com", "2026-01-03T00:00:00Z").await;
        db.suppress(&SuppressionEntry::new(&blocked.email, SuppressionReason::HardBounce, "test", Utc::now()))
            .await
            .unwrap();

        let t = Transmission::draft("launch", content(), Audience::AllLeads);
        db.create_transmission(&t).await.unwrap();

        let now = at("2026-03-01T10:00:00Z");
        let launched = match db.launch_transmission(t.id, now).await.unwrap() {
            LaunchResult::Launched(t) => t,
            other => panic!("expected launch, got {other:?}"),
        };
        assert_eq!(launched.status, TransmissionStatus::Processing);
        assert_eq!(launched.total_recipients, 2);
        assert_eq!(launched.pending_count, 2);
        assert_eq!(launched.next_dispatch_at, Some(now));

        // Leads created after launch are not picked up by a second launch.
        lead(&db, "d@example.com", "2026-01-04T00:00:00Z").await;
        assert!(matches!(
            db.launch_transmission(t.id, now).await.unwrap(),
            LaunchResult::AlreadyLaunched(_)
        ));
        assert_eq!(db.list_recipients(t.id).await.unwrap().len(), 2);
        assert!(matches!(
            db.launch_transmission(Uuid::new_v4(), now).await.unwrap(),
            LaunchResult::NotFound
        ));
    }

    #[tokio::test]
    async fn launch_with_explicit_leads_and_status() {
        let db = test_db().await;
        let a = lead(&db, "a@example.com", "2026-01-01T00:00:00Z").await;
        let b = lead(&db, "b@example.com", "2026-01-02T00:00:00Z").await;
        db.update_lead_status(b.id, LeadStatus::Abandoned, Utc::now()).await.unwrap();

        let explicit = Transmission::draft("explicit", content(), Audience::Leads(vec![a.id]));
        db.create_transmission(&explicit).await.unwrap();
        let by_status = Transmission::draft(
            "abandoned",
            content(),
            Audience::LeadStatus(LeadStatus::Abandoned),
        );
        db.create_transmission(&by_status).await.unwrap();

        db.launch_transmission(explicit.id, Utc::now()).await.unwrap();
        db.launch_transmission(by_status.id, Utc::now()).await.unwrap();

        let r1 = db.list_recipients(explicit.id).await.unwrap();
        assert_eq!(r1.len(), 1);
        assert_eq!(r1[0].lead_id, a.id);
        let r2 = db.list_recipients(by_status.id).await.unwrap();
        assert_eq!(r2.len(), 1);
        assert_eq!(r2[0].lead_id, b.id);
    }

    #[tokio::test]
    async fn empty_audience_completes_on_launch() {
        let db = test_db().await;
        let t = Transmission::draft("empty", content(), Audience::Leads(vec![]));
        db.create_transmission(&t).await.unwrap();
        let LaunchResult::Launched(launched) = db.launch_transmission(t.id, Utc::now()).await.unwrap() else {
            panic!("expected launch");
        };
        assert_eq!(launched.status, TransmissionStatus::Completed);
        assert!(launched.completed_at.is_some());
    }

    #[tokio::test]
    async fn pending_recipients_in_send_order() {
        let db = test_db().await;
        let old = lead(&db, "old@example.com", "2026-01-01T00:00:00Z").await;
        let mid = lead(&db, "mid@example.com", "2026-01-02T00:00:00Z").await;
        let new = lead(&db, "new@example.com", "2026-01-03T00:00:00Z").await;
        let t = Transmission::draft("order", content(), Audience::AllLeads);
        db.create_transmission(&t).await.unwrap();
        db.launch_transmission(t.id, Utc::now()).await.unwrap();

        let oldest: Vec<Uuid> = db
            .list_pending_recipients(t.id, SendOrder::OldestFirst, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.lead.id)
            .collect();
        assert_eq!(oldest, vec![old.id, mid.id, new.id]);

        let newest: Vec<Uuid> = db
            .list_pending_recipients(t.id, SendOrder::NewestFirst, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.lead.id)
            .collect();
        assert_eq!(newest, vec![new.id, mid.id]);
    }

    #[tokio::test]
    async fn recipient_outcomes_move_counters_once() {
        let db = test_db().await;
        lead(&db, "a@example.com", "2026-01-01T00:00:00Z").await;
        lead(&db, "b@example.com", "2026-01-02T00:00:00Z").await;
        let t = Transmission::draft("counters", content(), Audience::AllLeads);
        db.create_transmission(&t).await.unwrap();
        db.launch_transmission(t.id, Utc::now()).await.unwrap();

        let pending = db.list_pending_recipients(t.id, SendOrder::OldestFirst, 10).await.unwrap();
        let (first, second) = (pending[0].recipient.id, pending[1].recipient.id);

        assert!(db.mark_recipient_sent(first, Utc::now()).await.unwrap());
        assert!(!db.mark_recipient_sent(first, Utc::now()).await.unwrap());

        let state = db
            .record_recipient_failure(second, "550 no such user", FailureKind::Permanent, Utc::now())
            .await
            .unwrap();
        assert_eq!(state, RecipientState::Failed);

        let stored = db.get_transmission(t.id).await.unwrap().unwrap();
        assert_eq!((stored.sent_count, stored.failed_count, stored.pending_count), (1, 1, 0));
        assert!(db.complete_transmission_if_drained(t.id, Utc::now()).await.unwrap());
        let stored = db.get_transmission(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransmissionStatus::Completed);
    }

    #[tokio::test]
    async fn enabled_flag_pauses_processing() {
        let db = test_db().await;
        lead(&db, "a@example.com", "2026-01-01T00:00:00Z").await;
        let t = Transmission::draft("pause", content(), Audience::AllLeads);
        db.create_transmission(&t).await.unwrap();
        db.launch_transmission(t.id, Utc::now()).await.unwrap();

        let paused = db.set_transmission_enabled(t.id, false, Utc::now()).await.unwrap().unwrap();
        assert_eq!(paused.status, TransmissionStatus::Paused);
        assert!(db.list_active_transmissions().await.unwrap().is_empty());

        let resumed = db.set_transmission_enabled(t.id, true, Utc::now()).await.unwrap().unwrap();
        assert_eq!(resumed.status, TransmissionStatus::Processing);
        assert_eq!(db.list_active_transmissions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failing_transmission_closes_pending_recipients() {
        let db = test_db().await;
        lead(&db, "a@example.com", "2026-01-01T00:00:00Z").await;
        lead(&db, "b@example.com", "2026-01-02T00:00:00Z").await;
        let t = Transmission::draft("doomed", content(), Audience::AllLeads);
        db.create_transmission(&t).await.unwrap();
        db.launch_transmission(t.id, Utc::now()).await.unwrap();

        assert!(db.fail_transmission(t.id, "template missing", Utc::now()).await.unwrap());
        assert!(!db.fail_transmission(t.id, "again", Utc::now()).await.unwrap());
        let stored = db.get_transmission(t.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransmissionStatus::Failed);
        assert_eq!((stored.failed_count, stored.pending_count), (2, 0));
        assert_eq!(stored.failure_reason.as_deref(), Some("template missing"));
    }

    // ── Suppression tests ───────────────────────────────────────────

    #[tokio::test]
    async fn suppress_retires_pending_work() {
        let db = test_db().await;
        let (_, steps) = funnel_with_steps(&db, &[(0, DelayUnit::Minutes)]).await;
        let target = lead(&db, "gone@example.com", "2026-01-01T00:00:00Z").await;
        let other = lead(&db, "stay@example.com", "2026-01-02T00:00:00Z").await;

        let enrollment = FunnelEnrollment::new(target.id, &steps[0], Utc::now()).unwrap();
        db.enroll_lead(&enrollment).await.unwrap();
        let queued = ImmediateSend::new(target.id, content(), Utc::now());
        db.enqueue_immediate_send(&queued).await.unwrap();
        let t = Transmission::draft("t", content(), Audience::AllLeads);
        db.create_transmission(&t).await.unwrap();
        db.launch_transmission(t.id, Utc::now()).await.unwrap();

        let entry = SuppressionEntry::new("GONE@example.com", SuppressionReason::HardBounce, "test", Utc::now());
        assert!(db.suppress(&entry).await.unwrap());
        assert!(!db.suppress(&entry).await.unwrap());

        assert!(db.is_suppressed("gone@example.com").await.unwrap());
        assert!(db.get_lead(target.id).await.unwrap().unwrap().suppressed);
        assert!(!db.get_lead(other.id).await.unwrap().unwrap().suppressed);
        assert_eq!(
            db.get_enrollment(enrollment.id).await.unwrap().unwrap().status,
            EnrollmentStatus::Skipped
        );
        assert_eq!(
            db.get_immediate_send(queued.id).await.unwrap().unwrap().status,
            ImmediateStatus::Failed
        );
        let stored = db.get_transmission(t.id).await.unwrap().unwrap();
        assert_eq!((stored.pending_count, stored.failed_count), (1, 1));
        let pending = db.list_pending_recipients(t.id, SendOrder::OldestFirst, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].lead.id, other.id);
    }

    #[tokio::test]
    async fn lead_status_update_uses_the_given_time() {
        let db = test_db().await;
        let l = lead(&db, "status@example.com", "2026-01-01T00:00:00Z").await;
        let when = at("2031-07-04T12:00:00Z");
        assert!(db.update_lead_status(l.id, LeadStatus::Abandoned, when).await.unwrap());

        let stored = db.get_lead(l.id).await.unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Abandoned);
        assert_eq!(stored.updated_at, when);
    }

    // ── Sending tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn saving_settings_uses_the_given_time() {
        let db = test_db().await;
        let when = at("2031-07-04T12:00:00Z");
        db.save_sending_settings(&SendingSettings::default(), when).await.unwrap();

        let mut rows = db
            .conn()
            .query("SELECT updated_at FROM sending_config WHERE id = 1", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let stamped: String = row.get(0).unwrap();
        assert_eq!(parse_datetime(&stamped), when);
    }

    #[tokio::test]
    async fn sending_config_persists_across_acquires() {
        let db = test_db().await;
        db.save_sending_settings(&SendingSettings {
            daily_limit: 2,
            min_interval_seconds: 0,
            rotation_chunk_size: 1,
        }, Utc::now())
        .await
        .unwrap();
        let a = SendingAccount::new("a", "a@example.com", "smtp.example.com", 0)
            .with_credentials("a-user", "a-pass");
        db.insert_sending_account(&a).await.unwrap();

        let now = at("2026-03-01T10:00:00Z");
        let slot = db.acquire_send_slot(now).await.unwrap();
        let granted = slot.account().unwrap();
        assert_eq!(granted.smtp_username, "a-user");
        assert_eq!(granted.smtp_password.expose_secret(), "a-pass");
        assert!(db.acquire_send_slot(now).await.unwrap().is_allowed());
        assert!(!db.acquire_send_slot(now).await.unwrap().is_allowed());

        let config = db.get_sending_config().await.unwrap();
        assert_eq!(config.emails_sent_today, 2);
        assert_eq!(config.last_sent_at, Some(now));
    }

    #[tokio::test]
    async fn disabled_accounts_are_skipped() {
        let db = test_db().await;
        let a = SendingAccount::new("a", "a@example.com", "smtp.example.com", 0);
        let b = SendingAccount::new("b", "b@example.com", "smtp.example.com", 1);
        db.insert_sending_account(&a).await.unwrap();
        db.insert_sending_account(&b).await.unwrap();
        db.set_sending_account_enabled(a.id, false).await.unwrap();
        db.save_sending_settings(&SendingSettings {
            daily_limit: 10,
            min_interval_seconds: 0,
            rotation_chunk_size: 1,
        }, Utc::now())
        .await
        .unwrap();

        for _ in 0..3 {
            let slot = db.acquire_send_slot(Utc::now()).await.unwrap();
            assert_eq!(slot.account().unwrap().name, "b");
        }
        assert_eq!(db.list_sending_accounts().await.unwrap().len(), 2);
    }

    // ── Delivery log & lease tests ──────────────────────────────────

    #[tokio::test]
    async fn delivery_log_keeps_order() {
        let db = test_db().await;
        for i in 0..3 {
            let record = DeliveryRecord {
                id: Uuid::new_v4(),
                kind: "immediate".into(),
                reference_id: Uuid::new_v4(),
                lead_id: Uuid::new_v4(),
                email: format!("r{i}@example.com"),
                account_id: Uuid::new_v4(),
                account_name: "a".into(),
                subject: "s".into(),
                sent: i != 1,
                error_class: (i == 1).then_some(crate::error::ErrorClass::Transient),
                error: (i == 1).then(|| "421".to_string()),
                variation_applied: false,
                attempted_at: Utc::now(),
            };
            db.record_delivery(&record).await.unwrap();
        }
        let log = db.list_delivery_log(2).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].email, "r1@example.com");
        assert_eq!(log[0].error_class, Some(crate::error::ErrorClass::Transient));
        assert_eq!(log[1].email, "r2@example.com");
    }

    #[tokio::test]
    async fn lease_exclusive_until_expiry() {
        let db = test_db().await;
        let t0 = at("2026-03-01T10:00:00Z");
        let ttl = Duration::seconds(30);

        assert!(db.try_acquire_lease("schedulers", "a", t0, ttl).await.unwrap());
        assert!(!db.try_acquire_lease("schedulers", "b", t0 + Duration::seconds(10), ttl).await.unwrap());
        // Renewal by the holder keeps the original acquisition time.
        assert!(db.try_acquire_lease("schedulers", "a", t0 + Duration::seconds(20), ttl).await.unwrap());
        let lease = db.get_lease("schedulers").await.unwrap().unwrap();
        assert_eq!(lease.acquired_at, t0);
        assert_eq!(lease.expires_at, t0 + Duration::seconds(50));

        assert!(db.try_acquire_lease("schedulers", "b", t0 + Duration::seconds(50), ttl).await.unwrap());
        assert!(!db.release_lease("schedulers", "a").await.unwrap());
        assert!(db.release_lease("schedulers", "b").await.unwrap());
        assert!(db.get_lease("schedulers").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn local_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outreach.db");
        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            lead(&db, "disk@example.com", "2026-01-01T00:00:00Z").await.id
        };
        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(reopened.get_lead(id).await.unwrap().is_some());
    }
}
