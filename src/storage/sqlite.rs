//! SQLite Repository
//!
//! `Repository` implementation over a single rusqlite connection guarded by a
//! mutex. Attribute tables are created from the data-source registry, one
//! table per source keyed by `(user_id, timestamp)`.

use crate::sources::{format_number, AttributeId, AttributeValue, Column, ColumnKind, DataSource};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::repository::Repository;
use crate::storage::types::*;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row, ToSql};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Maximum number of user ids bound into one IN list
const CHUNK: usize = 500;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS available_data_sources (
        data_source_id INTEGER PRIMARY KEY,
        data_source_name TEXT NOT NULL UNIQUE
    );
    CREATE TABLE IF NOT EXISTS registered_data_sources (
        user_id INTEGER NOT NULL,
        data_source_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        PRIMARY KEY (user_id, data_source_id)
    );
    CREATE TABLE IF NOT EXISTS privacy_settings (
        user_id INTEGER NOT NULL,
        data_source_id INTEGER NOT NULL,
        attribute TEXT NOT NULL,
        level INTEGER NOT NULL,
        explicit_consent INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, data_source_id, attribute)
    );
    CREATE TABLE IF NOT EXISTS upload_granularities (
        user_id INTEGER NOT NULL,
        data_source_id INTEGER NOT NULL,
        timestamp INTEGER NOT NULL,
        interval INTEGER NOT NULL,
        PRIMARY KEY (user_id, data_source_id, timestamp)
    );
    CREATE TABLE IF NOT EXISTS queries (
        processor_id INTEGER NOT NULL,
        query_id INTEGER NOT NULL,
        query TEXT NOT NULL,
        price REAL NOT NULL,
        amount INTEGER NOT NULL,
        interval_start INTEGER NOT NULL,
        interval_finish INTEGER NOT NULL,
        consent_start INTEGER NOT NULL,
        consent_finish INTEGER NOT NULL,
        granularity INTEGER,
        max_privacy INTEGER NOT NULL,
        state TEXT NOT NULL,
        result TEXT,
        title TEXT NOT NULL DEFAULT '',
        description TEXT NOT NULL DEFAULT '',
        goal_description TEXT NOT NULL DEFAULT '',
        thumbnail_url TEXT NOT NULL DEFAULT '',
        used_data_types TEXT NOT NULL DEFAULT '[]',
        PRIMARY KEY (processor_id, query_id)
    );
    CREATE INDEX IF NOT EXISTS idx_queries_due ON queries(state, consent_finish);
    CREATE TABLE IF NOT EXISTS query_users (
        user_id INTEGER NOT NULL,
        processor_id INTEGER NOT NULL,
        query_id INTEGER NOT NULL,
        consent TEXT NOT NULL,
        settings TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (user_id, processor_id, query_id)
    );
    CREATE INDEX IF NOT EXISTS idx_query_users_query ON query_users(processor_id, query_id);
    CREATE TABLE IF NOT EXISTS pin_queries (
        processor_id INTEGER NOT NULL,
        query_id INTEGER NOT NULL,
        query TEXT NOT NULL,
        pin INTEGER NOT NULL,
        session_id INTEGER NOT NULL,
        consent_start INTEGER NOT NULL,
        consent_finish INTEGER NOT NULL,
        state TEXT NOT NULL,
        result TEXT,
        PRIMARY KEY (processor_id, query_id)
    );
    CREATE INDEX IF NOT EXISTS idx_pin_queries_pin ON pin_queries(pin);
    CREATE TABLE IF NOT EXISTS pin_query_users (
        user_id INTEGER NOT NULL,
        processor_id INTEGER NOT NULL,
        query_id INTEGER NOT NULL,
        consent TEXT NOT NULL,
        settings TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (user_id, processor_id, query_id)
    );
";

const QUERY_COLUMNS: &str = "processor_id, query_id, query, price, amount, interval_start, \
    interval_finish, consent_start, consent_finish, granularity, max_privacy, state, result, \
    title, description, goal_description, thumbnail_url, used_data_types";

const PIN_QUERY_COLUMNS: &str = "processor_id, query_id, query, pin, session_id, \
    consent_start, consent_finish, state, result";

impl ToSql for UserId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for UserId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(UserId)
    }
}

impl ToSql for QueryState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for QueryState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: ParseStateError| FromSqlError::Other(Box::new(e)))
    }
}

impl ToSql for ConsentState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ConsentState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: ParseStateError| FromSqlError::Other(Box::new(e)))
    }
}

/// Read a stored attribute value according to its column kind
fn read_column(kind: ColumnKind, value: ValueRef<'_>) -> Option<AttributeValue> {
    match (kind, value) {
        (_, ValueRef::Null) | (_, ValueRef::Blob(_)) => None,
        (ColumnKind::Text, ValueRef::Text(t)) => {
            Some(AttributeValue::Text(String::from_utf8_lossy(t).into_owned()))
        }
        (ColumnKind::Text, ValueRef::Integer(i)) => Some(AttributeValue::Text(i.to_string())),
        (ColumnKind::Text, ValueRef::Real(f)) => Some(AttributeValue::Text(format_number(f))),
        (_, ValueRef::Integer(i)) => Some(AttributeValue::Number(i as f64)),
        (_, ValueRef::Real(f)) => Some(AttributeValue::Number(f)),
        (_, ValueRef::Text(t)) => std::str::from_utf8(t)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .map(AttributeValue::Number),
    }
}

fn write_column(kind: ColumnKind, value: &AttributeValue) -> Value {
    match (kind, value) {
        (ColumnKind::Real, AttributeValue::Number(n)) => Value::Real(*n),
        (ColumnKind::Integer | ColumnKind::Bool, AttributeValue::Number(n)) => {
            Value::Integer(*n as i64)
        }
        (_, other) => Value::Text(other.to_string()),
    }
}

fn column_of(attr: &AttributeId) -> StorageResult<&'static Column> {
    attr.column()
        .ok_or_else(|| StorageError::UnknownColumn(attr.to_string()))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn conversion_error(idx: usize, err: serde_json::Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn query_from_row(row: &Row<'_>) -> rusqlite::Result<QueryRecord> {
    let used_data_types: String = row.get(17)?;
    Ok(QueryRecord {
        processor_id: row.get(0)?,
        query_id: row.get(1)?,
        query: row.get(2)?,
        price: row.get(3)?,
        amount: row.get(4)?,
        interval_start: row.get(5)?,
        interval_finish: row.get(6)?,
        consent_start: row.get(7)?,
        consent_finish: row.get(8)?,
        granularity: row.get(9)?,
        max_privacy: row.get(10)?,
        state: row.get(11)?,
        result: row.get(12)?,
        title: row.get(13)?,
        description: row.get(14)?,
        goal_description: row.get(15)?,
        thumbnail_url: row.get(16)?,
        used_data_types: serde_json::from_str(&used_data_types)
            .map_err(|e| conversion_error(17, e))?,
    })
}

fn pin_query_from_row(row: &Row<'_>) -> rusqlite::Result<PinQueryRecord> {
    Ok(PinQueryRecord {
        processor_id: row.get(0)?,
        query_id: row.get(1)?,
        query: row.get(2)?,
        pin: row.get(3)?,
        session_id: row.get(4)?,
        consent_start: row.get(5)?,
        consent_finish: row.get(6)?,
        state: row.get(7)?,
        result: row.get(8)?,
    })
}

fn query_user_from_row(row: &Row<'_>) -> rusqlite::Result<QueryUser> {
    Ok(QueryUser {
        user_id: row.get(0)?,
        key: QueryKey::new(row.get(1)?, row.get(2)?),
        consent: row.get(3)?,
        settings: row.get(4)?,
    })
}

/// SQLite-backed repository
pub struct SqliteRepository {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteRepository {
    /// Create or open a database file
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            ",
        )?;

        let repo = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        repo.migrate()?;
        Ok(repo)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> StorageResult<Self> {
        let repo = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        repo.migrate()?;
        Ok(repo)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::Lock(e.to_string()))
    }

    /// Run raw SQL, for fault injection in tests
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> StorageResult<()> {
        self.lock()?.execute_batch(sql)?;
        Ok(())
    }

    fn migrate(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA)?;
        for source in DataSource::ALL {
            conn.execute(&source.descriptor().create_table_sql(), [])?;
        }
        Ok(())
    }

    /// Make every registry source available, numbering them from 1.
    /// Returns the number of sources newly installed.
    pub fn install_data_sources(&self) -> StorageResult<usize> {
        let mut installed = 0;
        for (i, source) in DataSource::ALL.iter().enumerate() {
            if self.data_source_id(*source)?.is_none() {
                self.add_available_data_source(*source, i as i64 + 1)?;
                tracing::info!(source = %source, id = i + 1, "Installed data source");
                installed += 1;
            }
        }
        Ok(installed)
    }

    pub fn add_available_data_source(
        &self,
        source: DataSource,
        id: DataSourceId,
    ) -> StorageResult<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO available_data_sources (data_source_id, data_source_name)
             VALUES (?1, ?2)",
            params![id, source.table_name()],
        )?;
        Ok(())
    }

    pub fn register_data_source(
        &self,
        user: UserId,
        source_id: DataSourceId,
        timestamp: i64,
    ) -> StorageResult<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO registered_data_sources (user_id, data_source_id, timestamp)
             VALUES (?1, ?2, ?3)",
            params![user, source_id, timestamp],
        )?;
        Ok(())
    }

    pub fn set_privacy_setting(&self, setting: &PrivacySetting) -> StorageResult<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO privacy_settings
                (user_id, data_source_id, attribute, level, explicit_consent)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                setting.user_id,
                setting.data_source_id,
                setting.attribute,
                setting.level,
                setting.explicit_consent
            ],
        )?;
        Ok(())
    }

    pub fn record_granularity(&self, record: &UploadGranularityRecord) -> StorageResult<()> {
        self.lock()?.execute(
            "INSERT OR REPLACE INTO upload_granularities (user_id, data_source_id, timestamp, interval)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.user_id,
                record.data_source_id,
                record.timestamp,
                record.interval
            ],
        )?;
        Ok(())
    }

    /// Store one row of raw attribute values
    pub fn insert_sample(
        &self,
        source: DataSource,
        user: UserId,
        timestamp: i64,
        values: &[(&str, AttributeValue)],
    ) -> StorageResult<()> {
        let mut names = Vec::with_capacity(values.len());
        let mut bound = vec![Value::Integer(user.0), Value::Integer(timestamp)];
        for (name, value) in values {
            let column = source
                .column(name)
                .ok_or_else(|| StorageError::UnknownColumn(format!("{}.{}", source, name)))?;
            names.push(column.name);
            bound.push(write_column(column.kind, value));
        }

        let sql = format!(
            "INSERT OR REPLACE INTO {} (user_id, timestamp{}{}) VALUES ({})",
            source.table_name(),
            if names.is_empty() { "" } else { ", " },
            names.join(", "),
            placeholders(bound.len())
        );
        self.lock()?.execute(&sql, params_from_iter(bound.iter()))?;
        Ok(())
    }

    /// Run a query once per chunk of user ids. `sql_for` receives the IN list
    /// placeholders; `leading` parameters are bound before the user ids.
    fn query_chunked<T>(
        &self,
        users: &[UserId],
        leading: &[i64],
        sql_for: impl Fn(&str) -> String,
        map: impl Fn(&Row<'_>) -> rusqlite::Result<T>,
    ) -> StorageResult<Vec<T>> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        for chunk in users.chunks(CHUNK) {
            let sql = sql_for(&placeholders(chunk.len()));
            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<i64> = leading
                .iter()
                .copied()
                .chain(chunk.iter().map(|u| u.0))
                .collect();
            let rows = stmt.query_map(params_from_iter(params.iter()), &map)?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    fn query_users_in(
        &self,
        table: &str,
        key: QueryKey,
        consent: Option<ConsentState>,
    ) -> StorageResult<Vec<QueryUser>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT user_id, processor_id, query_id, consent, settings FROM {}
             WHERE processor_id = ?1 AND query_id = ?2 AND (?3 IS NULL OR consent = ?3)
             ORDER BY user_id",
            table
        ))?;
        let rows = stmt.query_map(
            params![key.processor_id, key.query_id, consent],
            query_user_from_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn query_user_in(
        &self,
        table: &str,
        user: UserId,
        key: QueryKey,
    ) -> StorageResult<Option<QueryUser>> {
        let conn = self.lock()?;
        let user = conn
            .query_row(
                &format!(
                    "SELECT user_id, processor_id, query_id, consent, settings FROM {}
                     WHERE user_id = ?1 AND processor_id = ?2 AND query_id = ?3",
                    table
                ),
                params![user, key.processor_id, key.query_id],
                query_user_from_row,
            )
            .optional()?;
        Ok(user)
    }
}

impl Repository for SqliteRepository {
    fn data_source_id(&self, source: DataSource) -> StorageResult<Option<DataSourceId>> {
        let conn = self.lock()?;
        let id = conn
            .query_row(
                "SELECT data_source_id FROM available_data_sources WHERE data_source_name = ?1",
                params![source.table_name()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    fn registered_users(
        &self,
        source_id: DataSourceId,
        not_after: i64,
    ) -> StorageResult<BTreeSet<UserId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id FROM registered_data_sources
             WHERE data_source_id = ?1 AND timestamp <= ?2",
        )?;
        let rows = stmt.query_map(params![source_id, not_after], |row| row.get(0))?;
        Ok(rows.collect::<Result<BTreeSet<UserId>, _>>()?)
    }

    fn privacy_settings(
        &self,
        source_id: DataSourceId,
        attribute: &str,
    ) -> StorageResult<Vec<PrivacySetting>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT user_id, data_source_id, attribute, level, explicit_consent
             FROM privacy_settings WHERE data_source_id = ?1 AND attribute = ?2
             ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![source_id, attribute], |row| {
            Ok(PrivacySetting {
                user_id: row.get(0)?,
                data_source_id: row.get(1)?,
                attribute: row.get(2)?,
                level: row.get(3)?,
                explicit_consent: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn granularity_history(
        &self,
        source_id: DataSourceId,
        users: &[UserId],
        until: i64,
    ) -> StorageResult<Vec<UploadGranularityRecord>> {
        self.query_chunked(
            users,
            &[source_id, until],
            |list| {
                format!(
                    "SELECT user_id, data_source_id, timestamp, interval FROM upload_granularities
                     WHERE data_source_id = ? AND timestamp <= ? AND user_id IN ({})
                     ORDER BY user_id, timestamp",
                    list
                )
            },
            |row| {
                Ok(UploadGranularityRecord {
                    user_id: row.get(0)?,
                    data_source_id: row.get(1)?,
                    timestamp: row.get(2)?,
                    interval: row.get(3)?,
                })
            },
        )
    }

    fn attribute_values(
        &self,
        attr: &AttributeId,
        users: &[UserId],
    ) -> StorageResult<Vec<(UserId, AttributeValue)>> {
        let column = column_of(attr)?;
        let table = attr.source.table_name();
        let rows = self.query_chunked(
            users,
            &[],
            |list| {
                format!(
                    "SELECT user_id, {col} FROM {table}
                     WHERE {col} IS NOT NULL AND user_id IN ({list})
                     ORDER BY user_id, timestamp",
                    col = column.name,
                    table = table,
                    list = list
                )
            },
            |row| Ok((row.get::<_, UserId>(0)?, read_column(column.kind, row.get_ref(1)?))),
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|(user, value)| value.map(|v| (user, v)))
            .collect())
    }

    fn samples(
        &self,
        attr: &AttributeId,
        users: &[UserId],
        start: i64,
        finish: i64,
    ) -> StorageResult<Vec<(UserId, Sample)>> {
        let column = column_of(attr)?;
        let table = attr.source.table_name();
        let rows = self.query_chunked(
            users,
            &[start, finish],
            |list| {
                format!(
                    "SELECT user_id, timestamp, {col} FROM {table}
                     WHERE {col} IS NOT NULL AND timestamp >= ? AND timestamp < ?
                       AND user_id IN ({list})
                     ORDER BY user_id, timestamp",
                    col = column.name,
                    table = table,
                    list = list
                )
            },
            |row| {
                Ok((
                    row.get::<_, UserId>(0)?,
                    row.get::<_, i64>(1)?,
                    read_column(column.kind, row.get_ref(2)?),
                ))
            },
        )?;

        let mut samples: Vec<(UserId, Sample)> = rows
            .into_iter()
            .filter_map(|(user, ts, value)| value.map(|v| (user, Sample::new(ts, v))))
            .collect();
        samples.sort_by_key(|(user, sample)| (*user, sample.timestamp));
        Ok(samples)
    }

    fn latest_values(
        &self,
        attr: &AttributeId,
        users: &[UserId],
    ) -> StorageResult<BTreeMap<UserId, AttributeValue>> {
        let column = column_of(attr)?;
        let table = attr.source.table_name();
        let rows = self.query_chunked(
            users,
            &[],
            |list| {
                format!(
                    "SELECT user_id, {col} FROM {table}
                     WHERE {col} IS NOT NULL AND user_id IN ({list})
                     ORDER BY user_id, timestamp DESC",
                    col = column.name,
                    table = table,
                    list = list
                )
            },
            |row| Ok((row.get::<_, UserId>(0)?, read_column(column.kind, row.get_ref(1)?))),
        )?;

        let mut latest = BTreeMap::new();
        for (user, value) in rows {
            if let Some(value) = value {
                latest.entry(user).or_insert(value);
            }
        }
        Ok(latest)
    }

    fn insert_query(&self, query: &QueryRecord) -> StorageResult<bool> {
        let used_data_types = serde_json::to_string(&query.used_data_types)?;
        let inserted = self.lock()?.execute(
            &format!(
                "INSERT OR IGNORE INTO queries ({}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
                QUERY_COLUMNS
            ),
            params![
                query.processor_id,
                query.query_id,
                query.query,
                query.price,
                query.amount,
                query.interval_start,
                query.interval_finish,
                query.consent_start,
                query.consent_finish,
                query.granularity,
                query.max_privacy,
                query.state,
                query.result,
                query.title,
                query.description,
                query.goal_description,
                query.thumbnail_url,
                used_data_types
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get_query(&self, key: QueryKey) -> StorageResult<Option<QueryRecord>> {
        let conn = self.lock()?;
        let query = conn
            .query_row(
                &format!(
                    "SELECT {} FROM queries WHERE processor_id = ?1 AND query_id = ?2",
                    QUERY_COLUMNS
                ),
                params![key.processor_id, key.query_id],
                query_from_row,
            )
            .optional()?;
        Ok(query)
    }

    fn delete_query(&self, key: QueryKey) -> StorageResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM query_users WHERE processor_id = ?1 AND query_id = ?2",
            params![key.processor_id, key.query_id],
        )?;
        tx.execute(
            "DELETE FROM queries WHERE processor_id = ?1 AND query_id = ?2",
            params![key.processor_id, key.query_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn queries_by_processor(
        &self,
        processor_id: ProcessorId,
        state: Option<QueryState>,
    ) -> StorageResult<Vec<QueryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM queries
             WHERE processor_id = ?1 AND (?2 IS NULL OR state = ?2)
             ORDER BY query_id",
            QUERY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![processor_id, state], query_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn due_queries(&self, now: i64) -> StorageResult<Vec<QueryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM queries WHERE state = ?1 AND consent_finish <= ?2
             ORDER BY consent_finish, processor_id, query_id",
            QUERY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![QueryState::Pending, now], query_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn transition(
        &self,
        key: QueryKey,
        from: QueryState,
        to: QueryState,
    ) -> StorageResult<bool> {
        let changed = self.lock()?.execute(
            "UPDATE queries SET state = ?1
             WHERE processor_id = ?2 AND query_id = ?3 AND state = ?4",
            params![to, key.processor_id, key.query_id, from],
        )?;
        Ok(changed == 1)
    }

    fn finalize(&self, key: QueryKey, state: QueryState, result: &str) -> StorageResult<()> {
        self.lock()?.execute(
            "UPDATE queries SET state = ?1, result = ?2
             WHERE processor_id = ?3 AND query_id = ?4",
            params![state, result, key.processor_id, key.query_id],
        )?;
        Ok(())
    }

    fn insert_query_users(&self, users: &[QueryUser]) -> StorageResult<()> {
        if users.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO query_users
                    (user_id, processor_id, query_id, consent, settings)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for user in users {
                stmt.execute(params![
                    user.user_id,
                    user.key.processor_id,
                    user.key.query_id,
                    user.consent,
                    user.settings
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query_user(&self, user: UserId, key: QueryKey) -> StorageResult<Option<QueryUser>> {
        self.query_user_in("query_users", user, key)
    }

    fn query_users(
        &self,
        key: QueryKey,
        consent: Option<ConsentState>,
    ) -> StorageResult<Vec<QueryUser>> {
        self.query_users_in("query_users", key, consent)
    }

    fn set_consent(
        &self,
        user: UserId,
        key: QueryKey,
        consent: ConsentState,
    ) -> StorageResult<bool> {
        let changed = self.lock()?.execute(
            "UPDATE query_users SET consent = ?1
             WHERE user_id = ?2 AND processor_id = ?3 AND query_id = ?4",
            params![consent, user, key.processor_id, key.query_id],
        )?;
        Ok(changed == 1)
    }

    fn queries_by_user(
        &self,
        user: UserId,
        state: Option<QueryState>,
        consent: Option<ConsentState>,
    ) -> StorageResult<Vec<(QueryRecord, ConsentState)>> {
        let columns = QUERY_COLUMNS
            .split(',')
            .map(|c| format!("q.{}", c.trim()))
            .collect::<Vec<_>>()
            .join(", ");

        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {}, u.consent FROM query_users u
             JOIN queries q ON q.processor_id = u.processor_id AND q.query_id = u.query_id
             WHERE u.user_id = ?1 AND (?2 IS NULL OR q.state = ?2) AND (?3 IS NULL OR u.consent = ?3)
             ORDER BY q.processor_id, q.query_id",
            columns
        ))?;
        let rows = stmt.query_map(params![user, state, consent], |row| {
            Ok((query_from_row(row)?, row.get(18)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_pin_query(&self, query: &PinQueryRecord) -> StorageResult<bool> {
        let inserted = self.lock()?.execute(
            &format!(
                "INSERT OR IGNORE INTO pin_queries ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                PIN_QUERY_COLUMNS
            ),
            params![
                query.processor_id,
                query.query_id,
                query.query,
                query.pin,
                query.session_id,
                query.consent_start,
                query.consent_finish,
                query.state,
                query.result
            ],
        )?;
        Ok(inserted == 1)
    }

    fn pin_query(&self, key: QueryKey) -> StorageResult<Option<PinQueryRecord>> {
        let conn = self.lock()?;
        let query = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pin_queries WHERE processor_id = ?1 AND query_id = ?2",
                    PIN_QUERY_COLUMNS
                ),
                params![key.processor_id, key.query_id],
                pin_query_from_row,
            )
            .optional()?;
        Ok(query)
    }

    fn pin_query_by_pin(&self, pin: u32) -> StorageResult<Option<PinQueryRecord>> {
        let conn = self.lock()?;
        let query = conn
            .query_row(
                &format!(
                    "SELECT {} FROM pin_queries WHERE pin = ?1
                     ORDER BY state = ?2 DESC, consent_finish DESC LIMIT 1",
                    PIN_QUERY_COLUMNS
                ),
                params![pin, QueryState::Pending],
                pin_query_from_row,
            )
            .optional()?;
        Ok(query)
    }

    fn due_pin_queries(&self, now: i64) -> StorageResult<Vec<PinQueryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM pin_queries WHERE state = ?1 AND consent_finish <= ?2
             ORDER BY consent_finish, processor_id, query_id",
            PIN_QUERY_COLUMNS
        ))?;
        let rows = stmt.query_map(params![QueryState::Pending, now], pin_query_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn transition_pin(
        &self,
        key: QueryKey,
        from: QueryState,
        to: QueryState,
    ) -> StorageResult<bool> {
        let changed = self.lock()?.execute(
            "UPDATE pin_queries SET state = ?1
             WHERE processor_id = ?2 AND query_id = ?3 AND state = ?4",
            params![to, key.processor_id, key.query_id, from],
        )?;
        Ok(changed == 1)
    }

    fn finalize_pin(&self, key: QueryKey, state: QueryState, result: &str) -> StorageResult<()> {
        self.lock()?.execute(
            "UPDATE pin_queries SET state = ?1, result = ?2
             WHERE processor_id = ?3 AND query_id = ?4",
            params![state, result, key.processor_id, key.query_id],
        )?;
        Ok(())
    }

    fn upsert_pin_consent(
        &self,
        user: UserId,
        key: QueryKey,
        consent: ConsentState,
    ) -> StorageResult<()> {
        self.lock()?.execute(
            "INSERT INTO pin_query_users (user_id, processor_id, query_id, consent, settings)
             VALUES (?1, ?2, ?3, ?4, '')
             ON CONFLICT (user_id, processor_id, query_id) DO UPDATE SET consent = excluded.consent",
            params![user, key.processor_id, key.query_id, consent],
        )?;
        Ok(())
    }

    fn pin_query_user(&self, user: UserId, key: QueryKey) -> StorageResult<Option<QueryUser>> {
        self.query_user_in("pin_query_users", user, key)
    }

    fn pin_query_users(
        &self,
        key: QueryKey,
        consent: Option<ConsentState>,
    ) -> StorageResult<Vec<QueryUser>> {
        self.query_users_in("pin_query_users", key, consent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn repo() -> SqliteRepository {
        let repo = SqliteRepository::open_in_memory().unwrap();
        repo.install_data_sources().unwrap();
        repo
    }

    fn query(processor_id: i64, query_id: i64, consent_finish: i64) -> QueryRecord {
        QueryRecord {
            processor_id,
            query_id,
            query: "SELECT SUM(RandomData.random_one)".to_string(),
            price: 1.5,
            amount: 2,
            interval_start: 0,
            interval_finish: 600_000,
            consent_start: 0,
            consent_finish,
            granularity: Some(60_000),
            max_privacy: 3,
            state: QueryState::Pending,
            result: None,
            title: "title".to_string(),
            description: String::new(),
            goal_description: String::new(),
            thumbnail_url: String::new(),
            used_data_types: vec![crate::sources::UserDataType::SmartHome],
        }
    }

    #[test]
    fn test_install_data_sources_is_idempotent() {
        let repo = SqliteRepository::open_in_memory().unwrap();
        assert_eq!(repo.install_data_sources().unwrap(), DataSource::ALL.len());
        assert_eq!(repo.install_data_sources().unwrap(), 0);
        assert_eq!(repo.data_source_id(DataSource::RandomData).unwrap(), Some(2));
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("privagg.db");
        {
            let repo = SqliteRepository::open(&path).unwrap();
            repo.install_data_sources().unwrap();
            assert!(repo.insert_query(&query(1, 1, 10)).unwrap());
        }
        let reopened = SqliteRepository::open(&path).unwrap();
        assert_eq!(reopened.path(), Some(path.as_path()));
        let stored = reopened.get_query(QueryKey::new(1, 1)).unwrap().unwrap();
        assert_eq!(stored, query(1, 1, 10));
    }

    #[test]
    fn test_insert_query_rejects_duplicates() {
        let repo = repo();
        assert!(repo.insert_query(&query(1, 7, 10)).unwrap());
        assert!(!repo.insert_query(&query(1, 7, 99)).unwrap());
        assert!(repo.insert_query(&query(2, 7, 10)).unwrap());
    }

    #[test]
    fn test_transition_is_compare_and_set() {
        let repo = repo();
        let key = QueryKey::new(1, 1);
        repo.insert_query(&query(1, 1, 10)).unwrap();

        assert!(repo
            .transition(key, QueryState::Pending, QueryState::Processing)
            .unwrap());
        assert!(!repo
            .transition(key, QueryState::Pending, QueryState::Processing)
            .unwrap());

        repo.finalize(key, QueryState::Completed, "{\"response\":{}}")
            .unwrap();
        let stored = repo.get_query(key).unwrap().unwrap();
        assert_eq!(stored.state, QueryState::Completed);
        assert_eq!(stored.result.as_deref(), Some("{\"response\":{}}"));
    }

    #[test]
    fn test_due_queries() {
        let repo = repo();
        repo.insert_query(&query(1, 1, 100)).unwrap();
        repo.insert_query(&query(1, 2, 200)).unwrap();
        repo.insert_query(&query(1, 3, 50)).unwrap();
        repo.transition(QueryKey::new(1, 3), QueryState::Pending, QueryState::Processing)
            .unwrap();

        let due: Vec<i64> = repo
            .due_queries(150)
            .unwrap()
            .iter()
            .map(|q| q.query_id)
            .collect();
        assert_eq!(due, vec![1]);
    }

    #[test]
    fn test_query_users_and_consent() {
        let repo = repo();
        let key = QueryKey::new(1, 1);
        repo.insert_query(&query(1, 1, 10)).unwrap();
        repo.insert_query_users(&[
            QueryUser {
                user_id: UserId(1),
                key,
                consent: ConsentState::Pending,
                settings: "[]".to_string(),
            },
            QueryUser {
                user_id: UserId(2),
                key,
                consent: ConsentState::Accepted,
                settings: "[]".to_string(),
            },
        ])
        .unwrap();

        assert_eq!(
            repo.query_users(key, Some(ConsentState::Accepted))
                .unwrap()
                .len(),
            1
        );
        assert!(repo
            .set_consent(UserId(1), key, ConsentState::Accepted)
            .unwrap());
        assert!(!repo
            .set_consent(UserId(9), key, ConsentState::Accepted)
            .unwrap());
        assert_eq!(
            repo.query_users(key, Some(ConsentState::Accepted))
                .unwrap()
                .len(),
            2
        );

        let for_user = repo.queries_by_user(UserId(2), None, None).unwrap();
        assert_eq!(for_user.len(), 1);
        assert_eq!(for_user[0].1, ConsentState::Accepted);

        repo.delete_query(key).unwrap();
        assert!(repo.get_query(key).unwrap().is_none());
        assert!(repo.query_users(key, None).unwrap().is_empty());
    }

    #[test]
    fn test_samples_and_latest_values() {
        let repo = repo();
        let attr = AttributeId::new(DataSource::RandomData, "random_one");
        for (user, ts, v) in [(2, 20, 2.5), (1, 10, 1.0), (1, 0, 0.5), (2, 5, 9.0), (1, 99, 3.0)] {
            repo.insert_sample(
                DataSource::RandomData,
                UserId(user),
                ts,
                &[("random_one", AttributeValue::Number(v))],
            )
            .unwrap();
        }

        let samples = repo
            .samples(&attr, &[UserId(1), UserId(2)], 0, 50)
            .unwrap();
        let flat: Vec<(i64, i64)> = samples.iter().map(|(u, s)| (u.0, s.timestamp)).collect();
        assert_eq!(flat, vec![(1, 0), (1, 10), (2, 5), (2, 20)]);

        let latest = repo.latest_values(&attr, &[UserId(1), UserId(2)]).unwrap();
        assert_eq!(latest[&UserId(1)], AttributeValue::Number(3.0));
        assert_eq!(latest[&UserId(2)], AttributeValue::Number(2.5));
    }

    #[test]
    fn test_text_attributes_and_unknown_columns() {
        let repo = repo();
        repo.insert_sample(
            DataSource::PersonalInformation,
            UserId(1),
            0,
            &[("city", AttributeValue::Text("aachen".to_string()))],
        )
        .unwrap();

        let values = repo
            .attribute_values(
                &AttributeId::new(DataSource::PersonalInformation, "city"),
                &[UserId(1)],
            )
            .unwrap();
        assert_eq!(
            values,
            vec![(UserId(1), AttributeValue::Text("aachen".to_string()))]
        );

        let err = repo
            .insert_sample(
                DataSource::RandomData,
                UserId(1),
                0,
                &[("nope", AttributeValue::Number(1.0))],
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownColumn(_)));
    }

    #[test]
    fn test_settings_and_granularity() {
        let repo = repo();
        repo.register_data_source(UserId(1), 2, 100).unwrap();
        repo.register_data_source(UserId(2), 2, 500).unwrap();
        assert_eq!(
            repo.registered_users(2, 200).unwrap(),
            [UserId(1)].into_iter().collect()
        );

        repo.set_privacy_setting(&PrivacySetting {
            user_id: UserId(1),
            data_source_id: 2,
            attribute: "random_one".to_string(),
            level: 2,
            explicit_consent: true,
        })
        .unwrap();
        let settings = repo.privacy_settings(2, "random_one").unwrap();
        assert_eq!(settings.len(), 1);
        assert!(settings[0].explicit_consent);

        for (ts, interval) in [(0, 60_000), (1_000, 120_000), (9_000, 30_000)] {
            repo.record_granularity(&UploadGranularityRecord {
                user_id: UserId(1),
                data_source_id: 2,
                timestamp: ts,
                interval,
            })
            .unwrap();
        }
        let history = repo.granularity_history(2, &[UserId(1)], 5_000).unwrap();
        assert_eq!(
            history.iter().map(|r| r.interval).collect::<Vec<_>>(),
            vec![60_000, 120_000]
        );
    }

    #[test]
    fn test_pin_queries() {
        let repo = repo();
        let record = PinQueryRecord {
            processor_id: 3,
            query_id: 4,
            query: "SELECT ALL(RandomData.random_one)".to_string(),
            pin: 12345,
            session_id: 1,
            consent_start: 0,
            consent_finish: 100,
            state: QueryState::Pending,
            result: None,
        };
        assert!(repo.insert_pin_query(&record).unwrap());
        assert!(!repo.insert_pin_query(&record).unwrap());
        assert_eq!(repo.pin_query_by_pin(12345).unwrap(), Some(record.clone()));

        let key = record.key();
        repo.upsert_pin_consent(UserId(1), key, ConsentState::Accepted)
            .unwrap();
        repo.upsert_pin_consent(UserId(1), key, ConsentState::Refused)
            .unwrap();
        repo.upsert_pin_consent(UserId(2), key, ConsentState::Accepted)
            .unwrap();
        let accepted = repo
            .pin_query_users(key, Some(ConsentState::Accepted))
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].user_id, UserId(2));
        assert_eq!(
            repo.pin_query_user(UserId(1), key).unwrap().unwrap().consent,
            ConsentState::Refused
        );

        assert_eq!(repo.due_pin_queries(100).unwrap().len(), 1);
        assert!(repo
            .transition_pin(key, QueryState::Pending, QueryState::Processing)
            .unwrap());
        repo.finalize_pin(key, QueryState::Completed, "{}").unwrap();
        assert_eq!(
            repo.pin_query(key).unwrap().unwrap().state,
            QueryState::Completed
        );

        // a pending query wins the PIN over a finished one
        let newer = PinQueryRecord {
            query_id: 5,
            consent_finish: 50,
            ..record
        };
        assert!(repo.insert_pin_query(&newer).unwrap());
        assert_eq!(repo.pin_query_by_pin(12345).unwrap(), Some(newer));
    }
}
