//! PostgreSQL metrics source.
//!
//! Reads from the statistics views over a single connection:
//! - `pg_stat_database`: per-database counters (instance-level)
//! - `pg_stat_user_tables` + `pg_statio_user_tables`: tables of the connected database
//! - `pg_stat_user_indexes` + `pg_statio_user_indexes`: indexes of the connected database
//! - `pg_locks`: lock registry snapshot
//! - `pg_stat_statements`: query statistics (requires extension)
//!
//! The session runs with a short `lock_timeout`, so even a lock taken
//! between the registry snapshot and a counter read cannot stall collection.

mod queries;

use postgres::error::SqlState;
use postgres::{Client, NoTls};
use tracing::{debug, info};

use crate::storage::model::{Readings, ResourceClass, ResourceId, StatementStat};

use super::SourceError;
use super::source::{LockRegistry, MetricsSource, Resource};
use queries::{
    CURRENT_DATABASE_OID, DATABASE_COUNTERS, INDEX_COUNTERS, LIST_DATABASES, LIST_INDEXES,
    LIST_TABLES, LOCK_REGISTRY, STATEMENTS_EXTENSION, TABLE_COUNTERS, build_statements_query,
};

const SESSION_SETUP: &str = "SET lock_timeout = '200ms'; SET statement_timeout = '30s'";

/// PostgreSQL metrics source.
///
/// Connects to PostgreSQL using standard environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
pub struct PostgresSource {
    connection_string: String,
    client: Option<Client>,
    server_version_num: Option<i32>,
    database_oid: Option<u32>,
    statements_available: Option<bool>,
}

impl PostgresSource {
    /// Creates a new source from environment variables.
    ///
    /// Uses $USER as default if PGUSER is not set.
    pub fn from_env() -> Result<Self, SourceError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| SourceError::EnvNotSet("PGUSER or USER".to_string()))?;

        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());

        let connection_string = if password.is_empty() {
            format!("host={host} port={port} user={user} dbname={database}")
        } else {
            format!("host={host} port={port} user={user} password={password} dbname={database}")
        };

        Ok(Self::with_connection_string(connection_string))
    }

    /// Creates a source with an explicit libpq connection string.
    pub fn with_connection_string(connection_string: String) -> Self {
        Self {
            connection_string,
            client: None,
            server_version_num: None,
            database_oid: None,
            statements_available: None,
        }
    }

    /// Attempts to connect, for startup checks.
    pub fn try_connect(&mut self) -> Result<(), SourceError> {
        self.ensure_connected().map(|_| ())
    }

    fn ensure_connected(&mut self) -> Result<&mut Client, SourceError> {
        if self.client.is_none() {
            let mut client = Client::connect(&self.connection_string, NoTls)
                .map_err(|e| SourceError::ConnectionError(format_postgres_error(&e)))?;

            client
                .batch_execute(SESSION_SETUP)
                .map_err(|e| SourceError::ConnectionError(format_postgres_error(&e)))?;

            // Determine server version once per (re)connect.
            self.server_version_num = client
                .query_one("SHOW server_version_num", &[])
                .ok()
                .and_then(|row| row.try_get::<_, String>(0).ok())
                .and_then(|v| v.parse::<i32>().ok());

            self.database_oid = client
                .query_one(CURRENT_DATABASE_OID, &[])
                .ok()
                .and_then(|row| row.try_get::<_, i64>(0).ok())
                .and_then(|oid| u32::try_from(oid).ok());

            self.statements_available = None;
            info!(
                "Connected to PostgreSQL (server_version_num={:?})",
                self.server_version_num
            );
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| SourceError::ConnectionError("not connected".to_string()))
    }

    /// Drop the connection after a failure that may have broken it.
    fn on_error(&mut self, e: postgres::Error) -> SourceError {
        let msg = format_postgres_error(&e);
        if e.is_closed() || e.as_db_error().is_none() {
            self.client = None;
            return SourceError::ConnectionError(msg);
        }
        if e.code() == Some(&SqlState::LOCK_NOT_AVAILABLE) {
            return SourceError::Locked(msg);
        }
        SourceError::QueryError(msg)
    }

    fn query(
        &mut self,
        sql: &str,
        params: &[&(dyn postgres::types::ToSql + Sync)],
    ) -> Result<Vec<postgres::Row>, SourceError> {
        let client = self.ensure_connected()?;
        match client.query(sql, params) {
            Ok(rows) => Ok(rows),
            Err(e) => Err(self.on_error(e)),
        }
    }

    fn current_database_oid(&mut self) -> Result<u32, SourceError> {
        self.ensure_connected()?;
        self.database_oid
            .ok_or_else(|| SourceError::QueryError("cannot resolve current database oid".into()))
    }
}

fn oid(row: &postgres::Row, idx: usize) -> Option<u32> {
    row.try_get::<_, i64>(idx)
        .ok()
        .and_then(|v| u32::try_from(v).ok())
}

fn bigints(row: &postgres::Row, count: usize) -> Vec<i64> {
    (0..count)
        .map(|i| row.try_get::<_, i64>(i).unwrap_or(0))
        .collect()
}

impl MetricsSource for PostgresSource {
    fn list_resources(&mut self, class: ResourceClass) -> Result<Vec<Resource>, SourceError> {
        match class {
            ResourceClass::Database => {
                let rows = self.query(LIST_DATABASES, &[])?;
                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        let id = oid(row, 0)?;
                        Some(Resource {
                            class,
                            id: ResourceId::database(id),
                            name: row.try_get::<_, String>(1).ok()?,
                            parent_oid: None,
                        })
                    })
                    .collect())
            }
            ResourceClass::Table => {
                let db = self.current_database_oid()?;
                let rows = self.query(LIST_TABLES, &[])?;
                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        let schema: String = row.try_get(1).ok()?;
                        let rel: String = row.try_get(2).ok()?;
                        Some(Resource {
                            class,
                            id: ResourceId {
                                database_oid: db,
                                object_oid: oid(row, 0)?,
                            },
                            name: format!("{schema}.{rel}"),
                            parent_oid: None,
                        })
                    })
                    .collect())
            }
            ResourceClass::Index => {
                let db = self.current_database_oid()?;
                let rows = self.query(LIST_INDEXES, &[])?;
                Ok(rows
                    .iter()
                    .filter_map(|row| {
                        let schema: String = row.try_get(2).ok()?;
                        let rel: String = row.try_get(3).ok()?;
                        Some(Resource {
                            class,
                            id: ResourceId {
                                database_oid: db,
                                object_oid: oid(row, 0)?,
                            },
                            name: format!("{schema}.{rel}"),
                            parent_oid: oid(row, 1),
                        })
                    })
                    .collect())
            }
        }
    }

    fn lock_registry(&mut self) -> Result<LockRegistry, SourceError> {
        let db = self.current_database_oid()?;
        let rows = self.query(LOCK_REGISTRY, &[])?;
        let registry = LockRegistry::from_relations(rows.iter().filter_map(|row| {
            // Shared catalogs report database 0.
            let database_oid = oid(row, 0).filter(|d| *d != 0).unwrap_or(db);
            Some(ResourceId {
                database_oid,
                object_oid: oid(row, 1)?,
            })
        }));
        if !registry.is_empty() {
            debug!("{} relations exclusively locked", registry.len());
        }
        Ok(registry)
    }

    fn read_counters(&mut self, resource: &Resource) -> Result<Readings, SourceError> {
        let sql = match resource.class {
            ResourceClass::Database => DATABASE_COUNTERS,
            ResourceClass::Table => TABLE_COUNTERS,
            ResourceClass::Index => INDEX_COUNTERS,
        };
        let key = resource.id.object_oid as i64;
        let rows = self.query(sql, &[&key])?;
        let Some(row) = rows.first() else {
            return Err(SourceError::ResourceGone(resource.name.clone()));
        };

        let counters = resource.class.counter_names().len();
        let gauges = resource.class.gauge_names().len();
        let values = bigints(row, counters + gauges);
        Ok(Readings {
            counters: values[..counters].to_vec(),
            gauges: values[counters..].to_vec(),
        })
    }

    fn statement_stats(&mut self) -> Result<Vec<StatementStat>, SourceError> {
        if self.statements_available.is_none() {
            let available = !self.query(STATEMENTS_EXTENSION, &[])?.is_empty();
            if !available {
                info!("pg_stat_statements is not installed; statement stats disabled");
            }
            self.statements_available = Some(available);
        }
        if self.statements_available != Some(true) {
            return Ok(Vec::new());
        }

        let sql = build_statements_query(self.server_version_num);
        let rows = self.query(&sql, &[])?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(StatementStat {
                    collected_at: 0,
                    query_id: row.try_get(0).ok()?,
                    query: row.try_get(1).unwrap_or_default(),
                    calls: row.try_get(2).unwrap_or(0),
                    total_exec_time: row.try_get(3).unwrap_or(0.0),
                    rows: row.try_get(4).unwrap_or(0),
                    shared_blks_hit: row.try_get(5).unwrap_or(0),
                    shared_blks_read: row.try_get(6).unwrap_or(0),
                    shared_blks_written: row.try_get(7).unwrap_or(0),
                    temp_blks_read: row.try_get(8).unwrap_or(0),
                    temp_blks_written: row.try_get(9).unwrap_or(0),
                })
            })
            .collect())
    }
}

/// Short, human-readable form of a driver error.
pub fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else if msg.contains("does not exist") {
            msg.split("FATAL:")
                .last()
                .unwrap_or(&msg)
                .trim()
                .to_string()
        } else {
            msg
        }
    }
}
