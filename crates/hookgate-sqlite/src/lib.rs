//! SQLite-backed `TenantStore`.
//!
//! Every call opens a short-lived connection on the blocking pool. WAL mode plus a busy
//! timeout let concurrent session tasks write without stepping on each other.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::NaiveDate;
use hookgate_core::{
    domain::{MessageCounters, NewTenant, TenantId, TenantRecord, UsagePeriodRecord},
    errors::Error,
    store::port::TenantStore,
    usage::UsageCounter,
    Result,
};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;

const DATE_FORMAT: &str = "%Y-%m-%d";

const TENANT_COLUMNS: &str = "id, name, token, webhook, jid, qrcode, pairing_code, connected, \
     expiration, events, instance, count_text_msg, count_image_msg, count_voice_msg, \
     count_video_msg, count_sticker_msg, count_location_msg, count_contact_msg, \
     count_document_msg";

#[derive(Debug, Clone)]
pub struct SqliteTenantStore {
    db_path: PathBuf,
}

impl SqliteTenantStore {
    /// Open (creating if needed) the database at `path` and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self { db_path };
        let connection = open_connection(&store.db_path).map_err(store_err)?;
        initialize_schema(&connection).map_err(store_err)?;
        debug!(path = %store.db_path.display(), "sqlite store ready");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = open_connection(&path)?;
            f(&mut connection)
        })
        .await
        .map_err(|e| Error::Store(format!("sqlite task failed: {e}")))?
        .map_err(store_err)
    }

    /// Run a single-row UPDATE; zero affected rows is `NotFound`.
    async fn update_one(
        &self,
        what: String,
        sql: &'static str,
        args: Vec<rusqlite::types::Value>,
    ) -> Result<()> {
        let changed = self
            .with_connection(move |conn| conn.execute(sql, rusqlite::params_from_iter(args)))
            .await?;
        if changed == 0 {
            return Err(Error::NotFound(what));
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> rusqlite::Result<Connection> {
    let connection = Connection::open(path)?;
    connection.busy_timeout(Duration::from_secs(5))?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL DEFAULT '',
            token TEXT NOT NULL UNIQUE,
            webhook TEXT NOT NULL DEFAULT '',
            jid TEXT NOT NULL DEFAULT '',
            qrcode TEXT NOT NULL DEFAULT '',
            pairing_code TEXT NOT NULL DEFAULT '',
            connected INTEGER NOT NULL DEFAULT 0,
            expiration INTEGER NOT NULL DEFAULT 0,
            events TEXT NOT NULL DEFAULT 'All',
            instance TEXT NOT NULL DEFAULT '',
            count_text_msg INTEGER NOT NULL DEFAULT 0,
            count_image_msg INTEGER NOT NULL DEFAULT 0,
            count_voice_msg INTEGER NOT NULL DEFAULT 0,
            count_video_msg INTEGER NOT NULL DEFAULT 0,
            count_sticker_msg INTEGER NOT NULL DEFAULT 0,
            count_location_msg INTEGER NOT NULL DEFAULT 0,
            count_contact_msg INTEGER NOT NULL DEFAULT 0,
            count_document_msg INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_users_instance_connected ON users (instance, connected);

        CREATE TABLE IF NOT EXISTS user_histories (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            date TEXT NOT NULL,
            count_text_msg INTEGER NOT NULL DEFAULT 0,
            count_image_msg INTEGER NOT NULL DEFAULT 0,
            count_voice_msg INTEGER NOT NULL DEFAULT 0,
            count_video_msg INTEGER NOT NULL DEFAULT 0,
            count_sticker_msg INTEGER NOT NULL DEFAULT 0,
            count_location_msg INTEGER NOT NULL DEFAULT 0,
            count_contact_msg INTEGER NOT NULL DEFAULT 0,
            count_document_msg INTEGER NOT NULL DEFAULT 0,
            is_online INTEGER NOT NULL DEFAULT 0,
            UNIQUE (user_id, date),
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        );
        "#,
    )
}

fn store_err(e: rusqlite::Error) -> Error {
    Error::Store(format!("sqlite: {e}"))
}

fn counters_at(row: &Row<'_>, first: usize) -> rusqlite::Result<MessageCounters> {
    Ok(MessageCounters {
        text: row.get(first)?,
        image: row.get(first + 1)?,
        voice: row.get(first + 2)?,
        video: row.get(first + 3)?,
        sticker: row.get(first + 4)?,
        location: row.get(first + 5)?,
        contact: row.get(first + 6)?,
        document: row.get(first + 7)?,
    })
}

fn tenant_from_row(row: &Row<'_>) -> rusqlite::Result<TenantRecord> {
    Ok(TenantRecord {
        id: TenantId(row.get(0)?),
        name: row.get(1)?,
        token: row.get(2)?,
        webhook: row.get(3)?,
        device_identity: row.get(4)?,
        qr_code: row.get(5)?,
        pairing_code: row.get(6)?,
        connected: row.get::<_, i64>(7)? != 0,
        expiration: row.get(8)?,
        events: row.get(9)?,
        instance: row.get(10)?,
        counters: counters_at(row, 11)?,
    })
}

fn text(s: &str) -> rusqlite::types::Value {
    rusqlite::types::Value::Text(s.to_string())
}

fn int(i: i64) -> rusqlite::types::Value {
    rusqlite::types::Value::Integer(i)
}

#[async_trait]
impl TenantStore for SqliteTenantStore {
    async fn create_tenant(&self, tenant: NewTenant) -> Result<TenantId> {
        let id = self
            .with_connection(move |conn| {
                conn.execute(
                    "INSERT INTO users (name, token, webhook, events, instance, expiration)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        tenant.name,
                        tenant.token,
                        tenant.webhook,
                        tenant.events,
                        tenant.instance,
                        tenant.expiration
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(TenantId(id))
    }

    async fn update_tenant(&self, t: &TenantRecord) -> Result<()> {
        let args = vec![
            text(&t.name),
            text(&t.token),
            text(&t.webhook),
            text(&t.device_identity),
            text(&t.qr_code),
            text(&t.pairing_code),
            int(i64::from(t.connected)),
            int(t.expiration),
            text(&t.events),
            text(&t.instance),
            int(t.id.0),
        ];
        self.update_one(
            format!("tenant {}", t.id),
            "UPDATE users SET name = ?1, token = ?2, webhook = ?3, jid = ?4, qrcode = ?5,
                 pairing_code = ?6, connected = ?7, expiration = ?8, events = ?9, instance = ?10
             WHERE id = ?11",
            args,
        )
        .await
    }

    async fn delete_tenant(&self, id: TenantId) -> Result<()> {
        self.with_connection(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM user_histories WHERE user_id = ?1", params![id.0])?;
            tx.execute("DELETE FROM users WHERE id = ?1", params![id.0])?;
            tx.commit()
        })
        .await
    }

    async fn set_qr_code(&self, id: TenantId, qr_code: &str, instance: &str) -> Result<()> {
        self.update_one(
            format!("tenant {id} in instance {instance}"),
            "UPDATE users SET qrcode = ?1 WHERE id = ?2 AND instance = ?3",
            vec![text(qr_code), int(id.0), text(instance)],
        )
        .await
    }

    async fn set_pairing_code(&self, id: TenantId, code: &str, instance: &str) -> Result<()> {
        self.update_one(
            format!("tenant {id} in instance {instance}"),
            "UPDATE users SET pairing_code = ?1 WHERE id = ?2 AND instance = ?3",
            vec![text(code), int(id.0), text(instance)],
        )
        .await
    }

    async fn set_webhook(&self, id: TenantId, webhook: &str) -> Result<()> {
        self.update_one(
            format!("tenant {id}"),
            "UPDATE users SET webhook = ?1 WHERE id = ?2",
            vec![text(webhook), int(id.0)],
        )
        .await
    }

    async fn set_connected(&self, id: TenantId) -> Result<()> {
        self.update_one(
            format!("tenant {id}"),
            "UPDATE users SET connected = 1 WHERE id = ?1",
            vec![int(id.0)],
        )
        .await
    }

    async fn set_disconnected(&self, id: TenantId) -> Result<()> {
        self.update_one(
            format!("tenant {id}"),
            "UPDATE users SET connected = 0 WHERE id = ?1",
            vec![int(id.0)],
        )
        .await
    }

    async fn set_device_identity(&self, id: TenantId, identity: &str) -> Result<()> {
        self.update_one(
            format!("tenant {id}"),
            "UPDATE users SET jid = ?1 WHERE id = ?2",
            vec![text(identity), int(id.0)],
        )
        .await
    }

    async fn set_events(&self, id: TenantId, events: &str) -> Result<()> {
        self.update_one(
            format!("tenant {id}"),
            "UPDATE users SET events = ?1 WHERE id = ?2",
            vec![text(events), int(id.0)],
        )
        .await
    }

    async fn tenant_by_id(&self, id: TenantId) -> Result<Option<TenantRecord>> {
        self.with_connection(move |conn| {
            conn.query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM users WHERE id = ?1"),
                params![id.0],
                tenant_from_row,
            )
            .optional()
        })
        .await
    }

    async fn tenant_by_token(&self, token: &str) -> Result<Option<TenantRecord>> {
        let token = token.to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                &format!("SELECT {TENANT_COLUMNS} FROM users WHERE token = ?1"),
                params![token],
                tenant_from_row,
            )
            .optional()
        })
        .await
    }

    async fn list_connected(&self, instance: &str) -> Result<Vec<TenantRecord>> {
        let instance = instance.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TENANT_COLUMNS} FROM users
                 WHERE connected = 1 AND instance = ?1 ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(params![instance], tenant_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn record_usage(
        &self,
        id: TenantId,
        counter: UsageCounter,
        date: NaiveDate,
    ) -> Result<()> {
        let day = date.format(DATE_FORMAT).to_string();
        let found = self
            .with_connection(move |conn| {
                // Take the write lock up front; a deferred read-then-write upgrade fails
                // with SQLITE_BUSY without honoring the busy timeout.
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let exists: Option<i64> = tx
                    .query_row("SELECT id FROM users WHERE id = ?1", params![id.0], |r| {
                        r.get(0)
                    })
                    .optional()?;
                if exists.is_none() {
                    return Ok(false);
                }
                // Column names come from the closed counter set, never from input.
                match counter.column() {
                    Some(col) => {
                        tx.execute(
                            &format!(
                                "INSERT INTO user_histories (user_id, date, {col}) VALUES (?1, ?2, 1)
                                 ON CONFLICT(user_id, date) DO UPDATE SET {col} = {col} + 1"
                            ),
                            params![id.0, day],
                        )?;
                        tx.execute(
                            &format!("UPDATE users SET {col} = {col} + 1 WHERE id = ?1"),
                            params![id.0],
                        )?;
                    }
                    None => {
                        tx.execute(
                            "INSERT INTO user_histories (user_id, date, is_online) VALUES (?1, ?2, 1)
                             ON CONFLICT(user_id, date) DO UPDATE SET is_online = 1",
                            params![id.0, day],
                        )?;
                    }
                }
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if !found {
            return Err(Error::NotFound(format!("tenant {id}")));
        }
        Ok(())
    }

    async fn usage_for(&self, id: TenantId, date: NaiveDate) -> Result<Option<UsagePeriodRecord>> {
        let day = date.format(DATE_FORMAT).to_string();
        self.with_connection(move |conn| {
            conn.query_row(
                "SELECT count_text_msg, count_image_msg, count_voice_msg, count_video_msg,
                        count_sticker_msg, count_location_msg, count_contact_msg,
                        count_document_msg, is_online
                 FROM user_histories WHERE user_id = ?1 AND date = ?2",
                params![id.0, day],
                |row| {
                    Ok(UsagePeriodRecord {
                        tenant_id: id,
                        date,
                        counters: counters_at(row, 0)?,
                        is_online: row.get::<_, i64>(8)? != 0,
                    })
                },
            )
            .optional()
        })
        .await
    }
}
