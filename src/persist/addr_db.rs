// Address database
//
// Sqlite store of address records. A dedicated OS thread owns the
// `rusqlite::Connection`; callers send commands over a bounded channel and
// await a oneshot reply, so the async executor never touches the connection
// and the writer is never awaited.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::address::AddressKey;
use crate::bus::Address;
use crate::types::{Error, Result};
use crate::value::Value;

enum DbCommand {
    Upsert {
        addr: Address,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },
    UpdateValue {
        key: String,
        value: Option<String>,
        updated: String,
    },
    Delete {
        key: String,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },
    LoadAll {
        reply: tokio::sync::oneshot::Sender<Result<Vec<Address>>>,
    },
    Clear {
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    },
    Close {
        reply: tokio::sync::oneshot::Sender<()>,
    },
}

/// Handle to the writer thread. `Clone` is cheap; the thread stops when the
/// last handle is dropped or `close()` is awaited.
#[derive(Clone)]
pub struct AddressDb {
    tx: std::sync::mpsc::SyncSender<DbCommand>,
}

impl AddressDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_err)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS addresses (
                key TEXT PRIMARY KEY COLLATE NOCASE,
                name TEXT NOT NULL,
                dpt TEXT,
                internal INTEGER NOT NULL DEFAULT 0,
                group_label TEXT,
                last_value TEXT,
                last_updated TEXT,
                initial_value TEXT
            )",
            [],
        )
        .map_err(db_err)?;

        let (tx, rx) = std::sync::mpsc::sync_channel::<DbCommand>(64);
        std::thread::Builder::new()
            .name("domus-addr-db".to_string())
            .spawn(move || writer_loop(conn, rx))?;
        Ok(Self { tx })
    }

    pub async fn upsert(&self, addr: Address) -> Result<()> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(DbCommand::Upsert { addr, reply })?;
        rx.await.map_err(|_| Error::RuntimeStopped)?
    }

    /// Fire-and-forget value update on the hot write path. Dropped with a
    /// warning when the writer is saturated; the in-memory bus stays
    /// authoritative either way.
    pub fn update_value(&self, key: &AddressKey, value: &Value, updated: DateTime<Utc>) {
        let cmd = DbCommand::UpdateValue {
            key: key.to_string(),
            value: match value {
                Value::Null => None,
                other => Some(other.to_wire()),
            },
            updated: updated.to_rfc3339(),
        };
        if let Err(e) = self.tx.try_send(cmd) {
            warn!(error = %e, "address DB writer saturated, dropping value update");
        }
    }

    pub async fn delete(&self, key: &AddressKey) -> Result<()> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(DbCommand::Delete {
            key: key.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| Error::RuntimeStopped)?
    }

    pub async fn load_all(&self) -> Result<Vec<Address>> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(DbCommand::LoadAll { reply })?;
        rx.await.map_err(|_| Error::RuntimeStopped)?
    }

    /// Drop every row, used when a backup import replaces the address set.
    pub async fn clear(&self) -> Result<()> {
        let (reply, rx) = tokio::sync::oneshot::channel();
        self.send(DbCommand::Clear { reply })?;
        rx.await.map_err(|_| Error::RuntimeStopped)?
    }

    pub async fn close(&self) {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self.send(DbCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    fn send(&self, cmd: DbCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::RuntimeStopped)
    }
}

fn writer_loop(conn: Connection, rx: std::sync::mpsc::Receiver<DbCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DbCommand::Upsert { addr, reply } => {
                let _ = reply.send(upsert(&conn, &addr));
            }
            DbCommand::UpdateValue { key, value, updated } => {
                let result = conn.execute(
                    "UPDATE addresses SET last_value = ?2, last_updated = ?3 WHERE key = ?1",
                    params![key, value, updated],
                );
                if let Err(e) = result {
                    warn!(key = %key, error = %e, "address value update failed");
                }
            }
            DbCommand::Delete { key, reply } => {
                let _ = reply.send(
                    conn.execute("DELETE FROM addresses WHERE key = ?1", params![key])
                        .map(|_| ())
                        .map_err(db_err),
                );
            }
            DbCommand::LoadAll { reply } => {
                let _ = reply.send(load_all(&conn));
            }
            DbCommand::Clear { reply } => {
                let _ = reply.send(
                    conn.execute("DELETE FROM addresses", [])
                        .map(|_| ())
                        .map_err(db_err),
                );
            }
            DbCommand::Close { reply } => {
                let _ = reply.send(());
                break;
            }
        }
    }
    debug!("address DB writer stopped");
}

fn upsert(conn: &Connection, addr: &Address) -> Result<()> {
    conn.execute(
        "INSERT INTO addresses (key, name, dpt, internal, group_label, last_value, last_updated, initial_value)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(key) DO UPDATE SET
            name = excluded.name,
            dpt = excluded.dpt,
            internal = excluded.internal,
            group_label = excluded.group_label,
            initial_value = excluded.initial_value",
        params![
            addr.key.to_string(),
            addr.name,
            addr.dpt,
            addr.internal as i64,
            addr.group_label,
            match &addr.last_value {
                Value::Null => None,
                other => Some(other.to_wire()),
            },
            addr.last_updated.map(|t| t.to_rfc3339()),
            addr.initial_value.as_ref().map(|v| v.to_wire()),
        ],
    )
    .map(|_| ())
    .map_err(db_err)
}

fn load_all(conn: &Connection) -> Result<Vec<Address>> {
    let mut stmt = conn
        .prepare(
            "SELECT key, name, dpt, internal, group_label, last_value, last_updated, initial_value
             FROM addresses ORDER BY key",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })
        .map_err(db_err)?;

    let mut out = Vec::new();
    for row in rows {
        let (key, name, dpt, internal, group_label, last_value, last_updated, initial_value) =
            row.map_err(db_err)?;
        let key = match AddressKey::parse(&key) {
            Ok(key) => key,
            Err(e) => {
                warn!(key = %key, error = %e, "skipping address row with invalid key");
                continue;
            }
        };
        out.push(Address {
            internal: internal != 0 || key.is_internal(),
            last_value: last_value
                .map(|t| Value::parse_text(&t, dpt.as_deref()))
                .unwrap_or(Value::Null),
            last_updated: last_updated
                .and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
                .map(|t| t.with_timezone(&Utc)),
            initial_value: initial_value.map(|t| Value::parse_text(&t, dpt.as_deref())),
            key,
            name,
            dpt,
            group_label,
        });
    }
    Ok(out)
}

fn db_err(e: rusqlite::Error) -> Error {
    Error::Io(std::io::Error::other(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(key: &str, value: Value) -> Address {
        Address {
            key: AddressKey::parse(key).unwrap(),
            name: format!("addr {key}"),
            dpt: Some("1".into()),
            internal: key.starts_with("IKO"),
            group_label: None,
            last_value: value,
            last_updated: Some(Utc::now()),
            initial_value: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let db = AddressDb::open(dir.path().join("addresses.db")).unwrap();

        db.upsert(addr("1/1/1", Value::Bool(true))).await.unwrap();
        db.upsert(addr("IKO:n1:A1", Value::Null)).await.unwrap();

        let all = db.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        let external = all.iter().find(|a| a.key.to_string() == "1/1/1").unwrap();
        assert!(!external.internal);
        db.close().await;
    }

    #[tokio::test]
    async fn test_value_update_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.db");
        let db = AddressDb::open(&path).unwrap();
        let key = AddressKey::parse("1/1/1").unwrap();

        db.upsert(addr("1/1/1", Value::Null)).await.unwrap();
        db.update_value(&key, &Value::Bool(true), Utc::now());
        db.close().await;

        let db = AddressDb::open(&path).unwrap();
        let all = db.load_all().await.unwrap();
        assert_eq!(all[0].last_value, Value::Bool(true));
        db.close().await;
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = tempfile::tempdir().unwrap();
        let db = AddressDb::open(dir.path().join("addresses.db")).unwrap();
        db.upsert(addr("1/1/1", Value::Null)).await.unwrap();
        db.delete(&AddressKey::parse("1/1/1").unwrap()).await.unwrap();
        assert!(db.load_all().await.unwrap().is_empty());
        db.close().await;
    }
}
