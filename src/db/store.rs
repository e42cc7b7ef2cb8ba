//! SQLite document store implementation.

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::document::{Document, DocumentStore, Fields, Filter, StoreError};
use super::timefmt;

/// Thread-safe SQLite store holding JSON documents.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| StoreError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Count documents in a collection.
    #[cfg(test)]
    pub fn count(&self, collection: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![collection],
            |r| r.get(0),
        )?)
    }

    fn select_doc(
        conn: &Connection,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StoreError> {
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, body FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((version, body)) => Ok(Some(Document {
                id: id.to_string(),
                version,
                fields: decode_body(&body)?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn query(
        &self,
        collection: &str,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Document>, StoreError> {
        let mut sql = String::from("SELECT id, version, body FROM documents WHERE collection = ?1");
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(collection.to_string())];

        for filter in filters {
            let (field, op, value) = match filter {
                Filter::Equal(field, value) => (field, "=", value),
                Filter::LessThanEqual(field, value) => (field, "<=", value),
            };
            values.push(SqlValue::Text(format!("$.{}", field)));
            let path_idx = values.len();

            // Timestamp bounds compare as instants, whatever precision the stored value has.
            let timestamp = match (filter, value) {
                (Filter::LessThanEqual(..), Value::String(raw)) => timefmt::parse(raw),
                _ => None,
            };
            match timestamp {
                Some(ts) => {
                    values.push(SqlValue::Text(timefmt::format(&ts)));
                    let value_idx = values.len();
                    sql.push_str(&format!(
                        " AND julianday(json_extract(body, ?{})) {} julianday(?{})",
                        path_idx, op, value_idx
                    ));
                }
                None => {
                    values.push(to_sql_value(value));
                    let value_idx = values.len();
                    sql.push_str(&format!(
                        " AND json_extract(body, ?{}) {} ?{}",
                        path_idx, op, value_idx
                    ));
                }
            }
        }

        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", values.len()));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, version, body)| {
                Ok(Document {
                    id,
                    version,
                    fields: decode_body(&body)?,
                })
            })
            .collect()
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.lock()?;
        Self::select_doc(&conn, collection, id)
    }

    async fn create(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, StoreError> {
        let body = serde_json::to_string(&fields)?;
        let now = timefmt::format(&timefmt::now());

        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO documents (collection, id, version, body, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?4)
             ON CONFLICT(collection, id) DO NOTHING",
            params![collection, id, body, now],
        )?;

        if inserted == 0 {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }

        Ok(Document {
            id: id.to_string(),
            version: 1,
            fields,
        })
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        expected_version: Option<i64>,
    ) -> Result<Document, StoreError> {
        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        let mut doc = Self::select_doc(&tx, collection, id)?.ok_or_else(|| StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        })?;

        if let Some(expected) = expected_version {
            if expected != doc.version {
                return Err(StoreError::Conflict {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    expected,
                    actual: doc.version,
                });
            }
        }

        for (key, value) in fields {
            doc.fields.insert(key, value);
        }
        doc.version += 1;

        tx.execute(
            "UPDATE documents SET body = ?1, version = ?2, updated_at = ?3
             WHERE collection = ?4 AND id = ?5",
            params![
                serde_json::to_string(&doc.fields)?,
                doc.version,
                timefmt::format(&timefmt::now()),
                collection,
                id,
            ],
        )?;
        tx.commit()?;

        Ok(doc)
    }
}

fn decode_body(body: &str) -> Result<Fields, StoreError> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(fields) => Ok(fields),
        _ => Ok(Fields::new()),
    }
}

/// Map a JSON value onto what `json_extract` yields for it.
fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
