//! Provides the JSON document store along with its REST error taxonomy.
//!
//! The store keeps a single JSON object (the **Document**) in memory whose top level keys
//! are treated as named collections. Reads operate on a lock free snapshot, writes clone
//! the snapshot, mutate the clone, persist it to disk and only then publish it. Therefore
//! readers always observe either the pre-write or the post-write document and the file on
//! disk never lags behind what the API reports.
//!
//! All values leaving the store are filtered through [access::redact](access::redact), so
//! private fields (keys starting with `_`) stay on disk but are never served.
//!
//! # Example
//!
//! ```no_run
//! # use shdb::store::Store;
//! # use serde_json::json;
//! # #[tokio::main]
//! # async fn main() {
//! let store = Store::new("db.json");
//! store.load().await.unwrap();
//!
//! store.insert("users", json!({ "id": 1, "name": "Anna" })).await.unwrap();
//! assert_eq!(store.record("users", "1").is_some(), true);
//! # }
//! ```
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::platform::Platform;
use crate::store::access::{is_private, redact};

pub mod access;
pub mod query;

/// Contains the in-memory form of the database: a JSON object whose entries are the
/// collections.
///
/// Note that **serde_json** is compiled with **preserve_order**, so collections and fields
/// keep their document order across load / persist cycles.
pub type Document = Map<String, Value>;

/// Enumerates the ways a write operation can fail.
///
/// The router maps these onto HTTP status codes, therefore the variants mirror the REST
/// error taxonomy rather than low level causes. Only [Storage](StoreError::Storage)
/// carries a source error, as persistence failures are the only case worth logging in
/// detail.
#[derive(Debug)]
pub enum StoreError {
    /// The addressed collection doesn't exist, isn't a list or is private.
    UnknownCollection,
    /// No record with the given id exists within the collection.
    UnknownRecord,
    /// A record with the same id already exists within the collection.
    Conflict,
    /// The given record lacks the mandatory **id** field.
    MissingId,
    /// Persisting the document to disk failed. The in-memory state was rolled back.
    Storage(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::UnknownCollection => write!(f, "Unknown collection"),
            StoreError::UnknownRecord => write!(f, "Unknown record"),
            StoreError::Conflict => write!(f, "A record with this id is already present"),
            StoreError::MissingId => write!(f, "The record is missing an id field"),
            StoreError::Storage(error) => write!(f, "Failed to persist the document: {}", error),
        }
    }
}

impl std::error::Error for StoreError {}

/// Provides the document store.
///
/// An instance is created and registered by [install](install), which also reads the
/// database path from the system config (`server.db_file`, defaulting to **db.json**).
pub struct Store {
    db_file: PathBuf,
    state: ArcSwap<Document>,
    write_lock: tokio::sync::Mutex<()>,
}

impl Store {
    /// Creates a new (empty) store persisting into the given file.
    pub fn new(db_file: impl Into<PathBuf>) -> Self {
        Store {
            db_file: db_file.into(),
            state: ArcSwap::new(Arc::new(Document::new())),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Loads the document from disk.
    ///
    /// A missing file is not an error, the store simply starts with an empty document
    /// which is materialized on the first write. A present but malformed file however is
    /// reported, as silently discarding data would be way worse than failing the startup.
    pub async fn load(&self) -> anyhow::Result<()> {
        match tokio::fs::read(&self.db_file).await {
            Ok(bytes) => {
                let value: Value = serde_json::from_slice(&bytes).with_context(|| {
                    format!("Malformed database file: {}", self.db_file.display())
                })?;

                match value {
                    Value::Object(document) => {
                        log::info!(
                            "Loaded {} collection(s) from {}...",
                            document.len(),
                            self.db_file.display()
                        );
                        self.state.store(Arc::new(document));
                        Ok(())
                    }
                    _ => Err(anyhow::anyhow!(
                        "Database file {} doesn't contain a JSON object!",
                        self.db_file.display()
                    )),
                }
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::info!(
                    "Database file {} doesn't exist yet - starting with an empty document...",
                    self.db_file.display()
                );
                self.state.store(Arc::new(Document::new()));
                Ok(())
            }
            Err(error) => Err(error).with_context(|| {
                format!("Cannot read database file: {}", self.db_file.display())
            }),
        }
    }

    /// Returns the whole document with all private fields and collections removed.
    pub fn root(&self) -> Value {
        redact(&Value::Object(self.state.load().as_ref().clone()))
    }

    /// Returns the redacted contents of the given collection.
    ///
    /// Yields **None** for private or unknown collections. Note that the result is the
    /// raw value stored under the collection name, which commonly is a list of records
    /// but may be any JSON value.
    pub fn collection(&self, name: &str) -> Option<Value> {
        if is_private(name) {
            return None;
        }

        self.state.load().get(name).map(redact)
    }

    /// Returns the redacted first record within the given collection matching the given id.
    ///
    /// Ids compare numerically: the stored id as well as the requested one are coerced to
    /// a float (numeric strings included), non-numeric ids never match.
    pub fn record(&self, name: &str, id: &str) -> Option<Value> {
        if is_private(name) {
            return None;
        }

        let target = id.trim().parse::<f64>().ok()?;
        let state = self.state.load();
        let records = state.get(name)?.as_array()?;

        find_record(records, target).map(|index| redact(&records[index]))
    }

    /// Appends a record to the given collection and persists the document.
    ///
    /// The record must carry an **id** field which is not yet taken within the collection.
    /// Returns the redacted form of the stored record.
    pub async fn insert(&self, collection: &str, record: Value) -> Result<Value, StoreError> {
        if is_private(collection) {
            return Err(StoreError::UnknownCollection);
        }

        let id = record
            .as_object()
            .and_then(|map| map.get("id"))
            .cloned()
            .ok_or(StoreError::MissingId)?;

        let _guard = self.write_lock.lock().await;
        let mut document = self.state.load().as_ref().clone();
        let records = document
            .get_mut(collection)
            .and_then(Value::as_array_mut)
            .ok_or(StoreError::UnknownCollection)?;

        if let Some(id) = numeric_id(&id) {
            if find_record(records, id).is_some() {
                return Err(StoreError::Conflict);
            }
        }

        records.push(record.clone());
        self.commit(document).await?;

        Ok(redact(&record))
    }

    /// Replaces the record with the given id by the given record and persists the document.
    ///
    /// Just like with [insert](Store::insert), the record must carry an **id** field. The
    /// stored record is the given one as is, so a replacement carrying a different id
    /// effectively re-keys the record. Returns the redacted form of the stored record.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        record: Value,
    ) -> Result<Value, StoreError> {
        if is_private(collection) {
            return Err(StoreError::UnknownCollection);
        }

        if record
            .as_object()
            .and_then(|map| map.get("id"))
            .is_none()
        {
            return Err(StoreError::MissingId);
        }

        let target = id
            .trim()
            .parse::<f64>()
            .map_err(|_| StoreError::UnknownRecord)?;

        let _guard = self.write_lock.lock().await;
        let mut document = self.state.load().as_ref().clone();
        let records = document
            .get_mut(collection)
            .and_then(Value::as_array_mut)
            .ok_or(StoreError::UnknownCollection)?;

        let index = find_record(records, target).ok_or(StoreError::UnknownRecord)?;
        records[index] = record.clone();
        self.commit(document).await?;

        Ok(redact(&record))
    }

    /// Removes the record with the given id and persists the document.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        if is_private(collection) {
            return Err(StoreError::UnknownCollection);
        }

        let target = id
            .trim()
            .parse::<f64>()
            .map_err(|_| StoreError::UnknownRecord)?;

        let _guard = self.write_lock.lock().await;
        let mut document = self.state.load().as_ref().clone();
        let records = document
            .get_mut(collection)
            .and_then(Value::as_array_mut)
            .ok_or(StoreError::UnknownCollection)?;

        let index = find_record(records, target).ok_or(StoreError::UnknownRecord)?;
        let _ = records.remove(index);
        self.commit(document).await?;

        Ok(())
    }

    /// Persists the given document and swaps it in as the current snapshot.
    ///
    /// Order matters here: if the write to disk fails, the snapshot remains untouched and
    /// the whole operation behaves as if it never happened.
    async fn commit(&self, document: Document) -> Result<(), StoreError> {
        self.persist(&document).await.map_err(StoreError::Storage)?;
        self.state.store(Arc::new(document));
        Ok(())
    }

    async fn persist(&self, document: &Document) -> anyhow::Result<()> {
        let mut bytes = serde_json::to_vec_pretty(document)
            .context("Failed to serialize the document")?;
        bytes.push(b'\n');

        tokio::fs::write(&self.db_file, bytes)
            .await
            .with_context(|| format!("Failed to write database file: {}", self.db_file.display()))
    }
}

/// Coerces a stored id value to its numeric form.
fn numeric_id(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(string) => string.trim().parse().ok(),
        _ => None,
    }
}

/// Determines the index of the first record whose id matches the given one.
fn find_record(records: &[Value], id: f64) -> Option<usize> {
    records.iter().position(|record| {
        record
            .get("id")
            .and_then(numeric_id)
            .map(|record_id| record_id == id)
            .unwrap_or(false)
    })
}

/// Creates a store based on the system config and registers it on the platform.
///
/// Reads the database path from `server.db_file` (default **db.json**) and loads the
/// document from disk. An unreadable or malformed database file aborts the installation,
/// a missing one simply yields an empty store.
pub async fn install(platform: Arc<Platform>) -> anyhow::Result<Arc<Store>> {
    let db_file = platform
        .require::<Config>()
        .current()
        .config()["server"]["db_file"]
        .as_str()
        .unwrap_or("db.json")
        .to_owned();

    let store = Arc::new(Store::new(db_file));
    store.load().await?;
    platform.register::<Store>(store.clone());

    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_async, SHARED_TEST_RESOURCES};
    use serde_json::json;

    /// Creates a store backed by a scratch file below target/ which is freshly seeded
    /// with the given document contents.
    async fn setup_store(file: &str, contents: &str) -> Store {
        tokio::fs::create_dir_all("target/store-tests").await.unwrap();
        let path = format!("target/store-tests/{}", file);
        tokio::fs::write(&path, contents).await.unwrap();

        let store = Store::new(&path);
        store.load().await.unwrap();
        store
    }

    const TEST_DOCUMENT: &str = r#"{
        "users": [
            { "id": 1, "name": "Anna", "_token": "hunter2" },
            { "id": 2, "name": "Ben" }
        ],
        "_secrets": [ { "id": 1, "key": "xyz" } ],
        "motd": "hello"
    }"#;

    #[test]
    fn missing_database_file_yields_an_empty_document() {
        test_async(async {
            let store = Store::new("target/store-tests/no-such-file.json");
            store.load().await.unwrap();
            assert_eq!(store.root(), json!({}));
        });
    }

    #[test]
    fn malformed_database_file_is_reported() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            tokio::fs::create_dir_all("target/store-tests").await.unwrap();
            tokio::fs::write("target/store-tests/broken.json", "{ nope")
                .await
                .unwrap();

            let store = Store::new("target/store-tests/broken.json");
            assert_eq!(store.load().await.is_err(), true);
        });
    }

    #[test]
    fn reads_are_redacted() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let store = setup_store("reads.json", TEST_DOCUMENT).await;

            // The root document neither contains private collections nor private fields...
            let root = store.root();
            assert_eq!(root.get("_secrets"), None);
            assert_eq!(root["users"][0].get("_token"), None);
            assert_eq!(root["motd"], json!("hello"));

            // Private collections are invisible even when addressed directly...
            assert_eq!(store.collection("_secrets"), None);
            assert_eq!(store.record("_secrets", "1"), None);

            // Records are redacted as well...
            let anna = store.record("users", "1").unwrap();
            assert_eq!(anna["name"], json!("Anna"));
            assert_eq!(anna.get("_token"), None);
        });
    }

    #[test]
    fn record_lookup_coerces_ids_numerically() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let store = setup_store(
                "ids.json",
                r#"{ "items": [ { "id": "7", "name": "as string" }, { "id": "x" } ] }"#,
            )
            .await;

            // A string id matches its numeric form (and vice versa)...
            assert_eq!(store.record("items", "7").unwrap()["name"], json!("as string"));
            assert_eq!(store.record("items", "7.0").is_some(), true);

            // Non-numeric ids never match...
            assert_eq!(store.record("items", "x"), None);
        });
    }

    #[test]
    fn insert_validates_and_persists() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let store = setup_store("insert.json", TEST_DOCUMENT).await;

            // An insert without an id is rejected...
            assert!(matches!(
                store.insert("users", json!({ "name": "Clara" })).await,
                Err(StoreError::MissingId)
            ));

            // ...as is a duplicate id, even across the string / number divide...
            assert!(matches!(
                store.insert("users", json!({ "id": "2", "name": "Ben II" })).await,
                Err(StoreError::Conflict)
            ));

            // ...and an unknown or private target collection...
            assert!(matches!(
                store.insert("missing", json!({ "id": 1 })).await,
                Err(StoreError::UnknownCollection)
            ));
            assert!(matches!(
                store.insert("_secrets", json!({ "id": 2 })).await,
                Err(StoreError::UnknownCollection)
            ));

            // A valid insert returns the redacted record and becomes readable...
            let stored = store
                .insert("users", json!({ "id": 3, "name": "Clara", "_note": "vip" }))
                .await
                .unwrap();
            assert_eq!(stored, json!({ "id": 3, "name": "Clara" }));
            assert_eq!(store.record("users", "3").is_some(), true);

            // ...and the file on disk contains the full record, private fields included...
            let disk = tokio::fs::read_to_string("target/store-tests/insert.json")
                .await
                .unwrap();
            assert_eq!(disk.contains("vip"), true);
            assert_eq!(disk.contains("hunter2"), true);
        });
    }

    #[test]
    fn update_replaces_the_record() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let store = setup_store("update.json", TEST_DOCUMENT).await;

            assert!(matches!(
                store.update("users", "9", json!({ "id": 9 })).await,
                Err(StoreError::UnknownRecord)
            ));

            // A replacement without an id is rejected and leaves the record untouched...
            assert!(matches!(
                store.update("users", "2", json!({ "name": "NoId" })).await,
                Err(StoreError::MissingId)
            ));
            assert_eq!(store.record("users", "2").unwrap()["name"], json!("Ben"));

            let stored = store
                .update("users", "2", json!({ "id": 2, "name": "Benjamin" }))
                .await
                .unwrap();
            assert_eq!(stored["name"], json!("Benjamin"));

            // The replacement is total, the previous fields are gone...
            let record = store.record("users", "2").unwrap();
            assert_eq!(record, json!({ "id": 2, "name": "Benjamin" }));
        });
    }

    #[test]
    fn delete_removes_the_record() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let store = setup_store("delete.json", TEST_DOCUMENT).await;

            store.delete("users", "1").await.unwrap();
            assert_eq!(store.record("users", "1"), None);

            // A second delete reports the record as gone...
            assert!(matches!(
                store.delete("users", "1").await,
                Err(StoreError::UnknownRecord)
            ));
        });
    }

    #[test]
    fn failed_persist_rolls_the_write_back() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();
        test_async(async {
            let store = setup_store("rollback.json", TEST_DOCUMENT).await;

            // Point the store at an unwritable location while keeping its state...
            let broken = Store {
                db_file: "target/store-tests/no/such/dir/db.json".into(),
                state: ArcSwap::new(store.state.load().clone()),
                write_lock: tokio::sync::Mutex::new(()),
            };

            assert!(matches!(
                broken.insert("users", json!({ "id": 5 })).await,
                Err(StoreError::Storage(_))
            ));

            // The failed write left no trace in the snapshot...
            assert_eq!(broken.record("users", "5"), None);
        });
    }
}
