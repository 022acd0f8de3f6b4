use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, params};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::models::{Classification, Product, ScanEntry, StoreStats, validate_product};

pub type StoreResult<T> = Result<T, StoreError>;

/// Rows per transaction when `replace_all` drives the import itself.
pub const DEFAULT_BATCH_SIZE: usize = 500;

const STAGING_TABLE: &str = "products_staging";
const META_VERSION_MARKER: &str = "version_marker";
const META_PHRASE_TABLE_VERSION: &str = "phrase_table_version";

const PRODUCT_COLUMNS: &str = "code, name, ingredients, palm_oil_tags, palm_oil_may_be_tags, \
     image_url, nutriscore_grade, nova_group, nutrient_levels, additives_tags, last_updated";

fn products_table_ddl(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            code TEXT PRIMARY KEY NOT NULL,
            name TEXT,
            ingredients TEXT,
            palm_oil_tags TEXT NOT NULL DEFAULT '[]',
            palm_oil_may_be_tags TEXT NOT NULL DEFAULT '[]',
            image_url TEXT,
            nutriscore_grade TEXT,
            nova_group INTEGER,
            nutrient_levels TEXT NOT NULL DEFAULT '{{}}',
            additives_tags TEXT NOT NULL DEFAULT '[]',
            last_updated INTEGER NOT NULL DEFAULT 0
        );"
    )
}

/// Values written alongside a successful import, in the same transaction
/// that installs the new generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub version_marker: i64,
    pub phrase_table_version: i64,
}

/// Durable product catalog keyed by barcode.
///
/// One connection guarded by a mutex: readers and the import writer take
/// turns at batch granularity. A full-replace import never touches the live
/// table until its final swap, so readers only ever observe a complete
/// generation.
pub struct ProductStore {
    conn: Mutex<Connection>,
    importing: AtomicBool,
}

impl ProductStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> anyhow::Result<Self> {
        migrate(&conn).context("Failed to migrate database")?;
        // Leftover from an import interrupted by a crash.
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {STAGING_TABLE};"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            importing: AtomicBool::new(false),
        })
    }

    pub fn close(self) -> StoreResult<()> {
        let conn = self
            .conn
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        conn.close().map_err(|(_, e)| StoreError::Database(e))
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Products ---

    pub fn get(&self, code: &str) -> StoreResult<Option<Product>> {
        let conn = self.lock();
        let product = conn
            .query_row(
                &format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE code = ?1"),
                params![code],
                product_from_row,
            )
            .optional()?;
        Ok(product)
    }

    pub fn count(&self) -> StoreResult<i64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))?)
    }

    pub fn stats(&self) -> StoreResult<StoreStats> {
        let conn = self.lock();
        let (product_count, last_updated) = conn.query_row(
            "SELECT COUNT(*), MAX(NULLIF(last_updated, 0)) FROM products",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(StoreStats {
            product_count,
            last_updated,
            version_marker: get_meta(&conn, META_VERSION_MARKER)?,
            phrase_table_version: get_meta(&conn, META_PHRASE_TABLE_VERSION)?,
        })
    }

    /// Dataset generation currently installed, if any import has completed.
    pub fn version_marker(&self) -> StoreResult<Option<i64>> {
        let conn = self.lock();
        get_meta(&conn, META_VERSION_MARKER)
    }

    /// Start a full-replace import. Only one may be open at a time.
    pub fn begin_import(&self) -> StoreResult<ImportSession<'_>> {
        if self
            .importing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StoreError::ImportInProgress);
        }
        let session = ImportSession {
            store: self,
            committed: 0,
            batches: 0,
            finished: false,
        };
        self.lock().execute_batch(&format!(
            "DROP TABLE IF EXISTS {STAGING_TABLE};
             {}",
            products_table_ddl(STAGING_TABLE)
        ))?;
        debug!("import started");
        Ok(session)
    }

    /// Replace the whole catalog with `records`, committed in fixed-size
    /// batches. `on_batch` receives the running count after each batch. On
    /// error the previous contents stay in place.
    pub fn replace_all<I>(&self, records: I, mut on_batch: impl FnMut(u64)) -> StoreResult<u64>
    where
        I: IntoIterator<Item = Product>,
    {
        let mut session = self.begin_import()?;
        let mut batch = Vec::with_capacity(DEFAULT_BATCH_SIZE);
        for product in records {
            batch.push(product);
            if batch.len() == DEFAULT_BATCH_SIZE {
                on_batch(session.commit_batch(&batch)?);
                batch.clear();
            }
        }
        if !batch.is_empty() {
            on_batch(session.commit_batch(&batch)?);
        }
        session.finish(None)
    }

    // --- Scan history ---

    pub fn record_scan(
        &self,
        code: &str,
        product: Option<&Product>,
        status: Option<Classification>,
    ) -> StoreResult<()> {
        let now = Utc::now().timestamp_millis();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO scan_history (code, scanned_at, found, product_name, status, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, (SELECT COALESCE(MAX(seq), 0) + 1 FROM scan_history))
             ON CONFLICT(code) DO UPDATE SET
                scanned_at = excluded.scanned_at,
                found = excluded.found,
                product_name = excluded.product_name,
                status = excluded.status,
                seq = excluded.seq",
            params![
                code,
                now,
                product.is_some(),
                product.and_then(|p| p.name.as_deref()),
                status.map(Classification::as_str),
            ],
        )?;
        Ok(())
    }

    /// Most recent scans first.
    pub fn recent_scans(&self, limit: i64) -> StoreResult<Vec<ScanEntry>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT code, scanned_at, found, product_name, status
             FROM scan_history ORDER BY seq DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                let status: Option<String> = row.get(4)?;
                Ok(ScanEntry {
                    code: row.get(0)?,
                    scanned_at: row.get(1)?,
                    found: row.get(2)?,
                    product_name: row.get(3)?,
                    status: status.as_deref().and_then(Classification::parse),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }
}

/// An open full-replace import: `begin_import`, then `commit_batch` any
/// number of times, then `finish`. Batches land in a staging table, each in
/// its own short transaction; `finish` swaps staging into place atomically.
/// Dropping an unfinished session discards the staging table.
pub struct ImportSession<'a> {
    store: &'a ProductStore,
    committed: u64,
    batches: u64,
    finished: bool,
}

impl ImportSession<'_> {
    #[must_use]
    pub fn committed(&self) -> u64 {
        self.committed
    }

    /// Insert one batch into the staging generation. Any invalid or duplicate
    /// record fails the whole batch.
    pub fn commit_batch(&mut self, batch: &[Product]) -> StoreResult<u64> {
        let mut conn = self.store.lock();
        let tx = conn.transaction()?;
        insert_products(&tx, STAGING_TABLE, batch)?;
        tx.commit()?;
        drop(conn);

        self.batches += 1;
        self.committed += batch.len() as u64;
        debug!(
            batch = self.batches,
            committed = self.committed,
            "import batch committed"
        );
        Ok(self.committed)
    }

    /// Install the staged generation and, when given, its version marker.
    pub fn finish(mut self, generation: Option<Generation>) -> StoreResult<u64> {
        {
            let mut conn = self.store.lock();
            let tx = conn.transaction()?;
            tx.execute_batch(&format!(
                "DROP TABLE products;
                 ALTER TABLE {STAGING_TABLE} RENAME TO products;
                 CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);"
            ))?;
            if let Some(generation) = generation {
                set_meta(&tx, META_VERSION_MARKER, generation.version_marker)?;
                set_meta(
                    &tx,
                    META_PHRASE_TABLE_VERSION,
                    generation.phrase_table_version,
                )?;
            }
            tx.commit()?;
        }
        self.finished = true;
        info!(
            records = self.committed,
            batches = self.batches,
            "import installed"
        );
        Ok(self.committed)
    }
}

impl Drop for ImportSession<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let conn = self.store.lock();
            if let Err(e) = conn.execute_batch(&format!("DROP TABLE IF EXISTS {STAGING_TABLE};")) {
                warn!("failed to discard staged import: {e}");
            } else {
                debug!(committed = self.committed, "staged import discarded");
            }
        }
        self.store.importing.store(false, Ordering::Release);
    }
}

fn migrate(conn: &Connection) -> StoreResult<()> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version < 1 {
        conn.execute_batch(&format!(
            "{}
             CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);

             CREATE TABLE IF NOT EXISTS sync_meta (
                 key TEXT PRIMARY KEY NOT NULL,
                 value INTEGER NOT NULL,
                 updated_at INTEGER NOT NULL
             );

             PRAGMA user_version = 1;",
            products_table_ddl("products")
        ))?;
    }

    if version < 2 {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scan_history (
                code TEXT PRIMARY KEY NOT NULL,
                scanned_at INTEGER NOT NULL,
                found INTEGER NOT NULL,
                product_name TEXT,
                status TEXT,
                seq INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_scan_history_seq ON scan_history(seq);

            PRAGMA user_version = 2;",
        )?;
    }

    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> StoreResult<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT value FROM sync_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

fn set_meta(tx: &Transaction, key: &str, value: i64) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn insert_products(tx: &Transaction, table: &str, batch: &[Product]) -> StoreResult<()> {
    let mut stmt = tx.prepare_cached(&format!(
        "INSERT INTO {table} ({PRODUCT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
    ))?;
    for p in batch {
        validate_product(p).map_err(|e| StoreError::InvalidRecord {
            code: p.code.clone(),
            reason: e.to_string(),
        })?;
        let result = stmt.execute(params![
            p.code,
            p.name,
            p.ingredients,
            serde_json::to_string(&p.palm_oil_tags)?,
            serde_json::to_string(&p.palm_oil_may_be_tags)?,
            p.image_url,
            p.nutriscore_grade,
            p.nova_group,
            serde_json::to_string(&p.nutrient_levels)?,
            serde_json::to_string(&p.additives_tags)?,
            p.last_updated,
        ]);
        match result {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::InvalidRecord {
                    code: p.code.clone(),
                    reason: "duplicate code".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn product_from_row(row: &rusqlite::Row) -> rusqlite::Result<Product> {
    Ok(Product {
        code: row.get(0)?,
        name: row.get(1)?,
        ingredients: row.get(2)?,
        palm_oil_tags: json_column(row, 3)?,
        palm_oil_may_be_tags: json_column(row, 4)?,
        image_url: row.get(5)?,
        nutriscore_grade: row.get(6)?,
        nova_group: row.get(7)?,
        nutrient_levels: json_column(row, 8)?,
        additives_tags: json_column(row, 9)?,
        last_updated: row.get(10)?,
    })
}
