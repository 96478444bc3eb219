//! Embedded SQLite store implementation.
use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use bitcoin::{BlockHash, OutPoint, Txid};
use rusqlite::{params, params_from_iter, types::Value, Connection, OptionalExtension};
use tokio::task;

use crate::store::{
    FundedOutpoint, InputRow, NewBlock, OutputRow, Store, StoredBlock, TrackedAddress,
};

/// How long a connection waits on a locked database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Addresses per `IN (...)` list; keeps statements under SQLite's variable limit.
const ADDRESS_QUERY_CHUNK: usize = 500;
const OUTPOINT_QUERY_CHUNK: usize = 250;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id      INTEGER PRIMARY KEY,
        label   TEXT NOT NULL,
        tracked INTEGER NOT NULL DEFAULT 1
    );
    CREATE TABLE IF NOT EXISTS addresses (
        address    TEXT PRIMARY KEY,
        account_id INTEGER REFERENCES accounts(id),
        tracked    INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS denylist (
        address TEXT PRIMARY KEY
    );
    CREATE TABLE IF NOT EXISTS blocks (
        id        INTEGER PRIMARY KEY,
        height    INTEGER NOT NULL,
        hash      TEXT NOT NULL UNIQUE,
        time      INTEGER NOT NULL,
        parent_id INTEGER REFERENCES blocks(id)
    );
    CREATE TABLE IF NOT EXISTS transactions (
        txid     TEXT PRIMARY KEY,
        block_id INTEGER REFERENCES blocks(id)
    );
    CREATE TABLE IF NOT EXISTS outputs (
        txid       TEXT NOT NULL,
        vout       INTEGER NOT NULL,
        address    TEXT NOT NULL,
        value      INTEGER NOT NULL,
        account_id INTEGER,
        PRIMARY KEY (txid, vout)
    );
    CREATE TABLE IF NOT EXISTS inputs (
        txid      TEXT NOT NULL,
        vin       INTEGER NOT NULL,
        prev_txid TEXT NOT NULL,
        prev_vout INTEGER NOT NULL,
        address   TEXT NOT NULL,
        PRIMARY KEY (txid, vin)
    );
"#;

/// Tables:
///   accounts(id, label, tracked)
///   addresses(address, account_id, tracked)   tracked directly, or via a tracked account
///   denylist(address)                         never reported as tracked
///   blocks(id, height, hash, time, parent_id)
///   transactions(txid, block_id)              block_id NULL while unconfirmed
///   outputs(txid, vout, address, value, account_id)
///   inputs(txid, vin, prev_txid, prev_vout, address)
///
/// Every call opens its own connection on the blocking pool, so workers can
/// hit the database in parallel; WAL mode plus a busy timeout absorb lock
/// contention.
pub struct SqliteStore {
    path: PathBuf,
}

impl SqliteStore {
    /// Creates/initializes the SQLite file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let conn = Self::connect(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA).context("create schema")?;
        Ok(Self { path })
    }

    fn connect(path: &PathBuf) -> anyhow::Result<Connection> {
        let conn = Connection::open(path)
            .with_context(|| format!("open sqlite at {}", path.display()))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        task::spawn_blocking(move || {
            let mut conn = Self::connect(&path)?;
            f(&mut conn)
        })
        .await?
    }

    /// Register an account; addresses attached to it are tracked while the account is.
    pub async fn add_account(&self, label: &str, tracked: bool) -> anyhow::Result<i64> {
        let label = label.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO accounts(label, tracked) VALUES(?1, ?2)",
                params![label, tracked],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    /// Track a single address directly.
    pub async fn track_address(&self, address: &str) -> anyhow::Result<()> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO addresses(address, tracked) VALUES(?1, 1)
                 ON CONFLICT(address) DO UPDATE SET tracked = 1",
                params![address],
            )?;
            Ok(())
        })
        .await
    }

    /// Attach an address to an account.
    pub async fn add_account_address(&self, account_id: i64, address: &str) -> anyhow::Result<()> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO addresses(address, account_id) VALUES(?1, ?2)
                 ON CONFLICT(address) DO UPDATE SET account_id = excluded.account_id",
                params![address, account_id],
            )?;
            Ok(())
        })
        .await
    }

    /// Exclude an address from matching regardless of tracking.
    pub async fn deny_address(&self, address: &str) -> anyhow::Result<()> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO denylist(address) VALUES(?1)",
                params![address],
            )?;
            Ok(())
        })
        .await
    }

    /// Block id a transaction is confirmed in; `None` if unknown or unconfirmed.
    pub async fn transaction_block(&self, txid: Txid) -> anyhow::Result<Option<i64>> {
        self.with_conn(move |conn| {
            let id = conn
                .query_row(
                    "SELECT block_id FROM transactions WHERE txid = ?1",
                    params![txid.to_string()],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()?;
            Ok(id.flatten())
        })
        .await
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn insert_transaction(conn: &Connection, txid: &Txid) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR IGNORE INTO transactions(txid) VALUES(?1)",
        params![txid.to_string()],
    )
}

#[async_trait]
impl Store for SqliteStore {
    async fn get_block_by_hash(&self, hash: BlockHash) -> anyhow::Result<Option<StoredBlock>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT id, height FROM blocks WHERE hash = ?1",
                    params![hash.to_string()],
                    |row| {
                        Ok(StoredBlock {
                            id: row.get(0)?,
                            height: row.get(1)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn add_block(&self, block: NewBlock) -> anyhow::Result<i64> {
        self.with_conn(move |conn| {
            let id = conn
                .query_row(
                    "INSERT INTO blocks(height, hash, time, parent_id) VALUES(?1, ?2, ?3, ?4)
                     ON CONFLICT(hash) DO UPDATE SET
                        height = excluded.height,
                        time = excluded.time,
                        parent_id = excluded.parent_id
                     RETURNING id",
                    params![
                        block.height,
                        block.hash.to_string(),
                        block.time,
                        block.parent_id
                    ],
                    |row| row.get(0),
                )
                .with_context(|| format!("insert block {} @{}", block.hash, block.height))?;
            Ok(id)
        })
        .await
    }

    async fn find_tracked_addresses(
        &self,
        addresses: &[String],
    ) -> anyhow::Result<Vec<TrackedAddress>> {
        let addresses = addresses.to_vec();
        self.with_conn(move |conn| {
            let mut found = Vec::new();
            for chunk in addresses.chunks(ADDRESS_QUERY_CHUNK) {
                let sql = format!(
                    "SELECT a.address, a.account_id
                     FROM addresses a
                     LEFT JOIN accounts ac ON ac.id = a.account_id
                     WHERE a.address IN ({})
                       AND (a.tracked = 1 OR ac.tracked = 1)
                       AND a.address NOT IN (SELECT address FROM denylist)",
                    placeholders(chunk.len())
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    Ok(TrackedAddress {
                        address: row.get(0)?,
                        account_id: row.get(1)?,
                    })
                })?;
                for row in rows {
                    found.push(row?);
                }
            }
            Ok(found)
        })
        .await
    }

    async fn find_known_outpoints(
        &self,
        outpoints: &[OutPoint],
    ) -> anyhow::Result<Vec<FundedOutpoint>> {
        if outpoints.is_empty() {
            return Ok(Vec::new());
        }
        let outpoints = outpoints.to_vec();
        self.with_conn(move |conn| {
            let mut found = Vec::new();
            for chunk in outpoints.chunks(OUTPOINT_QUERY_CHUNK) {
                let sql = format!(
                    "SELECT txid, vout, address FROM outputs
                     WHERE (txid, vout) IN (VALUES {})",
                    vec!["(?, ?)"; chunk.len()].join(",")
                );
                let values = chunk.iter().flat_map(|op| {
                    [
                        Value::Text(op.txid.to_string()),
                        Value::Integer(i64::from(op.vout)),
                    ]
                });

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(values), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?;
                for row in rows {
                    let (txid, vout, address) = row?;
                    let txid = Txid::from_str(&txid).context("parse outputs.txid")?;
                    found.push(FundedOutpoint {
                        outpoint: OutPoint::new(txid, vout),
                        address,
                    });
                }
            }
            Ok(found)
        })
        .await
    }

    async fn save_outputs(&self, rows: &[OutputRow]) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for row in &rows {
                insert_transaction(&tx, &row.txid)?;
                tx.execute(
                    "INSERT OR IGNORE INTO outputs(txid, vout, address, value, account_id)
                     VALUES(?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.txid.to_string(),
                        row.vout,
                        row.address,
                        i64::try_from(row.value).context("output value overflows i64")?,
                        row.account_id
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn save_inputs(&self, rows: &[InputRow]) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let rows = rows.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for row in &rows {
                insert_transaction(&tx, &row.txid)?;
                tx.execute(
                    "INSERT OR IGNORE INTO inputs(txid, vin, prev_txid, prev_vout, address)
                     VALUES(?1, ?2, ?3, ?4, ?5)",
                    params![
                        row.txid.to_string(),
                        row.vin,
                        row.prevout.txid.to_string(),
                        row.prevout.vout,
                        row.address
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn confirm_transactions(&self, ids: &[Txid], block_id: i64) -> anyhow::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute(
                    "INSERT INTO transactions(txid, block_id) VALUES(?1, ?2)
                     ON CONFLICT(txid) DO UPDATE SET block_id = excluded.block_id",
                    params![id.to_string(), block_id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
