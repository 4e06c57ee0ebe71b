use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

pub type WriteJob = Box<dyn FnOnce(SqlitePool) -> BoxFuture<'static, Result<()>> + Send>;

enum Request {
    Job {
        job: WriteJob,
        ack: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

/// One SQLite database with serialized writes.
///
/// A single writer task owns the write connection and drains a request
/// channel; callers enqueue a job and await its acknowledgement. Readers
/// share a small pool. SQLite-level contention therefore never occurs on
/// the write path regardless of how many tasks produce data.
pub struct Store {
    read: SqlitePool,
    write_tx: mpsc::Sender<Request>,
}

impl Store {
    pub async fn open(path: &Path, schema: &str) -> Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create database directory")?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let write = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options.clone())
            .await
            .context("failed to open write connection")?;
        let read = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open read pool")?;

        for statement in schema.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement)
                .execute(&write)
                .await
                .with_context(|| format!("schema statement failed: {statement}"))?;
        }

        let (write_tx, mut rx) = mpsc::channel::<Request>(256);
        let writer_pool = write.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    Request::Job { job, ack } => {
                        let result = job(writer_pool.clone()).await;
                        if let Err(e) = &result {
                            error!("store write failed: {e:#}");
                        }
                        let _ = ack.send(result);
                    }
                    Request::Shutdown => break,
                }
            }
            writer_pool.close().await;
        });

        info!("store opened: {}", path.display());
        Ok(Arc::new(Self { read, write_tx }))
    }

    /// Enqueue a write job and wait for the writer task to apply it.
    pub async fn write<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(SqlitePool) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let (ack, done) = oneshot::channel();
        self.write_tx
            .send(Request::Job {
                job: Box::new(job),
                ack,
            })
            .await
            .map_err(|_| anyhow::anyhow!("store writer task is gone"))?;
        done.await
            .map_err(|_| anyhow::anyhow!("store writer dropped the job"))?
    }

    pub fn reader(&self) -> &SqlitePool {
        &self.read
    }

    pub async fn close(&self) {
        let _ = self.write_tx.send(Request::Shutdown).await;
        self.read.close().await;
    }
}

const MARKET_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS minute_candles (
    symbol TEXT NOT NULL,
    candle_datetime TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    open INTEGER NOT NULL,
    high INTEGER NOT NULL,
    low INTEGER NOT NULL,
    close INTEGER NOT NULL,
    volume INTEGER NOT NULL,
    updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (symbol, candle_datetime)
);
CREATE INDEX IF NOT EXISTS idx_minute_symbol_date ON minute_candles (symbol, trade_date);
CREATE TABLE IF NOT EXISTS daily_candles (
    symbol TEXT NOT NULL,
    trade_date TEXT NOT NULL,
    open INTEGER NOT NULL,
    high INTEGER NOT NULL,
    low INTEGER NOT NULL,
    close INTEGER NOT NULL,
    volume INTEGER NOT NULL,
    trade_amount INTEGER,
    change_rate REAL,
    PRIMARY KEY (symbol, trade_date)
)
"#;

const TRADING_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    name TEXT NOT NULL,
    side TEXT NOT NULL,
    order_type TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    price INTEGER NOT NULL,
    filled_quantity INTEGER NOT NULL DEFAULT 0,
    filled_price INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    strategy_name TEXT,
    pnl INTEGER,
    pnl_rate REAL,
    avg_cost REAL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_symbol_created ON orders (symbol, created_at);
CREATE TABLE IF NOT EXISTS positions (
    symbol TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    avg_price REAL NOT NULL,
    current_price INTEGER NOT NULL,
    strategy_name TEXT,
    entry_order_id TEXT,
    entry_time TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS daily_summary (
    trade_date TEXT PRIMARY KEY,
    total_trades INTEGER NOT NULL,
    realized_pnl INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    event_type TEXT NOT NULL,
    module TEXT NOT NULL,
    correlation_id TEXT,
    session_id TEXT,
    symbol TEXT,
    name TEXT,
    order_id TEXT,
    side TEXT,
    quantity INTEGER,
    price REAL,
    amount REAL,
    strategy_name TEXT,
    status TEXT,
    reason TEXT,
    metadata TEXT,
    checksum TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log (timestamp);
CREATE INDEX IF NOT EXISTS idx_audit_symbol ON audit_log (symbol);
CREATE INDEX IF NOT EXISTS idx_audit_order ON audit_log (order_id)
"#;

/// Candle store, shared across paper and live.
pub struct MarketDataDb {
    store: Arc<Store>,
}

impl MarketDataDb {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            store: Store::open(path, MARKET_SCHEMA).await?,
        })
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

/// Orders/positions/summary store, one per trading mode.
pub struct TradingDb {
    store: Arc<Store>,
}

impl TradingDb {
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            store: Store::open(path, TRADING_SCHEMA).await?,
        })
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn writer_task_applies_jobs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("t.db"), "CREATE TABLE t (v INTEGER)")
            .await
            .unwrap();

        for v in 0..10i64 {
            store
                .write(move |pool| {
                    Box::pin(async move {
                        sqlx::query("INSERT INTO t (v) VALUES (?1)")
                            .bind(v)
                            .execute(&pool)
                            .await?;
                        Ok(())
                    })
                })
                .await
                .unwrap();
        }

        let rows = sqlx::query("SELECT v FROM t ORDER BY rowid")
            .fetch_all(store.reader())
            .await
            .unwrap();
        let values: Vec<i64> = rows.iter().map(|r| r.get::<i64, _>("v")).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn schemas_create_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        MarketDataDb::open(&dir.path().join("m.db")).await.unwrap();
        TradingDb::open(&dir.path().join("t.db")).await.unwrap();
    }
}
