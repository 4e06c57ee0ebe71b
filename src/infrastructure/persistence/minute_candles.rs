//! Minute-bar OHLCV repository.
//!
//! Real-time bar assembly: the first upsert inside a minute sets
//! O=H=L=C to the tick price; later upserts widen high/low, move the
//! close and overwrite the (cumulative) volume.

use crate::infrastructure::persistence::database::Store;
use anyhow::{Context, Result};
use sqlx::Row;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct MinuteCandle {
    pub symbol: String,
    /// "YYYY-MM-DD HH:MM"
    pub candle_datetime: String,
    /// "YYYYMMDD"
    pub trade_date: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
}

impl MinuteCandle {
    /// "HH:MM" portion of the bar key.
    pub fn time_str(&self) -> &str {
        self.candle_datetime
            .split_once(' ')
            .map(|(_, t)| t)
            .unwrap_or("")
    }
}

/// "YYYYMMDD_HHMM" -> ("YYYY-MM-DD HH:MM", "YYYYMMDD")
fn split_minute_key(key: &str) -> Result<(String, String)> {
    let (date, time) = key
        .split_once('_')
        .with_context(|| format!("bad minute key: {key}"))?;
    if date.len() != 8 || time.len() != 4 {
        anyhow::bail!("bad minute key: {key}");
    }
    let datetime = format!(
        "{}-{}-{} {}:{}",
        &date[..4],
        &date[4..6],
        &date[6..8],
        &time[..2],
        &time[2..4]
    );
    Ok((datetime, date.to_string()))
}

const UPSERT_SQL: &str = r#"
INSERT INTO minute_candles (symbol, candle_datetime, trade_date, open, high, low, close, volume)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT (symbol, candle_datetime) DO UPDATE SET
    high = MAX(minute_candles.high, excluded.high),
    low = MIN(minute_candles.low, excluded.low),
    close = excluded.close,
    volume = excluded.volume,
    updated_at = CURRENT_TIMESTAMP
"#;

#[derive(Clone)]
pub struct MinuteCandleRepository {
    store: Arc<Store>,
}

impl MinuteCandleRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Fold one realtime price observation into the bar at `minute_key`
    /// ("YYYYMMDD_HHMM"). `volume` is the broker's cumulative session
    /// volume and overwrites the stored value.
    pub async fn upsert_realtime(
        &self,
        symbol: &str,
        price: i64,
        volume: i64,
        minute_key: &str,
    ) -> Result<()> {
        let (datetime, date) = split_minute_key(minute_key)?;
        let symbol = symbol.to_string();
        self.store
            .write(move |pool| {
                Box::pin(async move {
                    sqlx::query(UPSERT_SQL)
                        .bind(&symbol)
                        .bind(&datetime)
                        .bind(&date)
                        .bind(price)
                        .bind(price)
                        .bind(price)
                        .bind(price)
                        .bind(volume)
                        .execute(&pool)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    /// Upsert a full bar (history backfill). The same conflict rule
    /// applies, so replaying history over live bars can only widen them.
    pub async fn upsert_bar(&self, candle: MinuteCandle) -> Result<()> {
        self.store
            .write(move |pool| {
                Box::pin(async move {
                    sqlx::query(UPSERT_SQL)
                        .bind(&candle.symbol)
                        .bind(&candle.candle_datetime)
                        .bind(&candle.trade_date)
                        .bind(candle.open)
                        .bind(candle.high)
                        .bind(candle.low)
                        .bind(candle.close)
                        .bind(candle.volume)
                        .execute(&pool)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    pub async fn upsert_batch(&self, candles: Vec<MinuteCandle>) -> Result<()> {
        self.store
            .write(move |pool| {
                Box::pin(async move {
                    let mut tx = pool.begin().await?;
                    for candle in &candles {
                        sqlx::query(UPSERT_SQL)
                            .bind(&candle.symbol)
                            .bind(&candle.candle_datetime)
                            .bind(&candle.trade_date)
                            .bind(candle.open)
                            .bind(candle.high)
                            .bind(candle.low)
                            .bind(candle.close)
                            .bind(candle.volume)
                            .execute(&mut *tx)
                            .await?;
                    }
                    tx.commit().await?;
                    Ok(())
                })
            })
            .await
    }

    /// Last `count` bars, oldest first.
    pub async fn recent(&self, symbol: &str, count: u32) -> Result<Vec<MinuteCandle>> {
        let rows = sqlx::query(
            "SELECT symbol, candle_datetime, trade_date, open, high, low, close, volume
             FROM minute_candles WHERE symbol = ?1
             ORDER BY candle_datetime DESC LIMIT ?2",
        )
        .bind(symbol)
        .bind(count as i64)
        .fetch_all(self.store.reader())
        .await?;

        let mut candles: Vec<MinuteCandle> = rows.iter().map(row_to_candle).collect();
        candles.reverse();
        Ok(candles)
    }

    /// Every bar of one trading date, in time order.
    pub async fn for_date(&self, symbol: &str, trade_date: &str) -> Result<Vec<MinuteCandle>> {
        let rows = sqlx::query(
            "SELECT symbol, candle_datetime, trade_date, open, high, low, close, volume
             FROM minute_candles WHERE symbol = ?1 AND trade_date = ?2
             ORDER BY candle_datetime ASC",
        )
        .bind(symbol)
        .bind(trade_date)
        .fetch_all(self.store.reader())
        .await?;
        Ok(rows.iter().map(row_to_candle).collect())
    }

    pub async fn count(&self, symbol: &str) -> Result<u32> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM minute_candles WHERE symbol = ?1")
            .bind(symbol)
            .fetch_one(self.store.reader())
            .await?;
        Ok(row.get::<i64, _>("cnt") as u32)
    }

    /// Strategy precondition: enough minute history to compute indicators.
    pub async fn has_at_least(&self, symbol: &str, n: u32) -> Result<bool> {
        Ok(self.count(symbol).await? >= n)
    }
}

fn row_to_candle(row: &sqlx::sqlite::SqliteRow) -> MinuteCandle {
    MinuteCandle {
        symbol: row.get("symbol"),
        candle_datetime: row.get("candle_datetime"),
        trade_date: row.get("trade_date"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::MarketDataDb;

    async fn repo() -> (tempfile::TempDir, MinuteCandleRepository) {
        let dir = tempfile::tempdir().unwrap();
        let db = MarketDataDb::open(&dir.path().join("m.db")).await.unwrap();
        (dir, MinuteCandleRepository::new(db.store()))
    }

    #[test]
    fn minute_key_splits() {
        let (dt, date) = split_minute_key("20250618_0930").unwrap();
        assert_eq!(dt, "2025-06-18 09:30");
        assert_eq!(date, "20250618");
        assert!(split_minute_key("garbage").is_err());
    }

    #[tokio::test]
    async fn realtime_upserts_assemble_a_bar() {
        let (_dir, repo) = repo().await;

        // First tick opens the bar, later ticks widen H/L and move C.
        repo.upsert_realtime("005930", 100, 10, "20250618_0930").await.unwrap();
        repo.upsert_realtime("005930", 105, 25, "20250618_0930").await.unwrap();
        repo.upsert_realtime("005930", 98, 40, "20250618_0930").await.unwrap();
        repo.upsert_realtime("005930", 101, 55, "20250618_0930").await.unwrap();

        let bars = repo.for_date("005930", "20250618").await.unwrap();
        assert_eq!(bars.len(), 1);
        let bar = &bars[0];
        assert_eq!(bar.open, 100);
        assert_eq!(bar.high, 105);
        assert_eq!(bar.low, 98);
        assert_eq!(bar.close, 101);
        assert_eq!(bar.volume, 55);
    }

    #[tokio::test]
    async fn recent_returns_oldest_first_window() {
        let (_dir, repo) = repo().await;
        for minute in 0..5 {
            let key = format!("20250618_093{minute}");
            repo.upsert_realtime("005930", 100 + minute, 10, &key).await.unwrap();
        }

        let recent = repo.recent("005930", 3).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].close, 102);
        assert_eq!(recent[2].close, 104);
        assert!(recent[0].candle_datetime < recent[2].candle_datetime);
    }

    #[tokio::test]
    async fn has_at_least_counts_per_symbol() {
        let (_dir, repo) = repo().await;
        repo.upsert_realtime("005930", 100, 1, "20250618_0930").await.unwrap();
        repo.upsert_realtime("000660", 100, 1, "20250618_0930").await.unwrap();
        assert!(repo.has_at_least("005930", 1).await.unwrap());
        assert!(!repo.has_at_least("005930", 2).await.unwrap());
    }

    #[tokio::test]
    async fn batch_upsert_is_transactional() {
        let (_dir, repo) = repo().await;
        let candles: Vec<MinuteCandle> = (0..30)
            .map(|i| MinuteCandle {
                symbol: "233740".into(),
                candle_datetime: format!("2025-06-18 09:{:02}", i),
                trade_date: "20250618".into(),
                open: 100,
                high: 110,
                low: 95,
                close: 105,
                volume: 1_000,
            })
            .collect();
        repo.upsert_batch(candles).await.unwrap();
        assert_eq!(repo.count("233740").await.unwrap(), 30);
    }
}
