//! Daily-bar repository. Written once per trading day per symbol from the
//! chart endpoint; the same widen-high/low conflict rule as minute bars
//! applies if a day is refreshed intraday.

use crate::domain::types::DailyBar;
use crate::infrastructure::persistence::database::Store;
use anyhow::Result;
use sqlx::Row;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct DailyCandle {
    pub symbol: String,
    /// "YYYYMMDD"
    pub trade_date: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: i64,
    pub trade_amount: Option<i64>,
    pub change_rate: Option<f64>,
}

impl DailyCandle {
    pub fn from_bar(symbol: &str, bar: &DailyBar) -> Self {
        Self {
            symbol: symbol.to_string(),
            trade_date: bar.trade_date.clone(),
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
            trade_amount: Some(bar.trade_amount),
            change_rate: Some(bar.change_rate),
        }
    }
}

const UPSERT_SQL: &str = r#"
INSERT INTO daily_candles (symbol, trade_date, open, high, low, close, volume, trade_amount, change_rate)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
ON CONFLICT (symbol, trade_date) DO UPDATE SET
    high = MAX(daily_candles.high, excluded.high),
    low = MIN(daily_candles.low, excluded.low),
    close = excluded.close,
    volume = excluded.volume,
    trade_amount = excluded.trade_amount,
    change_rate = excluded.change_rate
"#;

#[derive(Clone)]
pub struct DailyCandleRepository {
    store: Arc<Store>,
}

impl DailyCandleRepository {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn upsert(&self, candle: DailyCandle) -> Result<()> {
        self.upsert_batch(vec![candle]).await
    }

    pub async fn upsert_batch(&self, candles: Vec<DailyCandle>) -> Result<()> {
        self.store
            .write(move |pool| {
                Box::pin(async move {
                    let mut tx = pool.begin().await?;
                    for candle in &candles {
                        sqlx::query(UPSERT_SQL)
                            .bind(&candle.symbol)
                            .bind(&candle.trade_date)
                            .bind(candle.open)
                            .bind(candle.high)
                            .bind(candle.low)
                            .bind(candle.close)
                            .bind(candle.volume)
                            .bind(candle.trade_amount)
                            .bind(candle.change_rate)
                            .execute(&mut *tx)
                            .await?;
                    }
                    tx.commit().await?;
                    Ok(())
                })
            })
            .await
    }

    /// Most recent `count` days, oldest first.
    pub async fn recent(&self, symbol: &str, count: u32) -> Result<Vec<DailyCandle>> {
        let rows = sqlx::query(
            "SELECT symbol, trade_date, open, high, low, close, volume, trade_amount, change_rate
             FROM daily_candles WHERE symbol = ?1
             ORDER BY trade_date DESC LIMIT ?2",
        )
        .bind(symbol)
        .bind(count as i64)
        .fetch_all(self.store.reader())
        .await?;
        let mut candles: Vec<DailyCandle> = rows.iter().map(row_to_candle).collect();
        candles.reverse();
        Ok(candles)
    }

    /// Inclusive date range, oldest first.
    pub async fn range(&self, symbol: &str, from: &str, to: &str) -> Result<Vec<DailyCandle>> {
        let rows = sqlx::query(
            "SELECT symbol, trade_date, open, high, low, close, volume, trade_amount, change_rate
             FROM daily_candles
             WHERE symbol = ?1 AND trade_date >= ?2 AND trade_date <= ?3
             ORDER BY trade_date ASC",
        )
        .bind(symbol)
        .bind(from)
        .bind(to)
        .fetch_all(self.store.reader())
        .await?;
        Ok(rows.iter().map(row_to_candle).collect())
    }

    pub async fn has_at_least(&self, symbol: &str, n: u32) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM daily_candles WHERE symbol = ?1")
            .bind(symbol)
            .fetch_one(self.store.reader())
            .await?;
        Ok(row.get::<i64, _>("cnt") as u32 >= n)
    }
}

fn row_to_candle(row: &sqlx::sqlite::SqliteRow) -> DailyCandle {
    DailyCandle {
        symbol: row.get("symbol"),
        trade_date: row.get("trade_date"),
        open: row.get("open"),
        high: row.get("high"),
        low: row.get("low"),
        close: row.get("close"),
        volume: row.get("volume"),
        trade_amount: row.get("trade_amount"),
        change_rate: row.get("change_rate"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::database::MarketDataDb;

    fn candle(date: &str, close: i64) -> DailyCandle {
        DailyCandle {
            symbol: "005930".into(),
            trade_date: date.into(),
            open: close - 50,
            high: close + 100,
            low: close - 100,
            close,
            volume: 1_000_000,
            trade_amount: Some(close * 1_000_000),
            change_rate: Some(0.5),
        }
    }

    #[tokio::test]
    async fn recent_window_is_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let db = MarketDataDb::open(&dir.path().join("m.db")).await.unwrap();
        let repo = DailyCandleRepository::new(db.store());

        repo.upsert_batch(vec![
            candle("20250616", 100),
            candle("20250617", 110),
            candle("20250618", 120),
        ])
        .await
        .unwrap();

        let recent = repo.recent("005930", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].trade_date, "20250617");
        assert_eq!(recent[1].trade_date, "20250618");
        assert!(repo.has_at_least("005930", 3).await.unwrap());
        assert!(!repo.has_at_least("005930", 4).await.unwrap());
    }

    #[tokio::test]
    async fn refresh_widens_not_rewrites() {
        let dir = tempfile::tempdir().unwrap();
        let db = MarketDataDb::open(&dir.path().join("m.db")).await.unwrap();
        let repo = DailyCandleRepository::new(db.store());

        repo.upsert(candle("20250618", 120)).await.unwrap();
        let mut refreshed = candle("20250618", 125);
        refreshed.high = 130;
        refreshed.low = 50;
        repo.upsert(refreshed).await.unwrap();

        let bars = repo.range("005930", "20250618", "20250618").await.unwrap();
        assert_eq!(bars[0].close, 125);
        assert_eq!(bars[0].high, 220); // max(old 220, new 130)
        assert_eq!(bars[0].low, 20); // min(old 20, new 50)
    }
}
