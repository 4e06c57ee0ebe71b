//! Append-only audit trail.
//!
//! Every order and position event lands in the trading store with a
//! SHA-256-derived checksum over its canonical JSON form (sorted keys,
//! digest truncated to 32 hex chars). `verify_integrity` replays the table
//! and reports any record whose recomputed checksum disagrees.

use crate::infrastructure::persistence::database::Store;
use anyhow::Result;
use chrono::Local;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::Row;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::error;

/// Order events: ORDER_SUBMIT, ORDER_FILLED, ORDER_CANCELLED, ORDER_REJECTED.
#[derive(Debug, Clone)]
pub struct OrderAuditEvent {
    pub event_type: &'static str,
    pub module: &'static str,
    pub symbol: String,
    pub name: String,
    pub order_id: Option<String>,
    pub side: String,
    pub quantity: u32,
    pub price: f64,
    pub strategy_name: String,
    pub status: &'static str,
    pub reason: Option<String>,
    pub metadata: Option<Value>,
}

/// Position events: POSITION_OPEN, POSITION_UPDATE, POSITION_CLOSE,
/// POSITION_SYNC.
#[derive(Debug, Clone)]
pub struct PositionAuditEvent {
    pub event_type: &'static str,
    pub module: &'static str,
    pub symbol: String,
    pub name: String,
    pub quantity: u32,
    pub avg_price: f64,
    pub current_price: i64,
    pub profit_loss: i64,
    pub profit_rate: f64,
    pub strategy_name: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct IntegrityReport {
    pub total: u64,
    pub valid: u64,
    pub invalid: u64,
    pub mismatched_ids: Vec<i64>,
}

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<Store>,
    session_id: String,
}

impl AuditLog {
    pub fn new(store: Arc<Store>, session_id: &str) -> Self {
        Self {
            store,
            session_id: session_id.to_string(),
        }
    }

    /// Record an order event. Audit failures are logged, never propagated:
    /// the trail must not interfere with trading.
    pub async fn log_order(&self, event: OrderAuditEvent) {
        let amount = if event.quantity > 0 && event.price > 0.0 {
            Some(event.quantity as f64 * event.price)
        } else {
            None
        };
        let mut data = BTreeMap::new();
        data.insert("timestamp", Value::String(Local::now().naive_local().to_string()));
        data.insert("event_type", Value::String(event.event_type.to_string()));
        data.insert("module", Value::String(event.module.to_string()));
        data.insert("correlation_id", Value::Null);
        data.insert("session_id", Value::String(self.session_id.clone()));
        data.insert("symbol", Value::String(event.symbol.clone()));
        data.insert("name", Value::String(event.name.clone()));
        data.insert("order_id", opt_string(event.order_id.clone()));
        data.insert("side", Value::String(event.side.clone()));
        data.insert("quantity", Value::from(event.quantity));
        data.insert("price", Value::from(event.price));
        data.insert("amount", amount.map(Value::from).unwrap_or(Value::Null));
        data.insert("strategy_name", Value::String(event.strategy_name.clone()));
        data.insert("status", Value::String(event.status.to_string()));
        data.insert("reason", opt_string(event.reason.clone()));
        data.insert(
            "metadata",
            event
                .metadata
                .as_ref()
                .map(|m| Value::String(m.to_string()))
                .unwrap_or(Value::Null),
        );

        if let Err(e) = self.insert(data).await {
            error!("failed to write order audit event: {e:#}");
        }
    }

    pub async fn log_position(&self, event: PositionAuditEvent) {
        let metadata = serde_json::json!({
            "avg_price": event.avg_price,
            "current_price": event.current_price,
            "profit_loss": event.profit_loss,
            "profit_rate": event.profit_rate,
        });
        let mut data = BTreeMap::new();
        data.insert("timestamp", Value::String(Local::now().naive_local().to_string()));
        data.insert("event_type", Value::String(event.event_type.to_string()));
        data.insert("module", Value::String(event.module.to_string()));
        data.insert("correlation_id", Value::Null);
        data.insert("session_id", Value::String(self.session_id.clone()));
        data.insert("symbol", Value::String(event.symbol.clone()));
        data.insert("name", Value::String(event.name.clone()));
        data.insert("order_id", Value::Null);
        data.insert("side", Value::Null);
        data.insert("quantity", Value::from(event.quantity));
        data.insert("price", Value::from(event.current_price as f64));
        data.insert("amount", Value::Null);
        data.insert("strategy_name", opt_string(event.strategy_name.clone()));
        data.insert(
            "status",
            Value::String(if event.quantity > 0 { "ACTIVE" } else { "CLOSED" }.to_string()),
        );
        data.insert("reason", Value::Null);
        data.insert("metadata", Value::String(metadata.to_string()));

        if let Err(e) = self.insert(data).await {
            error!("failed to write position audit event: {e:#}");
        }
    }

    async fn insert(&self, data: BTreeMap<&'static str, Value>) -> Result<()> {
        let checksum = compute_checksum(&data);
        let record = move |key: &str| data.get(key).cloned().unwrap_or(Value::Null);

        let timestamp = as_text(record("timestamp"));
        let event_type = as_text(record("event_type"));
        let module = as_text(record("module"));
        let session_id = as_opt_text(record("session_id"));
        let symbol = as_opt_text(record("symbol"));
        let name = as_opt_text(record("name"));
        let order_id = as_opt_text(record("order_id"));
        let side = as_opt_text(record("side"));
        let quantity = record("quantity").as_i64();
        let price = record("price").as_f64();
        let amount = record("amount").as_f64();
        let strategy_name = as_opt_text(record("strategy_name"));
        let status = as_opt_text(record("status"));
        let reason = as_opt_text(record("reason"));
        let metadata = as_opt_text(record("metadata"));

        self.store
            .write(move |pool| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO audit_log (
                            timestamp, event_type, module, correlation_id, session_id,
                            symbol, name, order_id, side, quantity, price, amount,
                            strategy_name, status, reason, metadata, checksum
                        ) VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                    )
                    .bind(timestamp)
                    .bind(event_type)
                    .bind(module)
                    .bind(session_id)
                    .bind(symbol)
                    .bind(name)
                    .bind(order_id)
                    .bind(side)
                    .bind(quantity)
                    .bind(price)
                    .bind(amount)
                    .bind(strategy_name)
                    .bind(status)
                    .bind(reason)
                    .bind(metadata)
                    .bind(checksum)
                    .execute(&pool)
                    .await?;
                    Ok(())
                })
            })
            .await
    }

    /// Recompute every record's checksum and report mismatches.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport> {
        let rows = sqlx::query("SELECT * FROM audit_log ORDER BY id")
            .fetch_all(self.store.reader())
            .await?;

        let mut report = IntegrityReport::default();
        for row in rows {
            report.total += 1;
            let mut data = BTreeMap::new();
            data.insert("timestamp", text_value(&row, "timestamp"));
            data.insert("event_type", text_value(&row, "event_type"));
            data.insert("module", text_value(&row, "module"));
            data.insert("correlation_id", text_value(&row, "correlation_id"));
            data.insert("session_id", text_value(&row, "session_id"));
            data.insert("symbol", text_value(&row, "symbol"));
            data.insert("name", text_value(&row, "name"));
            data.insert("order_id", text_value(&row, "order_id"));
            data.insert("side", text_value(&row, "side"));
            data.insert(
                "quantity",
                row.get::<Option<i64>, _>("quantity")
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            );
            data.insert(
                "price",
                row.get::<Option<f64>, _>("price")
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            );
            data.insert(
                "amount",
                row.get::<Option<f64>, _>("amount")
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            );
            data.insert("strategy_name", text_value(&row, "strategy_name"));
            data.insert("status", text_value(&row, "status"));
            data.insert("reason", text_value(&row, "reason"));
            data.insert("metadata", text_value(&row, "metadata"));

            let expected = compute_checksum(&data);
            let actual: String = row.get("checksum");
            if expected == actual {
                report.valid += 1;
            } else {
                report.invalid += 1;
                report.mismatched_ids.push(row.get::<i64, _>("id"));
            }
        }
        Ok(report)
    }
}

/// Canonical-JSON checksum: sorted keys (BTreeMap ordering), SHA-256,
/// first 32 hex chars.
fn compute_checksum(data: &BTreeMap<&'static str, Value>) -> String {
    let canonical = serde_json::to_string(data).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)[..32].to_string()
}

fn opt_string(value: Option<String>) -> Value {
    value.map(Value::String).unwrap_or(Value::Null)
}

fn as_text(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_opt_text(value: Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn text_value(row: &sqlx::sqlite::SqliteRow, column: &str) -> Value {
    row.get::<Option<String>, _>(column)
        .map(Value::String)
        .unwrap_or(Value::Null)
}
