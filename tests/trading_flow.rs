//! End-to-end order lifecycle against the scripted broker: entry fill,
//! averaged add, exit with realized P/L, end-of-day liquidation, and a
//! clean audit trail at the end.

use krxtrade::application::liquidation::DailyLiquidation;
use krxtrade::application::order_manager::{NoopFillListener, OrderManager, OrderState};
use krxtrade::application::position_manager::PositionManager;
use krxtrade::domain::types::{OrderInfo, OrderSide, OrderStatus};
use krxtrade::infrastructure::mock::MockBroker;
use krxtrade::infrastructure::persistence::audit::AuditLog;
use krxtrade::infrastructure::persistence::database::TradingDb;
use krxtrade::notification::LogNotifier;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _dir: tempfile::TempDir,
    broker: Arc<MockBroker>,
    positions: Arc<PositionManager>,
    orders: Arc<OrderManager>,
    audit: AuditLog,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = TradingDb::open(&dir.path().join("trading_paper.db"))
        .await
        .unwrap();
    let broker = Arc::new(MockBroker::new());
    let audit = AuditLog::new(db.store(), "sess-e2e");
    let positions = Arc::new(PositionManager::new(
        broker.clone(),
        db.store(),
        audit.clone(),
    ));
    let orders = Arc::new(OrderManager::new(
        broker.clone(),
        positions.clone(),
        db.store(),
        audit.clone(),
        Arc::new(NoopFillListener),
    ));
    Harness {
        _dir: dir,
        broker,
        positions,
        orders,
        audit,
    }
}

fn filled(id: &str, symbol: &str, side: OrderSide, qty: u32, price: i64) -> OrderInfo {
    OrderInfo {
        order_id: id.into(),
        original_order_id: id.into(),
        branch: "91252".into(),
        symbol: symbol.into(),
        name: format!("mock-{symbol}"),
        side,
        ordered_qty: qty,
        order_price: 0,
        filled_qty: qty,
        filled_price: price,
        status: OrderStatus::Filled,
        order_time: "100000".into(),
    }
}

#[tokio::test]
async fn buy_average_sell_round_trip() {
    let h = harness().await;

    // First entry: 3 shares filled at 10,000.
    let first = h
        .orders
        .place_buy_order("233740", "KODEX", 3, "dip_buy", false, 10_000)
        .await
        .unwrap();
    h.broker
        .set_today_orders(vec![filled(&first, "233740", OrderSide::Buy, 3, 10_000)]);
    h.orders.check_fills().await;

    // Averaged add: 2 more at 10,500 -> avg cost 10,200.
    let second = h
        .orders
        .place_buy_order("233740", "KODEX", 2, "dip_buy", false, 10_500)
        .await
        .unwrap();
    h.broker.set_today_orders(vec![
        filled(&first, "233740", OrderSide::Buy, 3, 10_000),
        filled(&second, "233740", OrderSide::Buy, 2, 10_500),
    ]);
    h.orders.check_fills().await;

    let position = h.positions.get("233740").await.unwrap();
    assert_eq!(position.quantity, 5);
    assert!((position.avg_price - 10_200.0).abs() < 1.0);

    // Exit everything at 10,500: realized P/L = (10500 - 10200) * 5.
    let exit = h
        .orders
        .place_sell_order("233740", "KODEX", 5, Some("dip_buy"))
        .await
        .unwrap();
    h.broker
        .set_today_orders(vec![filled(&exit, "233740", OrderSide::Sell, 5, 10_500)]);
    let completed = h.orders.check_fills().await;

    let sell = completed
        .iter()
        .find(|o| o.order_id == exit)
        .expect("sell must complete");
    assert_eq!(sell.state, OrderState::Filled);
    assert_eq!(sell.pnl, Some(1_500));
    assert!(h.positions.get("233740").await.is_none());

    // Every audit record verifies after the full flow.
    let report = h.audit.verify_integrity().await.unwrap();
    assert!(report.total >= 6, "expected a rich trail, got {}", report.total);
    assert_eq!(report.invalid, 0);
}

#[tokio::test]
async fn liquidation_sweeps_whatever_is_left() {
    let h = harness().await;

    h.broker.set_positions(vec![krxtrade::domain::types::BrokerPosition {
        symbol: "069500".into(),
        name: "KODEX 200".into(),
        quantity: 8,
        avg_price: 33_000.0,
        current_price: 33_500,
        eval_amount: 268_000,
        profit_loss: 4_000,
        profit_rate: 1.5,
    }]);
    h.positions.sync().await.unwrap();

    let liquidation = DailyLiquidation::new(
        h.orders.clone(),
        h.positions.clone(),
        Arc::new(LogNotifier),
    )
    .with_fill_wait(Duration::from_millis(20));

    let result = liquidation.execute().await.unwrap();
    assert_eq!(result.total_positions, 1);
    assert_eq!(result.successful_orders, 1);
    assert!(h.positions.get_all().await.is_empty());
    assert!(!h.orders.is_liquidation_mode());

    let report = h.audit.verify_integrity().await.unwrap();
    assert_eq!(report.invalid, 0);
}
