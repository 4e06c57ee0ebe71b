//! KIS REST broker operations.
//!
//! Thin typed wrappers over the domestic-stock endpoints: quotes, balance,
//! cash orders (market/limit), modify/cancel, daily fills, buyable quantity
//! and chart history. Two broker error classes are recovered here: auth
//! expiry (forced re-auth, one retry) and transient account validation
//! (fixed-delay retries).

use crate::domain::errors::BrokerError;
use crate::domain::ports::{Broker, BrokerResult, OrderStatusQuery};
use crate::domain::types::{
    AccountBalance, AccountSummary, BrokerPosition, DailyBar, FillStatus, MinuteBar, OrderAck,
    OrderInfo, OrderSide, OrderStatus, StockPrice,
};
use crate::infrastructure::kis::session::{ApiResponse, SessionManager};
use async_trait::async_trait;
use chrono::Local;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(1);
const TRANSIENT_MAX_RETRIES: u32 = 3;

pub struct KisBroker {
    session: Arc<SessionManager>,
}

impl KisBroker {
    pub fn new(session: Arc<SessionManager>) -> Self {
        let (account, _) = session.account_info();
        info!("KisBroker initialized (account {account})");
        Self { session }
    }

    /// Fetch with recovery for the two retryable broker error classes.
    async fn fetch_with_recovery(
        &self,
        api_url: &str,
        tr_id: &str,
        params: &Value,
        post: bool,
    ) -> BrokerResult<ApiResponse> {
        let mut res = self.session.url_fetch(api_url, tr_id, params, post).await?;
        self.session.smart_sleep().await;
        if res.is_ok() {
            return Ok(res);
        }

        let code = res.error_code();
        if BrokerError::is_auth_expired(&code) {
            warn!("auth error {code} on {api_url}, re-authenticating and retrying once");
            if !self.session.force_reauthenticate().await {
                return Err(BrokerError::AuthFailed {
                    reason: "re-authentication failed".into(),
                });
            }
            res = self.session.url_fetch(api_url, tr_id, params, post).await?;
            self.session.smart_sleep().await;
            if res.is_ok() {
                return Ok(res);
            }
        } else if BrokerError::is_transient(&code) {
            for retry in 1..=TRANSIENT_MAX_RETRIES {
                warn!(
                    "transient error {code} on {api_url}, retry {retry}/{TRANSIENT_MAX_RETRIES}"
                );
                tokio::time::sleep(TRANSIENT_RETRY_DELAY).await;
                res = self.session.url_fetch(api_url, tr_id, params, post).await?;
                self.session.smart_sleep().await;
                if res.is_ok() {
                    return Ok(res);
                }
            }
        }

        Err(res.as_api_error())
    }

    async fn place_cash_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
        price: Option<i64>,
    ) -> BrokerResult<OrderAck> {
        let (account, product) = self.session.account_info();
        let tr_id = match side {
            OrderSide::Buy => "TTTC0802U",
            OrderSide::Sell => "TTTC0801U",
        };
        let mut params = json!({
            "CANO": account,
            "ACNT_PRDT_CD": product,
            "PDNO": symbol,
            // 00 = limit, 01 = market
            "ORD_DVSN": if price.is_some() { "00" } else { "01" },
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": price.unwrap_or(0).to_string(),
            "EXCG_ID_DVSN_CD": "KRX",
        });
        if side == OrderSide::Sell {
            params["SLL_TYPE"] = json!("01");
        }

        let res = self
            .session
            .url_fetch("/uapi/domestic-stock/v1/trading/order-cash", tr_id, &params, true)
            .await?;
        self.session.smart_sleep().await;

        if !res.is_ok() {
            return Err(BrokerError::OrderRejected {
                message: res.error_message(),
            });
        }

        let output = res.output();
        let ack = OrderAck {
            order_id: get_str(output, "ODNO"),
            branch: get_str(output, "KRX_FWDG_ORD_ORGNO"),
            price: price.unwrap_or(0),
            order_time: get_str(output, "ORD_TMD"),
        };
        info!(
            "order placed: {side} {symbol} x {quantity} @ {} (id {})",
            price.map(|p| p.to_string()).unwrap_or_else(|| "market".into()),
            ack.order_id
        );
        Ok(ack)
    }

    async fn fetch_orders(&self, fill_filter: &str) -> BrokerResult<Vec<OrderInfo>> {
        let (account, product) = self.session.account_info();
        let today = Local::now().format("%Y%m%d").to_string();
        let params = json!({
            "CANO": account,
            "ACNT_PRDT_CD": product,
            "INQR_STRT_DT": today,
            "INQR_END_DT": today,
            "SLL_BUY_DVSN_CD": "00",
            "INQR_DVSN": "00",
            "PDNO": "",
            // 00 = all, 01 = filled, 02 = unfilled
            "CCLD_DVSN": fill_filter,
            "ORD_GNO_BRNO": "",
            "ODNO": "",
            "INQR_DVSN_3": "00",
            "INQR_DVSN_1": "",
            "CTX_AREA_FK100": "",
            "CTX_AREA_NK100": "",
        });

        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/trading/inquire-daily-ccld",
                "TTTC8001R",
                &params,
                false,
            )
            .await?;

        let mut orders = Vec::new();
        let Some(items) = res.field("output1").as_array() else {
            return Ok(orders);
        };
        for item in items {
            let ordered_qty = get_i64(item, "ord_qty") as u32;
            let filled_qty = get_i64(item, "tot_ccld_qty") as u32;
            let status = if filled_qty == 0 {
                OrderStatus::Pending
            } else if filled_qty < ordered_qty {
                OrderStatus::Partial
            } else {
                OrderStatus::Filled
            };
            // 02 = buy, 01 = sell
            let side = if get_str(item, "sll_buy_dvsn_cd") == "02" {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            orders.push(OrderInfo {
                order_id: get_str(item, "odno"),
                original_order_id: get_str(item, "orgn_odno"),
                branch: get_str(item, "ord_gno_brno"),
                symbol: get_str(item, "pdno"),
                name: get_str(item, "prdt_name"),
                side,
                ordered_qty,
                order_price: get_i64(item, "ord_unpr"),
                filled_qty,
                filled_price: get_i64(item, "avg_prvs"),
                status,
                order_time: get_str(item, "ord_tmd"),
            });
        }
        Ok(orders)
    }

    /// Infer an order's fill state from the held quantity. The status
    /// endpoint is unreliable in paper mode; balance is authoritative.
    async fn order_status_from_balance(
        &self,
        symbol: &str,
        ordered_qty: u32,
        side: OrderSide,
    ) -> BrokerResult<FillStatus> {
        let balance = self.balance().await?;
        let held = balance
            .positions
            .iter()
            .find(|p| p.symbol == symbol)
            .map(|p| p.quantity)
            .unwrap_or(0);
        let status = infer_fill_from_balance(side, ordered_qty, held);
        debug!(
            "[balance fallback] {side} {symbol}: held={held} filled={} unfilled={}",
            status.filled, status.unfilled
        );
        Ok(status)
    }
}

/// Pure balance-diff fill inference: a buy counts as filled up to the held
/// quantity; a sell counts as filled for whatever is no longer held.
fn infer_fill_from_balance(side: OrderSide, ordered_qty: u32, held: u32) -> FillStatus {
    match side {
        OrderSide::Buy => {
            let filled = held.min(ordered_qty);
            FillStatus::new(filled, ordered_qty.saturating_sub(held))
        }
        OrderSide::Sell => {
            if held == 0 {
                FillStatus::new(ordered_qty, 0)
            } else {
                let sold = ordered_qty.saturating_sub(held);
                FillStatus::new(sold, ordered_qty - sold)
            }
        }
    }
}

#[async_trait]
impl Broker for KisBroker {
    async fn current_price(&self, symbol: &str) -> BrokerResult<StockPrice> {
        let params = json!({
            "FID_COND_MRKT_DIV_CODE": "J",
            "FID_INPUT_ISCD": symbol,
        });
        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/quotations/inquire-price",
                "FHKST01010100",
                &params,
                false,
            )
            .await?;
        let output = res.output();
        Ok(StockPrice {
            symbol: symbol.to_string(),
            name: get_str(output, "hts_kor_isnm"),
            current_price: get_i64(output, "stck_prpr"),
            prev_close: get_i64(output, "stck_sdpr"),
            change: get_i64(output, "prdy_vrss"),
            change_rate: get_f64(output, "prdy_ctrt"),
            open: get_i64(output, "stck_oprc"),
            high: get_i64(output, "stck_hgpr"),
            low: get_i64(output, "stck_lwpr"),
            volume: get_i64(output, "acml_vol"),
            trade_amount: get_i64(output, "acml_tr_pbmn"),
        })
    }

    async fn best_ask(&self, symbol: &str) -> BrokerResult<i64> {
        let params = json!({
            "FID_COND_MRKT_DIV_CODE": "J",
            "FID_INPUT_ISCD": symbol,
        });
        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/quotations/inquire-asking-price-exp-ccn",
                "FHKST01010200",
                &params,
                false,
            )
            .await?;
        Ok(get_i64(res.field("output1"), "askp1"))
    }

    async fn best_bid(&self, symbol: &str) -> BrokerResult<i64> {
        let params = json!({
            "FID_COND_MRKT_DIV_CODE": "J",
            "FID_INPUT_ISCD": symbol,
        });
        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/quotations/inquire-asking-price-exp-ccn",
                "FHKST01010200",
                &params,
                false,
            )
            .await?;
        Ok(get_i64(res.field("output1"), "bidp1"))
    }

    async fn balance(&self) -> BrokerResult<AccountBalance> {
        let (account, product) = self.session.account_info();
        let params = json!({
            "CANO": account,
            "ACNT_PRDT_CD": product,
            "AFHR_FLPR_YN": "N",
            "OFL_YN": "",
            "INQR_DVSN": "01",
            "UNPR_DVSN": "01",
            "FUND_STTL_ICLD_YN": "N",
            "FNCG_AMT_AUTO_RDPT_YN": "N",
            "PRCS_DVSN": "00",
            "CTX_AREA_FK100": "",
            "CTX_AREA_NK100": "",
        });
        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/trading/inquire-balance",
                "TTTC8434R",
                &params,
                false,
            )
            .await?;

        let mut positions = Vec::new();
        if let Some(items) = res.field("output1").as_array() {
            for item in items {
                let quantity = get_i64(item, "hldg_qty") as u32;
                if quantity == 0 {
                    continue;
                }
                positions.push(BrokerPosition {
                    symbol: get_str(item, "pdno"),
                    name: get_str(item, "prdt_name"),
                    quantity,
                    avg_price: get_f64(item, "pchs_avg_pric"),
                    current_price: get_i64(item, "prpr"),
                    eval_amount: get_i64(item, "evlu_amt"),
                    profit_loss: get_i64(item, "evlu_pfls_amt"),
                    profit_rate: get_f64(item, "evlu_pfls_rt"),
                });
            }
        }

        let summary = match res.field("output2") {
            Value::Array(items) if !items.is_empty() => parse_summary(&items[0]),
            other @ Value::Object(_) => parse_summary(other),
            _ => AccountSummary::default(),
        };

        Ok(AccountBalance { positions, summary })
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
    ) -> BrokerResult<OrderAck> {
        self.place_cash_order(symbol, side, quantity, None).await
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: u32,
        price: i64,
    ) -> BrokerResult<OrderAck> {
        self.place_cash_order(symbol, side, quantity, Some(price)).await
    }

    async fn cancel_order(&self, order_id: &str, branch: &str, quantity: u32) -> BrokerResult<()> {
        let (account, product) = self.session.account_info();
        let params = json!({
            "CANO": account,
            "ACNT_PRDT_CD": product,
            "KRX_FWDG_ORD_ORGNO": branch,
            "ORGN_ODNO": order_id,
            "ORD_DVSN": "00",
            // 02 = cancel
            "RVSE_CNCL_DVSN_CD": "02",
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": "0",
            "QTY_ALL_ORD_YN": "Y",
            "EXCG_ID_DVSN_CD": "KRX",
        });
        let res = self
            .session
            .url_fetch(
                "/uapi/domestic-stock/v1/trading/order-rvsecncl",
                "TTTC0803U",
                &params,
                true,
            )
            .await?;
        self.session.smart_sleep().await;
        if !res.is_ok() {
            return Err(res.as_api_error());
        }
        info!("order cancelled: {order_id}");
        Ok(())
    }

    async fn modify_order(
        &self,
        order_id: &str,
        branch: &str,
        quantity: u32,
        new_price: i64,
    ) -> BrokerResult<String> {
        let (account, product) = self.session.account_info();
        let params = json!({
            "CANO": account,
            "ACNT_PRDT_CD": product,
            "KRX_FWDG_ORD_ORGNO": branch,
            "ORGN_ODNO": order_id,
            "ORD_DVSN": "00",
            // 01 = modify
            "RVSE_CNCL_DVSN_CD": "01",
            "ORD_QTY": quantity.to_string(),
            "ORD_UNPR": new_price.to_string(),
            "QTY_ALL_ORD_YN": "N",
            "EXCG_ID_DVSN_CD": "KRX",
        });
        let res = self
            .session
            .url_fetch(
                "/uapi/domestic-stock/v1/trading/order-rvsecncl",
                "TTTC0803U",
                &params,
                true,
            )
            .await?;
        self.session.smart_sleep().await;
        if !res.is_ok() {
            // A fill racing the modify is expected; the caller re-checks.
            warn!("order modify failed: {order_id} - {}", res.error_message());
            return Err(res.as_api_error());
        }
        let new_id = get_str(res.output(), "ODNO");
        let new_id = if new_id.is_empty() {
            order_id.to_string()
        } else {
            new_id
        };
        info!("order modified: {order_id} -> {new_id}, {quantity} @ {new_price}");
        Ok(new_id)
    }

    async fn order_status(&self, query: OrderStatusQuery) -> BrokerResult<FillStatus> {
        if let (Some(symbol), Some(qty), Some(side)) =
            (query.symbol.as_deref(), query.ordered_qty, query.side)
        {
            return self.order_status_from_balance(symbol, qty, side).await;
        }

        let orders = self.fetch_orders("00").await?;
        for order in orders {
            if order.order_id == query.order_id {
                return Ok(FillStatus::new(order.filled_qty, order.remaining_qty()));
            }
        }
        warn!("order not found in today's orders: {}", query.order_id);
        Ok(FillStatus::new(0, 0))
    }

    async fn today_orders(&self) -> BrokerResult<Vec<OrderInfo>> {
        self.fetch_orders("00").await
    }

    async fn pending_orders(&self) -> BrokerResult<Vec<OrderInfo>> {
        self.fetch_orders("02").await
    }

    async fn cancel_all_pending(&self) -> BrokerResult<u32> {
        let pending = self.pending_orders().await?;
        let mut cancelled = 0u32;
        for order in pending {
            let remaining = order.remaining_qty();
            if remaining == 0 {
                continue;
            }
            match self.cancel_order(&order.order_id, &order.branch, remaining).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!("cancel failed for {}: {e}", order.order_id),
            }
        }
        Ok(cancelled)
    }

    async fn buyable_quantity(&self, symbol: &str, current_price: i64) -> BrokerResult<(u32, i64)> {
        let (account, product) = self.session.account_info();
        let params = json!({
            "CANO": account,
            "ACNT_PRDT_CD": product,
            "PDNO": symbol,
            "ORD_UNPR": "0",
            "ORD_DVSN": "01",
            "CMA_EVLU_AMT_ICLD_YN": "N",
            "OVRS_ICLD_YN": "N",
        });
        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/trading/inquire-psbl-order",
                "TTTC8908R",
                &params,
                false,
            )
            .await?;
        let output = res.output();
        let cash = get_i64(output, "ord_psbl_cash");
        let calc_unit_price = get_i64(output, "psbl_qty_calc_unpr");

        // Divide orderable cash by the price, matching the broker's own
        // cash-buyable figure. A zero price is the deposit-prefetch path.
        if current_price > 0 {
            return Ok(((cash / current_price) as u32, cash));
        }
        if calc_unit_price > 0 {
            return Ok(((cash / calc_unit_price) as u32, cash));
        }
        let no_margin_qty = get_i64(output, "nrcvb_buy_qty") as u32;
        warn!("[{symbol}] no calculation unit price; using no-margin quantity {no_margin_qty}");
        Ok((no_margin_qty, cash))
    }

    async fn deposit(&self) -> BrokerResult<i64> {
        Ok(self.balance().await?.summary.deposit)
    }

    async fn daily_candles(
        &self,
        symbol: &str,
        from: &str,
        to: &str,
    ) -> BrokerResult<Vec<DailyBar>> {
        let params = json!({
            "FID_COND_MRKT_DIV_CODE": "J",
            "FID_INPUT_ISCD": symbol,
            "FID_INPUT_DATE_1": from,
            "FID_INPUT_DATE_2": to,
            "FID_PERIOD_DIV_CODE": "D",
            "FID_ORG_ADJ_PRC": "0",
        });
        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/quotations/inquire-daily-itemchartprice",
                "FHKST03010100",
                &params,
                false,
            )
            .await?;

        let mut candles = Vec::new();
        if let Some(items) = res.field("output2").as_array() {
            for item in items {
                let close = get_i64(item, "stck_clpr");
                if close <= 0 {
                    continue;
                }
                candles.push(DailyBar {
                    trade_date: get_str(item, "stck_bsop_date"),
                    open: get_i64(item, "stck_oprc"),
                    high: get_i64(item, "stck_hgpr"),
                    low: get_i64(item, "stck_lwpr"),
                    close,
                    volume: get_i64(item, "acml_vol"),
                    trade_amount: get_i64(item, "acml_tr_pbmn"),
                    change_rate: get_f64(item, "prdy_ctrt"),
                });
            }
        }
        info!("loaded {} daily candles for {symbol} ({from}~{to})", candles.len());
        Ok(candles)
    }

    async fn minute_candles(
        &self,
        symbol: &str,
        anchor_hms: Option<&str>,
    ) -> BrokerResult<Vec<MinuteBar>> {
        let anchor = match anchor_hms {
            Some(t) => t.to_string(),
            None => Local::now().format("%H%M%S").to_string(),
        };
        let params = json!({
            "FID_COND_MRKT_DIV_CODE": "J",
            "FID_INPUT_ISCD": symbol,
            "FID_INPUT_HOUR_1": anchor,
            "FID_PW_DATA_INCU_YN": "Y",
            "FID_ETC_CLS_CODE": "",
        });
        let res = self
            .fetch_with_recovery(
                "/uapi/domestic-stock/v1/quotations/inquire-time-itemchartprice",
                "FHKST03010200",
                &params,
                false,
            )
            .await?;

        let mut candles = Vec::new();
        if let Some(items) = res.field("output2").as_array() {
            for item in items {
                let close = get_i64(item, "stck_prpr");
                if close <= 0 {
                    continue;
                }
                candles.push(MinuteBar {
                    trade_date: get_str(item, "stck_bsop_date"),
                    time: get_str(item, "stck_cntg_hour"),
                    open: get_i64(item, "stck_oprc"),
                    high: get_i64(item, "stck_hgpr"),
                    low: get_i64(item, "stck_lwpr"),
                    close,
                    volume: get_i64(item, "cntg_vol"),
                });
            }
        }
        Ok(candles)
    }
}

fn parse_summary(item: &Value) -> AccountSummary {
    AccountSummary {
        deposit: get_i64(item, "dnca_tot_amt"),
        total_eval: get_i64(item, "tot_evlu_amt"),
        total_profit_loss: get_i64(item, "evlu_pfls_smtl_amt"),
    }
}

// The API encodes numbers as strings; accept both.

fn get_str(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => String::new(),
    }
}

fn get_i64(v: &Value, key: &str) -> i64 {
    match v.get(key) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

fn get_f64(v: &Value, key: &str) -> f64 {
    match v.get(key) {
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_encoded_numbers_parse() {
        let v = json!({"stck_prpr": "10250", "prdy_ctrt": "-1.25", "name": "x"});
        assert_eq!(get_i64(&v, "stck_prpr"), 10_250);
        assert_eq!(get_f64(&v, "prdy_ctrt"), -1.25);
        assert_eq!(get_i64(&v, "missing"), 0);
    }

    #[test]
    fn balance_fallback_buy() {
        // Held >= ordered means fully filled.
        assert_eq!(
            infer_fill_from_balance(OrderSide::Buy, 5, 5),
            FillStatus::new(5, 0)
        );
        // Partial: 2 held of 5 ordered.
        assert_eq!(
            infer_fill_from_balance(OrderSide::Buy, 5, 2),
            FillStatus::new(2, 3)
        );
        assert_eq!(
            infer_fill_from_balance(OrderSide::Buy, 5, 0),
            FillStatus::new(0, 5)
        );
    }

    #[test]
    fn balance_fallback_sell() {
        // Position gone means the sell filled entirely.
        assert_eq!(
            infer_fill_from_balance(OrderSide::Sell, 10, 0),
            FillStatus::new(10, 0)
        );
        // 4 still held of a 10-share sell: 6 sold.
        assert_eq!(
            infer_fill_from_balance(OrderSide::Sell, 10, 4),
            FillStatus::new(6, 4)
        );
        // Nothing sold yet.
        assert_eq!(
            infer_fill_from_balance(OrderSide::Sell, 10, 10),
            FillStatus::new(0, 10)
        );
    }

    #[test]
    fn summary_parses_from_object_or_array_entry() {
        let item = json!({
            "dnca_tot_amt": "1000000",
            "tot_evlu_amt": "1200000",
            "evlu_pfls_smtl_amt": "-3000",
        });
        let summary = parse_summary(&item);
        assert_eq!(summary.deposit, 1_000_000);
        assert_eq!(summary.total_eval, 1_200_000);
        assert_eq!(summary.total_profit_loss, -3_000);
    }
}
