//! Realtime WebSocket stream.
//!
//! A dedicated task owns the connection and publishes decoded events into
//! channels: trade ticks into a bounded broadcast channel (a lagging
//! consumer loses the oldest ticks) and fill notices into a bounded mpsc
//! channel (never dropped). Subscriptions change through a command channel.
//!
//! The connection is expected to drop; the task reconnects with bounded
//! backoff and re-subscribes. While it is down, `is_order_notice_active`
//! reports false and fill detection falls back to REST polling.

use crate::config::Settings;
use crate::domain::types::{OrderNotice, OrderSide, TickEvent};
use crate::infrastructure::kis::session::SessionManager;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, NaiveTime};
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Tick stream TR id.
const TR_TICK: &str = "H0STCNT0";
/// Fill-notice TR ids (live / paper).
const TR_NOTICE_LIVE: &str = "H0STCNI0";
const TR_NOTICE_PAPER: &str = "H0STCNI9";

/// Consumers slower than this many buffered ticks lose the oldest.
const TICK_CHANNEL_CAPACITY: usize = 1024;
const NOTICE_CHANNEL_CAPACITY: usize = 256;
/// Data silence beyond this means the notice fast path is not trustworthy.
const NOTICE_FRESHNESS: Duration = Duration::from_secs(10);
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

// Positional field indices of a tick record.
const T_SYMBOL: usize = 0;
const T_TIME: usize = 1;
const T_PRICE: usize = 2;
const T_CHANGE_SIGN: usize = 3;
const T_CHANGE: usize = 4;
const T_CHANGE_RATE: usize = 5;
const T_OPEN: usize = 7;
const T_HIGH: usize = 8;
const T_LOW: usize = 9;
const T_VOLUME: usize = 12;
const T_CUM_VOLUME: usize = 13;
const TICK_MIN_FIELDS: usize = 14;

// Positional field indices of a fill-notice record.
const N_ORDER_NO: usize = 2;
const N_SIDE: usize = 4;
const N_SYMBOL: usize = 8;
const N_FILL_QTY: usize = 9;
const N_FILL_PRICE: usize = 10;
const N_FILL_TIME: usize = 11;
const N_FILL_YN: usize = 13;
const N_ORDER_QTY: usize = 16;
const NOTICE_MIN_FIELDS: usize = 17;

#[derive(Debug)]
enum WsCommand {
    Subscribe(String),
    Unsubscribe(String),
}

struct Shared {
    running: AtomicBool,
    notice_subscribed: AtomicBool,
    last_data: StdMutex<Option<Instant>>,
    symbols: StdMutex<BTreeSet<String>>,
}

pub struct RealtimeStream {
    session: Arc<SessionManager>,
    ws_url: String,
    is_paper: bool,
    hts_id: Option<String>,
    session_start: NaiveTime,
    session_end: NaiveTime,
    tick_tx: broadcast::Sender<TickEvent>,
    notice_tx: mpsc::Sender<OrderNotice>,
    cmd_tx: StdMutex<Option<mpsc::Sender<WsCommand>>>,
    shared: Arc<Shared>,
}

impl RealtimeStream {
    /// Returns the stream plus the single consumer end of the fill-notice
    /// channel.
    pub fn new(
        settings: &Settings,
        session: Arc<SessionManager>,
    ) -> (Arc<Self>, mpsc::Receiver<OrderNotice>) {
        let (tick_tx, _) = broadcast::channel(TICK_CHANNEL_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
        let hts_id = match settings.credentials.hts_id.as_str() {
            "" => None,
            id => Some(id.to_string()),
        };
        let stream = Arc::new(Self {
            session,
            ws_url: settings.websocket_url().to_string(),
            is_paper: settings.is_paper(),
            hts_id,
            session_start: NaiveTime::from_hms_opt(8, 59, 0).unwrap_or_default(),
            session_end: NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default(),
            tick_tx,
            notice_tx,
            cmd_tx: StdMutex::new(None),
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                notice_subscribed: AtomicBool::new(false),
                last_data: StdMutex::new(None),
                symbols: StdMutex::new(BTreeSet::new()),
            }),
        });
        (stream, notice_rx)
    }

    pub fn subscribe_ticks(&self) -> broadcast::Receiver<TickEvent> {
        self.tick_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the fill-notice fast path can be trusted right now: the
    /// reader is up, the notice stream is subscribed, and data has arrived
    /// within the last 10 seconds.
    pub fn is_order_notice_active(&self) -> bool {
        if !self.is_running() || !self.shared.notice_subscribed.load(Ordering::SeqCst) {
            return false;
        }
        let guard = self.shared.last_data.lock().unwrap_or_else(|e| e.into_inner());
        matches!(*guard, Some(t) if t.elapsed() < NOTICE_FRESHNESS)
    }

    fn in_session_window(&self, now: NaiveDateTime) -> bool {
        let t = now.time();
        t >= self.session_start && t <= self.session_end
    }

    /// Start the reader task. A no-op outside the WS session window.
    pub fn start(
        self: &Arc<Self>,
        symbols: Vec<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        if self.is_running() {
            warn!("realtime stream already running");
            return None;
        }
        if !self.in_session_window(Local::now().naive_local()) {
            info!(
                "realtime stream skipped: outside session window {}~{}",
                self.session_start, self.session_end
            );
            return None;
        }

        {
            let mut set = self.shared.symbols.lock().unwrap_or_else(|e| e.into_inner());
            set.extend(symbols);
        }
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        *self.cmd_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(cmd_tx);
        self.shared.running.store(true, Ordering::SeqCst);

        let stream = self.clone();
        Some(tokio::spawn(async move {
            stream.run(cmd_rx, shutdown).await;
            stream.shared.running.store(false, Ordering::SeqCst);
            stream.shared.notice_subscribed.store(false, Ordering::SeqCst);
            info!("realtime stream stopped");
        }))
    }

    /// Add a symbol to the tick subscription. Queued for the next
    /// (re)connection when the reader is down.
    pub async fn subscribe_symbol(&self, symbol: &str) {
        let newly_added = {
            let mut set = self.shared.symbols.lock().unwrap_or_else(|e| e.into_inner());
            set.insert(symbol.to_string())
        };
        if !newly_added {
            return;
        }
        let tx = self.cmd_tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(tx) = tx {
            let _ = tx.send(WsCommand::Subscribe(symbol.to_string())).await;
        }
    }

    pub async fn unsubscribe_symbol(&self, symbol: &str) {
        let removed = {
            let mut set = self.shared.symbols.lock().unwrap_or_else(|e| e.into_inner());
            set.remove(symbol)
        };
        if !removed {
            return;
        }
        let tx = self.cmd_tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(tx) = tx {
            let _ = tx.send(WsCommand::Unsubscribe(symbol.to_string())).await;
        }
    }

    async fn run(&self, mut cmd_rx: mpsc::Receiver<WsCommand>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(1);
        let mut failures = 0u32;
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.connect_and_stream(&mut cmd_rx, &mut shutdown).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        return;
                    }
                    info!("websocket closed by server, reconnecting in 5s");
                    failures = 0;
                    backoff = Duration::from_secs(1);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        error!("websocket failed {failures} times in a row, giving up: {e}");
                        return;
                    }
                    warn!("websocket error: {e}, reconnecting in {:?}", backoff);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    async fn connect_and_stream(
        &self,
        cmd_rx: &mut mpsc::Receiver<WsCommand>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let approval_key = self
            .session
            .approval_key()
            .await
            .context("failed to obtain websocket approval key")?;

        let url = format!("{}/tryitout", self.ws_url);
        info!("connecting websocket: {url}");
        let (ws, _) = connect_async(url.as_str())
            .await
            .context("websocket connect failed")?;
        let (mut write, mut read) = ws.split();

        // Re-subscribe everything we are supposed to be watching.
        let symbols: Vec<String> = {
            let set = self.shared.symbols.lock().unwrap_or_else(|e| e.into_inner());
            set.iter().cloned().collect()
        };
        for symbol in &symbols {
            let msg = subscription_message(&approval_key, TR_TICK, symbol, true);
            write.send(Message::Text(msg.into())).await?;
            debug!("subscribed tick stream: {symbol}");
        }

        let notice_tr = if self.is_paper { TR_NOTICE_PAPER } else { TR_NOTICE_LIVE };
        if let Some(hts_id) = &self.hts_id {
            let msg = subscription_message(&approval_key, notice_tr, hts_id, true);
            write.send(Message::Text(msg.into())).await?;
            self.shared.notice_subscribed.store(true, Ordering::SeqCst);
            info!("subscribed fill notices (hts_id {hts_id}, tr {notice_tr})");
        } else {
            warn!("hts_id not configured; fill detection will use REST polling only");
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
                Some(cmd) = cmd_rx.recv() => {
                    let (tr_key, register) = match &cmd {
                        WsCommand::Subscribe(s) => (s.clone(), true),
                        WsCommand::Unsubscribe(s) => (s.clone(), false),
                    };
                    let msg = subscription_message(&approval_key, TR_TICK, &tr_key, register);
                    write.send(Message::Text(msg.into())).await?;
                    debug!("subscription update: {cmd:?}");
                }
                frame = read.next() => {
                    let Some(frame) = frame else {
                        return Ok(());
                    };
                    match frame? {
                        Message::Text(text) => {
                            self.touch();
                            let (reply, notices) = self.handle_frame(text.as_str());
                            if let Some(reply) = reply {
                                write.send(Message::Text(reply.into())).await?;
                            }
                            // Fills are never dropped: back-pressure blocks
                            // the reader instead.
                            for notice in notices {
                                if self.notice_tx.send(notice).await.is_err() {
                                    warn!("fill-notice consumer is gone");
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Message::Close(frame) => {
                            info!("websocket closed by server: {frame:?}");
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn touch(&self) {
        let mut guard = self.shared.last_data.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Instant::now());
    }

    /// Decode one text frame. Ticks publish to the broadcast channel
    /// inline (droppable); fill notices are returned so the caller can
    /// deliver them with back-pressure. The returned string is a reply to
    /// send (PINGPONG echo).
    fn handle_frame(&self, text: &str) -> (Option<String>, Vec<OrderNotice>) {
        // Data frames are pipe-delimited and start with an encryption flag.
        if text.starts_with('0') || text.starts_with('1') {
            let parts: Vec<&str> = text.splitn(4, '|').collect();
            if parts.len() < 4 {
                warn!("short websocket data frame: {text}");
                return (None, Vec::new());
            }
            let tr_id = parts[1];
            let count: usize = parts[2].parse().unwrap_or(1);
            let payload = parts[3];
            match tr_id {
                TR_TICK => {
                    for tick in parse_tick_records(payload, count, Local::now().naive_local()) {
                        let _ = self.tick_tx.send(tick);
                    }
                }
                TR_NOTICE_LIVE | TR_NOTICE_PAPER => {
                    if let Some(notice) = parse_notice_record(payload) {
                        info!(
                            "[WS] fill notice: {} {} x{} @ {}",
                            notice.symbol, notice.side, notice.filled_qty, notice.filled_price
                        );
                        return (None, vec![notice]);
                    }
                }
                other => debug!("ignoring frame for tr_id {other}"),
            }
            return (None, Vec::new());
        }

        // Control frames are JSON.
        let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
            return (None, Vec::new());
        };
        let tr_id = value
            .get("header")
            .and_then(|h| h.get("tr_id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if tr_id == "PINGPONG" {
            return (Some(text.to_string()), Vec::new());
        }
        let msg = value
            .get("body")
            .and_then(|b| b.get("msg1"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        debug!("websocket control frame: tr_id={tr_id} msg={msg}");
        (None, Vec::new())
    }
}

fn subscription_message(approval_key: &str, tr_id: &str, tr_key: &str, register: bool) -> String {
    serde_json::json!({
        "header": {
            "approval_key": approval_key,
            "custtype": "P",
            "tr_type": if register { "1" } else { "2" },
            "content-type": "utf-8",
        },
        "body": {
            "input": { "tr_id": tr_id, "tr_key": tr_key },
        },
    })
    .to_string()
}

/// Decode `count` caret-separated tick records from a payload.
fn parse_tick_records(payload: &str, count: usize, now: NaiveDateTime) -> Vec<TickEvent> {
    let fields: Vec<&str> = payload.split('^').collect();
    if count == 0 || fields.len() < TICK_MIN_FIELDS {
        return Vec::new();
    }
    let stride = fields.len() / count;
    if stride < TICK_MIN_FIELDS {
        return Vec::new();
    }

    let mut ticks = Vec::with_capacity(count);
    for record in fields.chunks(stride).take(count) {
        let Some(tick) = parse_tick_fields(record, now) else {
            warn!("unparseable tick record");
            continue;
        };
        ticks.push(tick);
    }
    ticks
}

fn parse_tick_fields(fields: &[&str], now: NaiveDateTime) -> Option<TickEvent> {
    let time_str = fields.get(T_TIME)?;
    let timestamp = if time_str.len() >= 6 {
        let h: u32 = time_str[0..2].parse().ok()?;
        let m: u32 = time_str[2..4].parse().ok()?;
        let s: u32 = time_str[4..6].parse().ok()?;
        now.date().and_hms_opt(h, m, s)?
    } else {
        now
    };

    // Sign codes 4 (limit-down) and 5 (down) negate the change.
    let sign = fields.get(T_CHANGE_SIGN).copied().unwrap_or("");
    let mut change: i64 = fields.get(T_CHANGE)?.parse().ok()?;
    if matches!(sign, "4" | "5") {
        change = -change;
    }

    Some(TickEvent {
        symbol: fields.get(T_SYMBOL)?.to_string(),
        price: fields.get(T_PRICE)?.parse().ok()?,
        volume: fields.get(T_VOLUME)?.parse().ok()?,
        cumulative_volume: fields.get(T_CUM_VOLUME)?.parse().ok()?,
        change,
        change_rate: fields.get(T_CHANGE_RATE)?.parse().ok()?,
        open: fields.get(T_OPEN)?.parse().ok()?,
        high: fields.get(T_HIGH)?.parse().ok()?,
        low: fields.get(T_LOW)?.parse().ok()?,
        timestamp,
    })
}

/// Decode a fill-notice record. Frames whose fill flag is not "2"
/// (acknowledgements, cancels, rejections) yield `None`.
fn parse_notice_record(payload: &str) -> Option<OrderNotice> {
    let fields: Vec<&str> = payload.split('^').collect();
    if fields.len() < NOTICE_MIN_FIELDS {
        return None;
    }
    if fields.get(N_FILL_YN)?.trim() != "2" {
        return None;
    }
    let side = match fields.get(N_SIDE)?.trim() {
        "02" => OrderSide::Buy,
        "01" => OrderSide::Sell,
        _ => return None,
    };
    Some(OrderNotice {
        symbol: fields.get(N_SYMBOL)?.trim().to_string(),
        order_id: fields.get(N_ORDER_NO)?.trim().to_string(),
        side,
        filled_qty: fields.get(N_FILL_QTY)?.trim().parse().ok()?,
        filled_price: fields.get(N_FILL_PRICE)?.trim().parse().ok()?,
        ordered_qty: fields.get(N_ORDER_QTY)?.trim().parse().ok()?,
        fill_time: fields.get(N_FILL_TIME)?.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 6, 18)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn tick_payload() -> String {
        // 14 of the leading H0STCNT0 fields.
        [
            "233740", "100512", "10250", "2", "150", "1.48", "10240.5", "10100", "10300",
            "10050", "10255", "10250", "120", "5503321",
        ]
        .join("^")
    }

    #[test]
    fn parses_single_tick_record() {
        let ticks = parse_tick_records(&tick_payload(), 1, now());
        assert_eq!(ticks.len(), 1);
        let t = &ticks[0];
        assert_eq!(t.symbol, "233740");
        assert_eq!(t.price, 10_250);
        assert_eq!(t.change, 150);
        assert_eq!(t.cumulative_volume, 5_503_321);
        assert_eq!(t.timestamp.time(), NaiveTime::from_hms_opt(10, 5, 12).unwrap());
    }

    #[test]
    fn down_sign_negates_change() {
        let payload = tick_payload().replace("^2^150^", "^5^150^");
        let ticks = parse_tick_records(&payload, 1, now());
        assert_eq!(ticks[0].change, -150);
    }

    #[test]
    fn parses_multiple_records() {
        let two = format!("{}^{}", tick_payload(), tick_payload());
        let ticks = parse_tick_records(&two, 2, now());
        assert_eq!(ticks.len(), 2);
    }

    fn notice_payload(fill_yn: &str, side: &str) -> String {
        let mut fields = vec![""; NOTICE_MIN_FIELDS];
        fields[N_ORDER_NO] = "0000012345";
        fields[N_SIDE] = side;
        fields[N_SYMBOL] = "233740";
        fields[N_FILL_QTY] = "3";
        fields[N_FILL_PRICE] = "9990";
        fields[N_FILL_TIME] = "100512";
        fields[N_FILL_YN] = fill_yn;
        fields[N_ORDER_QTY] = "5";
        fields.join("^")
    }

    #[test]
    fn fill_notice_parses() {
        let notice = parse_notice_record(&notice_payload("2", "02")).unwrap();
        assert_eq!(notice.order_id, "0000012345");
        assert_eq!(notice.side, OrderSide::Buy);
        assert_eq!(notice.filled_qty, 3);
        assert_eq!(notice.filled_price, 9_990);
        assert_eq!(notice.ordered_qty, 5);
    }

    #[test]
    fn ack_and_cancel_frames_are_ignored() {
        assert!(parse_notice_record(&notice_payload("1", "02")).is_none());
    }

    #[test]
    fn sell_side_decodes() {
        let notice = parse_notice_record(&notice_payload("2", "01")).unwrap();
        assert_eq!(notice.side, OrderSide::Sell);
    }

    #[test]
    fn subscription_message_shape() {
        let msg = subscription_message("key", TR_TICK, "005930", true);
        let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(v["header"]["tr_type"], "1");
        assert_eq!(v["body"]["input"]["tr_id"], TR_TICK);
        assert_eq!(v["body"]["input"]["tr_key"], "005930");
    }
}
