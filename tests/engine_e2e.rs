//! End-to-end engine tests over a mock exchange gateway and an in-memory
//! SQLite database. Every flow drives the real managers; only the wire
//! clients are replaced.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use kasima::application::entry::EntryEngine;
use kasima::application::hedge::HedgeReentryManager;
use kasima::application::ingestion::{IngestOutcome, IngestionPipeline};
use kasima::application::lifecycle::LifecycleManager;
use kasima::application::publisher::Publisher;
use kasima::application::pyramid::PyramidManager;
use kasima::application::watchdog::Watchdog;
use kasima::config::{
    BingxConfig, ChannelSpec, EngineConfig, HedgeConfig, LifecycleConfig, MaintenanceConfig,
    PyramidConfig, PyramidScale, TelegramConfig, TradingConfig, WatchdogConfig,
};
use kasima::domain::entities::order::{LimitOrderRequest, MarketOrderRequest, StopOrderRequest};
use kasima::domain::entities::position::{HedgeState, PositionState};
use kasima::domain::entities::signal::{NormalizedSignal, Side};
use kasima::infrastructure::exchange::{
    ExchangeError, ExchangeGateway, ExchangeResult, OrderState, OrderStatus, PositionInfo,
    SymbolRules,
};
use kasima::infrastructure::telegram::{ChatError, ChatMessage, ChatSource};
use kasima::persistence::init_database;
use kasima::persistence::lifecycle_store::LifecycleStore;
use kasima::persistence::signal_store::{InsertOutcome, SignalStore};
use kasima::persistence::telemetry::TelemetrySink;

// ---------------------------------------------------------------------
// Mock exchange
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MockOrder {
    symbol: String,
    side: String,
    price: Option<Decimal>,
    stop_price: Option<Decimal>,
    quantity: Decimal,
    post_only: bool,
    reduce_only: bool,
    order_type: &'static str,
    status: OrderStatus,
    executed_qty: Decimal,
    avg_fill_price: Decimal,
}

#[derive(Default)]
struct MockState {
    balance: Decimal,
    mark_prices: HashMap<String, Decimal>,
    rules: HashMap<String, SymbolRules>,
    orders: HashMap<String, MockOrder>,
    positions: Vec<PositionInfo>,
    leverage_calls: Vec<(String, String, Decimal)>,
}

struct MockExchange {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockExchange {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                balance: dec!(402.10),
                ..MockState::default()
            }),
            next_id: AtomicU64::new(100),
        })
    }

    fn add_symbol(&self, symbol: &str, tick: Decimal, step: Decimal, min_qty: Decimal, mark: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.rules.insert(
            symbol.to_string(),
            SymbolRules {
                symbol: symbol.to_string(),
                tick_size: tick,
                qty_step: step,
                min_qty,
            },
        );
        state.mark_prices.insert(symbol.to_string(), mark);
    }

    fn set_mark(&self, symbol: &str, price: Decimal) {
        self.state
            .lock()
            .unwrap()
            .mark_prices
            .insert(symbol.to_string(), price);
    }

    fn order(&self, order_id: &str) -> MockOrder {
        self.state.lock().unwrap().orders.get(order_id).unwrap().clone()
    }

    fn open_order_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|(_, o)| o.status.is_open())
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn orders_of_type(&self, order_type: &str) -> Vec<(String, MockOrder)> {
        self.state
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|(_, o)| o.order_type == order_type)
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect()
    }

    /// Simulate a (partial) fill reported by the exchange.
    fn fill(&self, order_id: &str, qty: Decimal, price: Decimal) {
        let mut state = self.state.lock().unwrap();
        let order = state.orders.get_mut(order_id).unwrap();
        let prev_notional = order.executed_qty * order.avg_fill_price;
        order.executed_qty += qty;
        order.avg_fill_price = (prev_notional + qty * price) / order.executed_qty;
        order.status = if order.executed_qty >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };
    }

    fn insert_order(&self, order: MockOrder) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        self.state.lock().unwrap().orders.insert(id.clone(), order);
        id
    }
}

#[async_trait]
impl ExchangeGateway for MockExchange {
    async fn get_balance(&self) -> ExchangeResult<Decimal> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn get_symbol_rules(&self, symbol: &str) -> ExchangeResult<SymbolRules> {
        self.state
            .lock()
            .unwrap()
            .rules
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    async fn get_mark_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.state
            .lock()
            .unwrap()
            .mark_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::SymbolNotFound(symbol.to_string()))
    }

    async fn place_limit(&self, request: &LimitOrderRequest) -> ExchangeResult<String> {
        Ok(self.insert_order(MockOrder {
            symbol: request.symbol.clone(),
            side: request.side.to_string(),
            price: Some(request.price),
            stop_price: None,
            quantity: request.quantity,
            post_only: request.post_only,
            reduce_only: request.reduce_only,
            order_type: "LIMIT",
            status: OrderStatus::New,
            executed_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
        }))
    }

    async fn place_market(&self, request: &MarketOrderRequest) -> ExchangeResult<String> {
        // Market orders fill immediately at the mark price.
        let mark = self
            .state
            .lock()
            .unwrap()
            .mark_prices
            .get(&request.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);
        Ok(self.insert_order(MockOrder {
            symbol: request.symbol.clone(),
            side: request.side.to_string(),
            price: None,
            stop_price: None,
            quantity: request.quantity,
            post_only: false,
            reduce_only: request.reduce_only,
            order_type: "MARKET",
            status: OrderStatus::Filled,
            executed_qty: request.quantity,
            avg_fill_price: mark,
        }))
    }

    async fn place_stop_market(&self, request: &StopOrderRequest) -> ExchangeResult<String> {
        Ok(self.insert_order(MockOrder {
            symbol: request.symbol.clone(),
            side: request.side.to_string(),
            price: None,
            stop_price: Some(request.stop_price),
            quantity: request.quantity,
            post_only: false,
            reduce_only: true,
            order_type: "STOP_MARKET",
            status: OrderStatus::New,
            executed_qty: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
        }))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.orders.get_mut(order_id) {
            Some(order) if order.status.is_open() => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(ExchangeError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<OrderState> {
        let state = self.state.lock().unwrap();
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        Ok(OrderState {
            order_id: order_id.to_string(),
            status: order.status,
            executed_qty: order.executed_qty,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn get_positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .positions
            .iter()
            .filter(|p| symbol.map(|s| p.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn set_leverage(
        &self,
        symbol: &str,
        side: Side,
        leverage: Decimal,
    ) -> ExchangeResult<()> {
        self.state.lock().unwrap().leverage_calls.push((
            symbol.to_string(),
            side.as_str().to_string(),
            leverage,
        ));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Mock chat
// ---------------------------------------------------------------------

#[derive(Default)]
struct MockChat {
    sent: Mutex<Vec<(String, String)>>,
}

impl MockChat {
    fn sent_to(&self, chat_id: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == chat_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl ChatSource for MockChat {
    async fn subscribe(
        &self,
        _channels: &[ChannelSpec],
        _shutdown: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<ChatMessage>, ChatError> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<(), ChatError> {
        self.sent
            .lock()
            .unwrap()
            .push((chat_id.to_string(), text.to_string()));
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------

fn test_config() -> EngineConfig {
    EngineConfig {
        database_url: "sqlite::memory:".to_string(),
        telemetry_path: "unused".to_string(),
        dedup_ttl: Duration::from_secs(7200),
        telegram: TelegramConfig {
            bot_token: String::new(),
            source_channels: vec![ChannelSpec {
                name: "CRYPTOR".to_string(),
                chat_id: "-100123".to_string(),
            }],
            destination_chat_id: "dest".to_string(),
            operator_chat_id: "ops".to_string(),
            poll_interval: Duration::from_secs(2),
        },
        bingx: BingxConfig {
            api_key: String::new(),
            secret_key: String::new(),
            base_url: String::new(),
            request_timeout: Duration::from_secs(5),
            max_retries: 0,
        },
        trading: TradingConfig {
            enabled: true,
            extract_only: false,
            risk_per_trade: dec!(0.02),
            initial_margin: dec!(20.00),
            balance_baseline: dec!(402.10),
            min_leverage: dec!(6.00),
            max_leverage: dec!(50.00),
            entry_spread_pct: dec!(0.001),
            max_price_shifts: 50,
            entry_workers: 1,
            entry_poll_interval: Duration::from_secs(3),
            claim_lease: Duration::from_secs(600),
        },
        lifecycle: LifecycleConfig {
            poll_interval: Duration::from_secs(3),
            breakeven_epsilon_pct: dec!(0.0015),
            trail_trigger_pct: dec!(6.1),
            trail_distance_pct: dec!(2.5),
            trail_min_amend_interval: Duration::from_secs(10),
        },
        pyramid: PyramidConfig {
            enabled: true,
            scales: vec![
                PyramidScale {
                    id: 1,
                    threshold_pct: dec!(3.0),
                    add_fraction: dec!(0.50),
                },
                PyramidScale {
                    id: 2,
                    threshold_pct: dec!(6.0),
                    add_fraction: dec!(0.25),
                },
            ],
            max_multiplier: dec!(2.0),
            poll_interval: Duration::from_secs(30),
        },
        hedge: HedgeConfig {
            enabled: true,
            adverse_move_pct: dec!(2.0),
            poll_interval: Duration::from_secs(30),
            max_reentry_attempts: 3,
        },
        maintenance: MaintenanceConfig {
            interval: Duration::from_secs(3600),
            unfilled_entry_timeout: Duration::from_secs(24 * 3600),
            stale_order_timeout: Duration::from_secs(6 * 86_400),
        },
        watchdog: WatchdogConfig {
            poll_interval: Duration::from_secs(10),
            max_active_trades: 100,
        },
    }
}

struct Harness {
    config: EngineConfig,
    signal_store: SignalStore,
    lifecycle_store: LifecycleStore,
    exchange: Arc<MockExchange>,
    chat: Arc<MockChat>,
    publisher: Arc<Publisher>,
    telemetry: Arc<TelemetrySink>,
    watchdog: Watchdog,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    async fn with_config(config: EngineConfig) -> Self {
        let pool = init_database("sqlite::memory:").await.unwrap();
        let signal_store = SignalStore::new(pool.clone());
        let lifecycle_store = LifecycleStore::new(pool);
        let exchange = MockExchange::new();
        let chat = Arc::new(MockChat::default());
        let telemetry = Arc::new(TelemetrySink::disabled());
        let publisher = Arc::new(Publisher::new(
            chat.clone(),
            config.telegram.destination_chat_id.clone(),
            config.telegram.operator_chat_id.clone(),
            telemetry.clone(),
        ));
        let watchdog = Watchdog::new(
            signal_store.clone(),
            lifecycle_store.clone(),
            telemetry.clone(),
            config.watchdog.clone(),
        );
        Self {
            config,
            signal_store,
            lifecycle_store,
            exchange,
            chat,
            publisher,
            telemetry,
            watchdog,
        }
    }

    fn ingestion(&self) -> IngestionPipeline {
        IngestionPipeline::new(
            self.signal_store.clone(),
            self.telemetry.clone(),
            self.config.dedup_ttl,
        )
    }

    fn entry_engine(&self) -> Arc<EntryEngine> {
        Arc::new(EntryEngine::new(
            self.config.clone(),
            self.signal_store.clone(),
            self.lifecycle_store.clone(),
            self.exchange.clone(),
            self.publisher.clone(),
            self.telemetry.clone(),
            self.watchdog.guard(),
            "entry-test".to_string(),
        ))
    }

    fn lifecycle(&self) -> LifecycleManager {
        LifecycleManager::new(
            self.config.clone(),
            self.signal_store.clone(),
            self.lifecycle_store.clone(),
            self.exchange.clone(),
            self.publisher.clone(),
            self.telemetry.clone(),
        )
    }

    fn pyramid(&self) -> PyramidManager {
        PyramidManager::new(
            self.config.clone(),
            self.lifecycle_store.clone(),
            self.exchange.clone(),
            self.telemetry.clone(),
        )
    }

    fn hedge(&self) -> HedgeReentryManager {
        HedgeReentryManager::new(
            self.config.clone(),
            self.signal_store.clone(),
            self.lifecycle_store.clone(),
            self.exchange.clone(),
            self.entry_engine(),
            self.telemetry.clone(),
        )
    }

    fn message(&self, id: i64, text: &str) -> ChatMessage {
        ChatMessage {
            chat_id: "-100123".to_string(),
            channel_name: "CRYPTOR".to_string(),
            message_id: id,
            timestamp: Some(Utc::now()),
            text: text.to_string(),
        }
    }

    /// Persist a signal directly (bypassing the detector) and return its id.
    async fn seed_signal(
        &self,
        symbol: &str,
        side: Side,
        entry: Decimal,
        sl: Option<Decimal>,
        targets: Vec<Decimal>,
    ) -> i64 {
        let signal = NormalizedSignal {
            channel_name: "CRYPTOR".to_string(),
            chat_id: "-100123".to_string(),
            message_id: rand_id(),
            message_ts: None,
            received_at: Utc::now(),
            symbol: symbol.to_string(),
            side,
            entry_mid: entry,
            entry_low: None,
            entry_high: None,
            targets,
            stop_loss: sl,
            declared_leverage: None,
            type_hint: None,
            raw_text: "seeded".to_string(),
        };
        match self
            .signal_store
            .insert_signal(&signal, &format!("hash-{}", signal.message_id), self.config.dedup_ttl)
            .await
            .unwrap()
        {
            InsertOutcome::Inserted(id) => id,
            other => panic!("seed insert failed: {:?}", other),
        }
    }
}

fn rand_id() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as i64
}

const GUN_SIGNAL: &str = "#GUN/USDT LONG Entry zone 0.02350 - 0.02320 \
                          Targets: 0.02375, 0.02400 Stop loss 0.02234";

// ---------------------------------------------------------------------
// Flows
// ---------------------------------------------------------------------

#[tokio::test]
async fn signal_accepted_placed_filled_and_protected() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("GUNUSDT", dec!(0.00001), dec!(1), dec!(1), dec!(0.02360));

    // Ingest.
    let outcome = harness
        .ingestion()
        .process_message(&harness.message(1, GUN_SIGNAL))
        .await
        .unwrap();
    assert!(matches!(outcome, IngestOutcome::Accepted(_)));

    // Capacity becomes known, then the entry engine claims and places.
    harness.watchdog.tick().await.unwrap();
    let engine = harness.entry_engine();
    engine.tick().await.unwrap();

    let placed = harness.exchange.orders_of_type("LIMIT");
    assert_eq!(placed.len(), 2);
    let mut quantities: Vec<Decimal> = placed.iter().map(|(_, o)| o.quantity).collect();
    quantities.sort();
    assert_eq!(quantities, vec![dec!(3982), dec!(3983)]);
    for (_, order) in &placed {
        assert!(order.post_only);
        assert!(!order.reduce_only);
        assert_eq!(order.side, "BUY");
        // Post-only resting below the last traded price.
        assert!(order.price.unwrap() < dec!(0.02360));
    }

    let positions = harness
        .lifecycle_store
        .list_by_states(&[PositionState::PendingEntry])
        .await
        .unwrap();
    assert_eq!(positions.len(), 1);
    let position = &positions[0];
    assert_eq!(position.planned_qty(), dec!(7965));
    assert_eq!(position.leverage(), dec!(9.30));

    // Fill both legs, poll again: the position opens.
    for (id, order) in &placed {
        harness.exchange.fill(id, order.quantity, order.price.unwrap());
    }
    engine.tick().await.unwrap();

    let position = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert_eq!(position.state(), PositionState::Open);
    assert!(position.original_entry_price().is_some());
    assert_eq!(position.filled_qty(), dec!(7965));

    // Lifecycle attaches two reduce-only TPs and one stop.
    harness.lifecycle().tick().await.unwrap();

    let reduce_only_tps: Vec<_> = harness
        .exchange
        .orders_of_type("LIMIT")
        .into_iter()
        .filter(|(_, o)| o.reduce_only)
        .collect();
    assert_eq!(reduce_only_tps.len(), 2);
    let tp_share_sum: Decimal = reduce_only_tps.iter().map(|(_, o)| o.quantity).sum();
    assert!(tp_share_sum <= dec!(7965));

    let stops = harness.exchange.orders_of_type("STOP_MARKET");
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].1.stop_price, Some(dec!(0.02234)));

    // Confirmation went out only after all of that was acknowledged.
    let published = harness.chat.sent_to("dest");
    assert_eq!(published.len(), 1);
    assert!(published[0].starts_with("SENT ONLY AFTER EXCHANGE CONFIRMATION"));
    assert!(published[0].contains("Symbol: GUNUSDT"));
    assert!(published[0].contains("Leverage: x9.30"));
    assert!(published[0].contains("position_opened: true"));
}

#[tokio::test]
async fn partial_fill_merges_into_replacement() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("GUNUSDT", dec!(0.00001), dec!(1), dec!(1), dec!(0.02360));

    harness
        .ingestion()
        .process_message(&harness.message(1, GUN_SIGNAL))
        .await
        .unwrap();
    harness.watchdog.tick().await.unwrap();
    let engine = harness.entry_engine();
    engine.tick().await.unwrap();

    let placed = harness.exchange.orders_of_type("LIMIT");
    assert_eq!(placed.len(), 2);
    // Fill only the lower leg.
    let (low_id, low) = placed
        .iter()
        .min_by_key(|(_, o)| o.price.unwrap())
        .unwrap()
        .clone();
    harness.exchange.fill(&low_id, low.quantity, low.price.unwrap());

    engine.tick().await.unwrap();

    let positions = harness
        .lifecycle_store
        .list_by_states(&[PositionState::Partial])
        .await
        .unwrap();
    assert_eq!(positions.len(), 1);
    let position = &positions[0];
    assert!(position.replacement_order_id.is_some());
    // First fill fixes the immutable basis.
    assert_eq!(position.original_entry_price(), Some(low.price.unwrap()));

    // The surviving original was cancelled; only the replacement rests.
    let open = harness.exchange.open_order_ids();
    assert_eq!(open.len(), 1);
    let replacement = harness.exchange.order(&open[0]);
    assert!(replacement.post_only);
    assert_eq!(replacement.quantity, dec!(7965) - low.quantity);
    // Replacement reprices toward the intended mid from the cheap fill.
    assert!(replacement.price.unwrap() > low.price.unwrap());

    // Replay with unchanged exchange state: no second replacement.
    engine.tick().await.unwrap();
    assert_eq!(harness.exchange.open_order_ids().len(), 1);

    // Fill the replacement; the position opens with the full quantity.
    harness
        .exchange
        .fill(&open[0], replacement.quantity, replacement.price.unwrap());
    engine.tick().await.unwrap();
    let position = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert_eq!(position.state(), PositionState::Open);
    assert_eq!(position.filled_qty(), dec!(7965));
    assert_eq!(position.original_entry_price(), Some(low.price.unwrap()));
}

#[tokio::test]
async fn below_min_quantity_rejects_signal_with_operator_notice() {
    let harness = Harness::new().await;
    // Minimum quantity far above anything the sizing can produce.
    harness
        .exchange
        .add_symbol("GUNUSDT", dec!(0.00001), dec!(1), dec!(1000000), dec!(0.02360));

    harness
        .ingestion()
        .process_message(&harness.message(1, GUN_SIGNAL))
        .await
        .unwrap();
    harness.watchdog.tick().await.unwrap();
    harness.entry_engine().tick().await.unwrap();

    let claimed = harness.signal_store.claim_next("probe", Duration::from_secs(600)).await.unwrap();
    assert!(claimed.is_none(), "rejected signal must not be claimable");

    let notices = harness.chat.sent_to("ops");
    assert_eq!(notices.len(), 1);
    assert!(notices[0].contains("REJECTED"));
    assert!(notices[0].contains("GUNUSDT"));
}

#[tokio::test]
async fn capacity_block_leaves_signal_new() {
    let mut config = test_config();
    config.watchdog.max_active_trades = 0;
    let harness = Harness::with_config(config).await;
    harness
        .exchange
        .add_symbol("GUNUSDT", dec!(0.00001), dec!(1), dec!(1), dec!(0.02360));

    let outcome = harness
        .ingestion()
        .process_message(&harness.message(1, GUN_SIGNAL))
        .await
        .unwrap();
    let IngestOutcome::Accepted(id) = outcome else {
        panic!("expected acceptance");
    };

    harness.watchdog.tick().await.unwrap();
    harness.entry_engine().tick().await.unwrap();

    // Nothing placed, signal untouched.
    assert!(harness.exchange.orders_of_type("LIMIT").is_empty());
    let signal = harness.signal_store.get(id).await.unwrap().unwrap();
    assert_eq!(signal.status, "NEW");
}

#[tokio::test]
async fn pyramid_ladder_adds_and_respects_cap() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("TESTUSDT", dec!(0.01), dec!(0.1), dec!(0.1), dec!(100));

    let signal_id = harness
        .seed_signal("TESTUSDT", Side::Long, dec!(100), Some(dec!(95)), vec![dec!(110)])
        .await;
    let position = harness
        .lifecycle_store
        .create_position(kasima::persistence::models::CreatePosition {
            signal_id,
            bot_order_id: "bot-pyramid".to_string(),
            symbol: "TESTUSDT".to_string(),
            side: Side::Long,
            planned_qty: dec!(10),
            leverage: dec!(10.00),
            initial_margin: dec!(20.00),
            sl_price: dec!(95),
            tp_levels: vec![],
            entry_order_ids: vec![],
        })
        .await
        .unwrap();
    harness
        .lifecycle_store
        .record_entry_fill(position.id, dec!(10), dec!(10), dec!(100))
        .await
        .unwrap();
    harness
        .lifecycle_store
        .transition(position.id, &[PositionState::PendingEntry], PositionState::Open, None)
        .await
        .unwrap();

    let pyramid = harness.pyramid();

    // +3%: first scale adds 50% of planned.
    harness.exchange.set_mark("TESTUSDT", dec!(103));
    pyramid.tick().await.unwrap();
    let adds = harness.exchange.orders_of_type("MARKET");
    assert_eq!(adds.len(), 1);
    assert_eq!(adds[0].1.quantity, dec!(5.0));

    // Replay at the same price: scale 1 is one-shot.
    pyramid.tick().await.unwrap();
    assert_eq!(harness.exchange.orders_of_type("MARKET").len(), 1);

    // +6%: second scale adds 25%.
    harness.exchange.set_mark("TESTUSDT", dec!(106));
    pyramid.tick().await.unwrap();
    let adds = harness.exchange.orders_of_type("MARKET");
    assert_eq!(adds.len(), 2);
    let total_added: Decimal = adds.iter().map(|(_, o)| o.quantity).sum();
    assert_eq!(total_added, dec!(7.5));
    assert!(total_added <= dec!(10) * (dec!(2.0) - Decimal::ONE));

    let current = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    let pyramid_state = current.pyramid_state();
    assert!(pyramid_state.has_scale(1));
    assert!(pyramid_state.has_scale(2));
}

#[tokio::test]
async fn adverse_move_opens_hedge_then_reentry_after_hedge_tp() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("TESTUSDT", dec!(0.01), dec!(0.1), dec!(0.1), dec!(100));

    let signal_id = harness
        .seed_signal("TESTUSDT", Side::Long, dec!(100), Some(dec!(95)), vec![dec!(110)])
        .await;
    let position = harness
        .lifecycle_store
        .create_position(kasima::persistence::models::CreatePosition {
            signal_id,
            bot_order_id: "bot-hedge".to_string(),
            symbol: "TESTUSDT".to_string(),
            side: Side::Long,
            planned_qty: dec!(10),
            leverage: dec!(10.00),
            initial_margin: dec!(20.00),
            sl_price: dec!(95),
            tp_levels: vec![],
            entry_order_ids: vec![],
        })
        .await
        .unwrap();
    harness
        .lifecycle_store
        .record_entry_fill(position.id, dec!(10), dec!(10), dec!(100))
        .await
        .unwrap();
    harness
        .lifecycle_store
        .transition(position.id, &[PositionState::PendingEntry], PositionState::Open, None)
        .await
        .unwrap();

    let hedge = harness.hedge();

    // Mark at 98.00: exactly -2% against the original entry.
    harness.exchange.set_mark("TESTUSDT", dec!(98));
    hedge.tick().await.unwrap();

    let current = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert_eq!(current.hedge_state(), HedgeState::Hedged);
    assert!(current.hedge_entry_order_id.is_some());

    // Hedge entry is a counter-direction market order of the full size.
    let hedge_entry = harness
        .exchange
        .order(current.hedge_entry_order_id.as_deref().unwrap());
    assert_eq!(hedge_entry.side, "SELL");
    assert_eq!(hedge_entry.quantity, dec!(10));

    // Hedge TP rests at the original entry, hedge SL at the original stop.
    let hedge_tp = harness
        .exchange
        .order(current.hedge_tp_order_id.as_deref().unwrap());
    assert_eq!(hedge_tp.stop_price, Some(dec!(100)));
    let hedge_sl = harness
        .exchange
        .order(current.hedge_sl_order_id.as_deref().unwrap());
    assert_eq!(hedge_sl.price, Some(dec!(95)));
    assert!(hedge_sl.reduce_only);

    // Replay: the hedge is one-shot.
    hedge.tick().await.unwrap();
    let replay = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert_eq!(replay.hedge_entry_order_id, current.hedge_entry_order_id);

    // Price recovers to the entry: the hedge TP fills, which counts as the
    // primary SL event and triggers a fresh dual-limit re-entry.
    harness.exchange.set_mark("TESTUSDT", dec!(100.2));
    let tp_id = current.hedge_tp_order_id.clone().unwrap();
    harness.exchange.fill(&tp_id, dec!(10), dec!(100));
    hedge.tick().await.unwrap();

    let closed = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert_eq!(closed.state(), PositionState::Closed);
    assert_eq!(closed.hedge_state(), HedgeState::HedgeClosed);
    assert_eq!(closed.close_reason.as_deref(), Some("stop_hit"));

    // Re-entry: a new PENDING_ENTRY position for the same signal.
    let pending = harness
        .lifecycle_store
        .list_by_states(&[PositionState::PendingEntry])
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].signal_id, signal_id);

    // A successful re-entry spends none of the failed-attempt budget.
    let signal = harness.signal_store.get(signal_id).await.unwrap().unwrap();
    assert_eq!(signal.reentry_attempts, 0);
    assert!(!harness
        .signal_store
        .is_reentry_locked("TESTUSDT", Side::Long)
        .await
        .unwrap());
}

#[tokio::test]
async fn failed_reentries_increment_counter_and_lock_out() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("TESTUSDT", dec!(0.01), dec!(0.1), dec!(0.1), dec!(100));

    let signal_id = harness
        .seed_signal("TESTUSDT", Side::Long, dec!(100), Some(dec!(95)), vec![dec!(110)])
        .await;
    let position = harness
        .lifecycle_store
        .create_position(kasima::persistence::models::CreatePosition {
            signal_id,
            bot_order_id: "bot-reentry-fail".to_string(),
            symbol: "TESTUSDT".to_string(),
            side: Side::Long,
            planned_qty: dec!(10),
            leverage: dec!(10.00),
            initial_margin: dec!(20.00),
            sl_price: dec!(95),
            tp_levels: vec![],
            entry_order_ids: vec![],
        })
        .await
        .unwrap();
    harness
        .lifecycle_store
        .record_entry_fill(position.id, dec!(10), dec!(10), dec!(100))
        .await
        .unwrap();
    harness
        .lifecycle_store
        .transition(position.id, &[PositionState::PendingEntry], PositionState::Open, None)
        .await
        .unwrap();

    let hedge = harness.hedge();

    // Open the hedge on the adverse move, then fill its TP.
    harness.exchange.set_mark("TESTUSDT", dec!(98));
    hedge.tick().await.unwrap();
    let hedged = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    let tp_id = hedged.hedge_tp_order_id.clone().unwrap();
    harness.exchange.fill(&tp_id, dec!(10), dec!(100));

    // The mark stays at 98, so a fresh LONG dual-limit around the 100
    // entry cannot be made maker-safe within the shift budget and every
    // re-entry attempt fails.
    hedge.tick().await.unwrap();
    let signal = harness.signal_store.get(signal_id).await.unwrap().unwrap();
    assert_eq!(signal.reentry_attempts, 1);
    assert!(!harness
        .signal_store
        .is_reentry_locked("TESTUSDT", Side::Long)
        .await
        .unwrap());

    hedge.tick().await.unwrap();
    let signal = harness.signal_store.get(signal_id).await.unwrap().unwrap();
    assert_eq!(signal.reentry_attempts, 2);

    // The third failure exhausts the budget and locks the (symbol, side).
    hedge.tick().await.unwrap();
    let signal = harness.signal_store.get(signal_id).await.unwrap().unwrap();
    assert_eq!(signal.reentry_attempts, 3);
    assert!(harness
        .signal_store
        .is_reentry_locked("TESTUSDT", Side::Long)
        .await
        .unwrap());

    // Locked: further scans neither attempt nor count.
    hedge.tick().await.unwrap();
    let signal = harness.signal_store.get(signal_id).await.unwrap().unwrap();
    assert_eq!(signal.reentry_attempts, 3);

    // No re-entry position ever materialized.
    assert!(harness
        .lifecycle_store
        .list_by_states(&[PositionState::PendingEntry])
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn tp2_fill_moves_stop_to_breakeven() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("GUNUSDT", dec!(0.00001), dec!(1), dec!(1), dec!(0.02360));

    harness
        .ingestion()
        .process_message(&harness.message(1, GUN_SIGNAL))
        .await
        .unwrap();
    harness.watchdog.tick().await.unwrap();
    let engine = harness.entry_engine();
    engine.tick().await.unwrap();
    for (id, order) in harness.exchange.orders_of_type("LIMIT") {
        harness.exchange.fill(&id, order.quantity, order.price.unwrap());
    }
    engine.tick().await.unwrap();
    let lifecycle = harness.lifecycle();
    lifecycle.tick().await.unwrap();

    let open_positions = harness
        .lifecycle_store
        .list_by_states(&[PositionState::Open])
        .await
        .unwrap();
    let position = &open_positions[0];
    let entry = position.original_entry_price().unwrap();

    // Fill TP2 (index 1) in full.
    let levels = position.tp_levels();
    let tp2 = levels.iter().find(|l| l.index == 1).unwrap();
    let tp2_order = tp2.order_id.clone().unwrap();
    harness
        .exchange
        .fill(&tp2_order, tp2.share_qty, tp2.price);
    lifecycle.tick().await.unwrap();

    let updated = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    let expected = entry + entry * dec!(0.0015) / Decimal::ONE_HUNDRED;
    assert_eq!(updated.sl_price(), Some(expected));
    // The stop order itself was replaced.
    assert_ne!(updated.sl_order_id, position.sl_order_id);
}

#[tokio::test]
async fn trailing_stop_arms_and_rate_limits() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("TESTUSDT", dec!(0.01), dec!(0.1), dec!(0.1), dec!(100));

    let signal_id = harness
        .seed_signal("TESTUSDT", Side::Long, dec!(100), Some(dec!(95)), vec![dec!(120)])
        .await;
    let position = harness
        .lifecycle_store
        .create_position(kasima::persistence::models::CreatePosition {
            signal_id,
            bot_order_id: "bot-trail".to_string(),
            symbol: "TESTUSDT".to_string(),
            side: Side::Long,
            planned_qty: dec!(10),
            leverage: dec!(10.00),
            initial_margin: dec!(20.00),
            sl_price: dec!(95),
            tp_levels: vec![kasima::domain::entities::position::TpLevel::new(
                0,
                dec!(120),
                dec!(10),
            )],
            entry_order_ids: vec![],
        })
        .await
        .unwrap();
    harness
        .lifecycle_store
        .record_entry_fill(position.id, dec!(10), dec!(10), dec!(100))
        .await
        .unwrap();
    harness
        .lifecycle_store
        .transition(position.id, &[PositionState::PendingEntry], PositionState::Open, None)
        .await
        .unwrap();

    let lifecycle = harness.lifecycle();
    // First tick attaches TP/SL at the original levels.
    lifecycle.tick().await.unwrap();

    // +6.5% arms trailing: stop moves to peak * (1 - 2.5%).
    harness.exchange.set_mark("TESTUSDT", dec!(106.5));
    lifecycle.tick().await.unwrap();

    let trailed = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert!(trailed.trailing_active());
    assert_eq!(trailed.peak_price(), Some(dec!(106.5)));
    let expected = dec!(106.5) - dec!(106.5) * dec!(0.025);
    assert_eq!(trailed.sl_price(), Some(expected.round_dp(2)));

    // Another favorable tick within the rate-limit window: no amendment.
    let sl_before = trailed.sl_order_id.clone();
    harness.exchange.set_mark("TESTUSDT", dec!(107.0));
    lifecycle.tick().await.unwrap();
    let rate_limited = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert_eq!(rate_limited.sl_order_id, sl_before);
    // Peak still advances even while amendments are throttled.
    assert_eq!(rate_limited.peak_price(), Some(dec!(107.0)));
}

#[tokio::test]
async fn replaying_unchanged_exchange_state_is_idempotent() {
    let harness = Harness::new().await;
    harness
        .exchange
        .add_symbol("GUNUSDT", dec!(0.00001), dec!(1), dec!(1), dec!(0.02360));

    harness
        .ingestion()
        .process_message(&harness.message(1, GUN_SIGNAL))
        .await
        .unwrap();
    harness.watchdog.tick().await.unwrap();
    let engine = harness.entry_engine();
    engine.tick().await.unwrap();
    for (id, order) in harness.exchange.orders_of_type("LIMIT") {
        harness.exchange.fill(&id, order.quantity, order.price.unwrap());
    }
    engine.tick().await.unwrap();
    let lifecycle = harness.lifecycle();
    lifecycle.tick().await.unwrap();

    let open_positions = harness
        .lifecycle_store
        .list_by_states(&[PositionState::Open])
        .await
        .unwrap();
    let position = &open_positions[0];
    let state_before = (
        position.state(),
        position.filled_qty(),
        position.remaining_qty(),
        position.sl_order_id.clone(),
        position.tp_levels().len(),
    );
    let orders_before = harness.exchange.open_order_ids().len();
    let published_before = harness.chat.sent_to("dest").len();

    // Re-run both pollers against identical exchange state.
    engine.tick().await.unwrap();
    lifecycle.tick().await.unwrap();
    lifecycle.tick().await.unwrap();

    let replay = harness.lifecycle_store.get(position.id).await.unwrap().unwrap();
    assert_eq!(
        (
            replay.state(),
            replay.filled_qty(),
            replay.remaining_qty(),
            replay.sl_order_id.clone(),
            replay.tp_levels().len(),
        ),
        state_before
    );
    assert_eq!(harness.exchange.open_order_ids().len(), orders_before);
    assert_eq!(harness.chat.sent_to("dest").len(), published_before);
}
