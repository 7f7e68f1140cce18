//! Engine configuration.
//!
//! Every tunable lives here, loaded from environment variables with
//! defaults. Nothing else in the crate reads the environment: the config
//! is built once in `main` and handed to each subsystem.

use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

/// A monitored source channel.
#[derive(Debug, Clone)]
pub struct ChannelSpec {
    pub name: String,
    pub chat_id: String,
}

/// Telegram connectivity: monitored channels plus the two outbound targets.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub source_channels: Vec<ChannelSpec>,
    /// Channel that receives the post-confirmation order template.
    pub destination_chat_id: String,
    /// Channel that receives rejection / failure notices.
    pub operator_chat_id: String,
    pub poll_interval: Duration,
}

/// BingX API connectivity.
#[derive(Debug, Clone)]
pub struct BingxConfig {
    pub api_key: String,
    pub secret_key: String,
    pub base_url: String,
    pub request_timeout: Duration,
    /// Retries per call before the operation is left pending.
    pub max_retries: u32,
}

pub const BINGX_API_BASE: &str = "https://open-api.bingx.com";
pub const BINGX_TESTNET_BASE: &str = "https://open-api-vst.bingx.com";

/// Risk and sizing parameters.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub enabled: bool,
    /// Extract-only mode: ingestion persists signals but nothing is claimed.
    pub extract_only: bool,
    /// Fraction of balance risked per trade.
    pub risk_per_trade: Decimal,
    /// Planned initial margin per trade, in balance units.
    pub initial_margin: Decimal,
    /// Used when the balance endpoint is unreachable.
    pub balance_baseline: Decimal,
    pub min_leverage: Decimal,
    pub max_leverage: Decimal,
    /// Half-spread for dual-limit entries, as a fraction of the entry mid.
    pub entry_spread_pct: Decimal,
    /// Tick shifts allowed while nudging prices maker-safe.
    pub max_price_shifts: u32,
    pub entry_workers: usize,
    pub entry_poll_interval: Duration,
    /// Stale CLAIMED rows become claimable again after this lease.
    pub claim_lease: Duration,
}

/// Lifecycle (TP/SL) tunables.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub poll_interval: Duration,
    /// Break-even offset applied when TP2 fills, as a percent of entry.
    pub breakeven_epsilon_pct: Decimal,
    /// Unrealized profit (percent of entry) that arms the trailing stop.
    pub trail_trigger_pct: Decimal,
    /// Trailing distance behind the peak, percent of entry.
    pub trail_distance_pct: Decimal,
    /// Minimum interval between SL amendments per position.
    pub trail_min_amend_interval: Duration,
}

/// One pyramid scale: add `add_fraction` of planned qty once unrealized
/// profit reaches `threshold_pct` percent of the original entry.
#[derive(Debug, Clone)]
pub struct PyramidScale {
    pub id: u32,
    pub threshold_pct: Decimal,
    pub add_fraction: Decimal,
}

#[derive(Debug, Clone)]
pub struct PyramidConfig {
    pub enabled: bool,
    pub scales: Vec<PyramidScale>,
    /// Total position may never exceed this multiple of the planned qty.
    pub max_multiplier: Decimal,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct HedgeConfig {
    pub enabled: bool,
    /// Adverse move (percent of original entry) that opens the hedge.
    pub adverse_move_pct: Decimal,
    pub poll_interval: Duration,
    pub max_reentry_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    pub interval: Duration,
    /// Entry orders with zero fills are cancelled after this age.
    pub unfilled_entry_timeout: Duration,
    /// Any order still unfilled after this age is cancelled and purged.
    pub stale_order_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub poll_interval: Duration,
    pub max_active_trades: i64,
}

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub telemetry_path: String,
    pub dedup_ttl: Duration,
    pub telegram: TelegramConfig,
    pub bingx: BingxConfig,
    pub trading: TradingConfig,
    pub lifecycle: LifecycleConfig,
    pub pyramid: PyramidConfig,
    pub hedge: HedgeConfig,
    pub maintenance: MaintenanceConfig,
    pub watchdog: WatchdogConfig,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: &str) -> Decimal {
    std::env::var(key)
        .ok()
        .and_then(|s| Decimal::from_str(&s).ok())
        .unwrap_or_else(|| Decimal::from_str(default).expect("valid default decimal"))
}

fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs))
}

/// Parse `NAME:chat_id,NAME:chat_id` into channel specs.
fn parse_channels(raw: &str) -> Vec<ChannelSpec> {
    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            let (name, chat_id) = pair.split_once(':')?;
            Some(ChannelSpec {
                name: name.trim().to_string(),
                chat_id: chat_id.trim().to_string(),
            })
        })
        .collect()
}

impl EngineConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let testnet: bool = env_parse("KASIMA_BINGX_TESTNET", false);
        let base_url = if testnet {
            BINGX_TESTNET_BASE.to_string()
        } else {
            env_str("KASIMA_BINGX_BASE_URL", BINGX_API_BASE)
        };

        Self {
            database_url: env_str("DATABASE_URL", "sqlite://data/kasima.db"),
            telemetry_path: env_str("KASIMA_TELEMETRY_PATH", "logs/telemetry.jsonl"),
            dedup_ttl: Duration::from_secs(env_parse("KASIMA_DEDUP_TTL_HOURS", 2u64) * 3600),
            telegram: TelegramConfig {
                bot_token: env_str("KASIMA_TELEGRAM_BOT_TOKEN", ""),
                source_channels: parse_channels(&env_str("KASIMA_SOURCE_CHANNELS", "")),
                destination_chat_id: env_str("KASIMA_DESTINATION_CHAT_ID", ""),
                operator_chat_id: env_str("KASIMA_OPERATOR_CHAT_ID", ""),
                poll_interval: env_secs("KASIMA_TELEGRAM_POLL_SECONDS", 2),
            },
            bingx: BingxConfig {
                api_key: env_str("KASIMA_BINGX_API_KEY", ""),
                secret_key: env_str("KASIMA_BINGX_SECRET_KEY", ""),
                base_url,
                request_timeout: env_secs("KASIMA_BINGX_TIMEOUT_SECONDS", 5),
                max_retries: env_parse("KASIMA_BINGX_MAX_RETRIES", 3u32),
            },
            trading: TradingConfig {
                enabled: env_parse("KASIMA_ENABLE_TRADING", true),
                extract_only: env_parse("KASIMA_EXTRACT_ONLY", false),
                risk_per_trade: env_decimal("KASIMA_RISK_PER_TRADE", "0.02"),
                initial_margin: env_decimal("KASIMA_INITIAL_MARGIN", "20.00"),
                balance_baseline: env_decimal("KASIMA_BALANCE_BASELINE", "402.10"),
                min_leverage: env_decimal("KASIMA_MIN_LEVERAGE", "6.00"),
                max_leverage: env_decimal("KASIMA_MAX_LEVERAGE", "50.00"),
                entry_spread_pct: env_decimal("KASIMA_ENTRY_SPREAD_PCT", "0.001"),
                max_price_shifts: env_parse("KASIMA_MAX_PRICE_SHIFTS", 50u32),
                entry_workers: env_parse("KASIMA_ENTRY_WORKERS", 2usize),
                entry_poll_interval: env_secs("KASIMA_ENTRY_POLL_SECONDS", 3),
                claim_lease: env_secs("KASIMA_CLAIM_LEASE_SECONDS", 600),
            },
            lifecycle: LifecycleConfig {
                poll_interval: env_secs("KASIMA_LIFECYCLE_POLL_SECONDS", 3),
                breakeven_epsilon_pct: env_decimal("KASIMA_BREAKEVEN_EPSILON_PCT", "0.0015"),
                trail_trigger_pct: env_decimal("KASIMA_TRAIL_TRIGGER_PCT", "6.1"),
                trail_distance_pct: env_decimal("KASIMA_TRAIL_DISTANCE_PCT", "2.5"),
                trail_min_amend_interval: env_secs("KASIMA_TRAIL_AMEND_SECONDS", 10),
            },
            pyramid: PyramidConfig {
                enabled: env_parse("KASIMA_ENABLE_PYRAMID", true),
                scales: vec![
                    PyramidScale {
                        id: 1,
                        threshold_pct: env_decimal("KASIMA_PYRAMID_THRESHOLD_1", "3.0"),
                        add_fraction: env_decimal("KASIMA_PYRAMID_ADD_1", "0.50"),
                    },
                    PyramidScale {
                        id: 2,
                        threshold_pct: env_decimal("KASIMA_PYRAMID_THRESHOLD_2", "6.0"),
                        add_fraction: env_decimal("KASIMA_PYRAMID_ADD_2", "0.25"),
                    },
                ],
                max_multiplier: env_decimal("KASIMA_PYRAMID_MAX_MULTIPLIER", "2.0"),
                poll_interval: env_secs("KASIMA_PYRAMID_POLL_SECONDS", 30),
            },
            hedge: HedgeConfig {
                enabled: env_parse("KASIMA_ENABLE_HEDGE", true),
                adverse_move_pct: env_decimal("KASIMA_HEDGE_ADVERSE_PCT", "2.0"),
                poll_interval: env_secs("KASIMA_HEDGE_POLL_SECONDS", 30),
                max_reentry_attempts: env_parse("KASIMA_MAX_REENTRY_ATTEMPTS", 3u32),
            },
            maintenance: MaintenanceConfig {
                interval: env_secs("KASIMA_MAINTENANCE_SECONDS", 3600),
                unfilled_entry_timeout: Duration::from_secs(
                    env_parse("KASIMA_UNFILLED_ENTRY_HOURS", 24u64) * 3600,
                ),
                stale_order_timeout: Duration::from_secs(
                    env_parse("KASIMA_STALE_ORDER_DAYS", 6u64) * 86_400,
                ),
            },
            watchdog: WatchdogConfig {
                poll_interval: env_secs("KASIMA_WATCHDOG_POLL_SECONDS", 10),
                max_active_trades: env_parse("KASIMA_MAX_ACTIVE_TRADES", 100i64),
            },
        }
    }

    /// Resolve a channel name from a chat id, falling back to the id itself.
    pub fn channel_name(&self, chat_id: &str) -> String {
        self.telegram
            .source_channels
            .iter()
            .find(|c| c.chat_id == chat_id)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| chat_id.to_string())
    }
}
