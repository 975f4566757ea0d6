//! Daemon configuration.
//!
//! Loads configuration from `SENTINEL_*` environment variables with
//! sensible defaults. Tuned constants (fill weights, fee fallback, offset
//! ladder) live here as defaults rather than in the code that uses them.

use crate::error::{DaemonError, DaemonResult};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sentinel_domain::{InstrumentRules, Symbol, TpLadder};
use sentinel_exec::RetryPolicy;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Environment (test, development, production)
    pub environment: Environment,
    /// Take-profit ladder applied to new positions
    pub ladder: TpLadder,
    /// Breakeven and stop protection
    pub protection: ProtectionConfig,
    /// Adaptive poll intervals
    pub polling: PollingConfig,
    /// Exchange snapshot cache
    pub cache: CacheConfig,
    /// Fill confirmation
    pub fills: FillConfig,
    /// Retry for exchange-mutating calls
    pub retry: RetryPolicy,
    /// Per-position circuit breaker
    pub breaker: BreakerConfig,
    /// Batched persistence
    pub persistence: PersistenceConfig,
    /// Lot/tick/notional rules per symbol
    pub instruments: InstrumentCatalog,
    /// Whether a mirror account is traded
    pub mirror_enabled: bool,
    /// Default alert destination
    pub alert_target: String,
}

/// Breakeven cascade and stop protection settings.
#[derive(Debug, Clone)]
pub struct ProtectionConfig {
    /// Fallback taker fee rate (0.0006 = 0.06%)
    pub fee_rate: Decimal,
    /// Added on top of fees so breakeven nets slightly positive
    pub safety_margin: Decimal,
    /// Offsets from breakeven tried in order by the progressive layer (fractions)
    pub progressive_offsets: Vec<Decimal>,
    /// Distance of the emergency stop from the market price (fraction)
    pub emergency_offset: Decimal,
    /// Relative tolerance when verifying a stop's trigger price
    pub verify_tolerance: Decimal,
    /// Open-order reads before a placement counts as unverified
    pub verification_reads: u32,
    /// Delay between verification reads and progressive attempts
    pub step_delay: Duration,
    /// Minimum wait before re-running the cascade after emergency/unprotected
    pub retry_cooldown: Duration,
    /// Safety stop distance for adopted positions without a stop (fraction)
    pub orphan_stop_distance: Decimal,
}

/// Poll interval per urgency tier.
#[derive(Debug, Clone)]
pub struct PollingConfig {
    pub imminent: Duration,
    pub tp_pending: Duration,
    pub standard: Duration,
    pub mostly_closed: Duration,
    pub idle: Duration,
    /// Mark price within this fraction of a TP or SL counts as imminent
    pub proximity: Decimal,
    /// Remaining/target ratio at or below which a position is mostly closed
    pub mostly_closed_ratio: Decimal,
}

/// Snapshot cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL under normal monitoring
    pub ttl_normal: Duration,
    /// TTL during an active execution window
    pub ttl_active: Duration,
    /// Minimum time between two refreshes of the same account
    pub min_refresh_interval: Duration,
    /// How long an execution window stays active
    pub active_window: Duration,
}

/// Fill confidence weights.
#[derive(Debug, Clone)]
pub struct FillConfig {
    /// Order history reports the order filled
    pub direct_weight: Decimal,
    /// Size reduction matches the order quantity
    pub size_weight: Decimal,
    /// Realized PnL moved since the last check
    pub pnl_weight: Decimal,
    /// Score at or above which a fill is confirmed
    pub threshold: Decimal,
    /// Size match tolerance, in lot steps
    pub size_tolerance_steps: Decimal,
    /// Slack (percentage points) when estimating the hit tier
    pub tier_tolerance_pct: Decimal,
}

/// Circuit breaker settings.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive loop failures before opening
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial tick
    pub cooldown: Duration,
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Batched flush period
    pub flush_interval: Duration,
}

/// Instrument rules with per-symbol overrides.
#[derive(Debug, Clone, Default)]
pub struct InstrumentCatalog {
    pub default: InstrumentRules,
    pub overrides: HashMap<String, InstrumentRules>,
}

impl InstrumentCatalog {
    /// Rules for `symbol`, falling back to the default
    pub fn rules_for(&self, symbol: &Symbol) -> InstrumentRules {
        self.overrides.get(&symbol.as_pair()).copied().unwrap_or(self.default)
    }

    /// Add a per-symbol override
    pub fn with_override(mut self, symbol: &str, rules: InstrumentRules) -> Self {
        self.overrides.insert(symbol.to_string(), rules);
        self
    }
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment (uses stubs)
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let environment = Self::load_environment()?;

        let ladder = Self::load_ladder_env("SENTINEL_TP_LADDER", &defaults.ladder)?;

        let protection = ProtectionConfig {
            fee_rate: Self::load_decimal_env("SENTINEL_FEE_RATE", defaults.protection.fee_rate)?,
            safety_margin: Self::load_decimal_env(
                "SENTINEL_SAFETY_MARGIN",
                defaults.protection.safety_margin,
            )?,
            progressive_offsets: match env::var("SENTINEL_PROGRESSIVE_OFFSETS") {
                Ok(val) => Self::parse_decimal_list("SENTINEL_PROGRESSIVE_OFFSETS", &val)?,
                Err(_) => defaults.protection.progressive_offsets.clone(),
            },
            emergency_offset: Self::load_decimal_env(
                "SENTINEL_EMERGENCY_OFFSET",
                defaults.protection.emergency_offset,
            )?,
            verify_tolerance: Self::load_decimal_env(
                "SENTINEL_VERIFY_TOLERANCE",
                defaults.protection.verify_tolerance,
            )?,
            verification_reads: Self::load_u64_env(
                "SENTINEL_VERIFICATION_READS",
                u64::from(defaults.protection.verification_reads),
            )? as u32,
            step_delay: Self::load_millis_env("SENTINEL_STEP_DELAY_MS", defaults.protection.step_delay)?,
            retry_cooldown: Self::load_secs_env(
                "SENTINEL_PROTECTION_RETRY_COOLDOWN_SECS",
                defaults.protection.retry_cooldown,
            )?,
            orphan_stop_distance: Self::load_decimal_env(
                "SENTINEL_ORPHAN_STOP_DISTANCE",
                defaults.protection.orphan_stop_distance,
            )?,
        };

        let polling = PollingConfig {
            imminent: Self::load_secs_env("SENTINEL_POLL_IMMINENT_SECS", defaults.polling.imminent)?,
            tp_pending: Self::load_secs_env("SENTINEL_POLL_TP_PENDING_SECS", defaults.polling.tp_pending)?,
            standard: Self::load_secs_env("SENTINEL_POLL_STANDARD_SECS", defaults.polling.standard)?,
            mostly_closed: Self::load_secs_env(
                "SENTINEL_POLL_MOSTLY_CLOSED_SECS",
                defaults.polling.mostly_closed,
            )?,
            idle: Self::load_secs_env("SENTINEL_POLL_IDLE_SECS", defaults.polling.idle)?,
            proximity: Self::load_decimal_env("SENTINEL_POLL_PROXIMITY", defaults.polling.proximity)?,
            mostly_closed_ratio: Self::load_decimal_env(
                "SENTINEL_MOSTLY_CLOSED_RATIO",
                defaults.polling.mostly_closed_ratio,
            )?,
        };

        let cache = CacheConfig {
            ttl_normal: Self::load_secs_env("SENTINEL_CACHE_TTL_SECS", defaults.cache.ttl_normal)?,
            ttl_active: Self::load_secs_env("SENTINEL_CACHE_ACTIVE_TTL_SECS", defaults.cache.ttl_active)?,
            min_refresh_interval: Self::load_millis_env(
                "SENTINEL_CACHE_MIN_REFRESH_MS",
                defaults.cache.min_refresh_interval,
            )?,
            active_window: Self::load_secs_env(
                "SENTINEL_CACHE_ACTIVE_WINDOW_SECS",
                defaults.cache.active_window,
            )?,
        };

        let fills = FillConfig {
            direct_weight: Self::load_decimal_env("SENTINEL_FILL_DIRECT_WEIGHT", defaults.fills.direct_weight)?,
            size_weight: Self::load_decimal_env("SENTINEL_FILL_SIZE_WEIGHT", defaults.fills.size_weight)?,
            pnl_weight: Self::load_decimal_env("SENTINEL_FILL_PNL_WEIGHT", defaults.fills.pnl_weight)?,
            threshold: Self::load_decimal_env("SENTINEL_FILL_THRESHOLD", defaults.fills.threshold)?,
            ..defaults.fills.clone()
        };

        let retry = RetryPolicy {
            max_attempts: Self::load_u64_env("SENTINEL_RETRY_ATTEMPTS", u64::from(defaults.retry.max_attempts))?
                as u32,
            backoff: Self::load_millis_env("SENTINEL_RETRY_BACKOFF_MS", defaults.retry.backoff)?,
        };

        let breaker = BreakerConfig {
            failure_threshold: Self::load_u64_env(
                "SENTINEL_BREAKER_FAILURES",
                u64::from(defaults.breaker.failure_threshold),
            )? as u32,
            cooldown: Self::load_secs_env("SENTINEL_BREAKER_COOLDOWN_SECS", defaults.breaker.cooldown)?,
        };

        let persistence = PersistenceConfig {
            flush_interval: Self::load_secs_env(
                "SENTINEL_FLUSH_INTERVAL_SECS",
                defaults.persistence.flush_interval,
            )?,
        };

        let instruments = InstrumentCatalog {
            default: InstrumentRules::new(
                Self::load_decimal_env("SENTINEL_QTY_STEP", defaults.instruments.default.qty_step)?,
                Self::load_decimal_env("SENTINEL_TICK_SIZE", defaults.instruments.default.tick_size)?,
                Self::load_decimal_env("SENTINEL_MIN_NOTIONAL", defaults.instruments.default.min_notional)?,
            )?,
            overrides: HashMap::new(),
        };

        let mirror_enabled = env::var("SENTINEL_MIRROR_ENABLED")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(defaults.mirror_enabled);
        let alert_target = env::var("SENTINEL_ALERT_TARGET").unwrap_or(defaults.alert_target);

        let config = Self {
            environment,
            ladder,
            protection,
            polling,
            cache,
            fills,
            retry,
            breaker,
            persistence,
            instruments,
            mirror_enabled,
            alert_target,
        };
        config.validate()?;
        Ok(config)
    }

    /// Create test configuration.
    ///
    /// Millisecond timings and a cache that refreshes on every read, so tests
    /// can drive ticks back to back.
    pub fn test() -> Self {
        Self {
            environment: Environment::Test,
            polling: PollingConfig {
                imminent: Duration::from_millis(20),
                tp_pending: Duration::from_millis(50),
                standard: Duration::from_millis(120),
                mostly_closed: Duration::from_millis(300),
                idle: Duration::from_millis(600),
                ..Self::default().polling
            },
            cache: CacheConfig {
                ttl_normal: Duration::ZERO,
                ttl_active: Duration::ZERO,
                min_refresh_interval: Duration::ZERO,
                active_window: Duration::from_millis(100),
            },
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(1),
            },
            protection: ProtectionConfig {
                step_delay: Duration::from_millis(1),
                retry_cooldown: Duration::from_millis(50),
                ..Self::default().protection
            },
            breaker: BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_millis(100),
            },
            persistence: PersistenceConfig {
                flush_interval: Duration::from_millis(50),
            },
            alert_target: "test".to_string(),
            ..Self::default()
        }
    }

    /// Reject combinations the engine cannot run with.
    pub fn validate(&self) -> DaemonResult<()> {
        if self.fills.threshold <= Decimal::ZERO
            || self.fills.direct_weight <= Decimal::ZERO
            || self.fills.size_weight <= Decimal::ZERO
            || self.fills.pnl_weight <= Decimal::ZERO
        {
            return Err(DaemonError::Config("fill weights and threshold must be positive".into()));
        }
        if self.cache.ttl_normal < self.cache.ttl_active {
            return Err(DaemonError::Config("active cache TTL must not exceed the normal TTL".into()));
        }
        if self.protection.progressive_offsets.is_empty() {
            return Err(DaemonError::Config("progressive offset ladder is empty".into()));
        }
        if self.protection.verification_reads == 0 {
            return Err(DaemonError::Config("at least one verification read is required".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(DaemonError::Config("retry attempts must be at least 1".into()));
        }
        Ok(())
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("SENTINEL_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid SENTINEL_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_ladder_env(key: &str, default: &TpLadder) -> DaemonResult<TpLadder> {
        match env::var(key) {
            Ok(val) => Self::parse_ladder(key, &val),
            Err(_) => Ok(default.clone()),
        }
    }

    fn parse_ladder(key: &str, val: &str) -> DaemonResult<TpLadder> {
        let rungs = Self::parse_decimal_list(key, val)?;
        Ok(TpLadder::new(rungs)?)
    }

    fn parse_decimal_list(key: &str, val: &str) -> DaemonResult<Vec<Decimal>> {
        val.split(',')
            .map(|part| {
                Decimal::from_str(part.trim())
                    .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val)))
            })
            .collect()
    }

    fn load_decimal_env(key: &str, default: Decimal) -> DaemonResult<Decimal> {
        match env::var(key) {
            Ok(val) => Decimal::from_str(&val)
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }

    fn load_u64_env(key: &str, default: u64) -> DaemonResult<u64> {
        match env::var(key) {
            Ok(val) => val
                .parse::<u64>()
                .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
            Err(_) => Ok(default),
        }
    }

    fn load_secs_env(key: &str, default: Duration) -> DaemonResult<Duration> {
        Ok(Duration::from_secs(Self::load_u64_env(key, default.as_secs())?))
    }

    fn load_millis_env(key: &str, default: Duration) -> DaemonResult<Duration> {
        Ok(Duration::from_millis(Self::load_u64_env(key, default.as_millis() as u64)?))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            ladder: TpLadder::default(),
            protection: ProtectionConfig {
                fee_rate: dec!(0.0006),
                safety_margin: dec!(0.0002),
                progressive_offsets: vec![dec!(0.0006), dec!(0.0008), dec!(0.0010), dec!(0.0012)],
                emergency_offset: dec!(0.005),
                verify_tolerance: dec!(0.0001),
                verification_reads: 3,
                step_delay: Duration::from_millis(500),
                retry_cooldown: Duration::from_secs(60),
                orphan_stop_distance: dec!(0.02),
            },
            polling: PollingConfig {
                imminent: Duration::from_secs(2),
                tp_pending: Duration::from_secs(5),
                standard: Duration::from_secs(12),
                mostly_closed: Duration::from_secs(30),
                idle: Duration::from_secs(60),
                proximity: dec!(0.005),
                mostly_closed_ratio: dec!(0.10),
            },
            cache: CacheConfig {
                ttl_normal: Duration::from_secs(15),
                ttl_active: Duration::from_secs(5),
                min_refresh_interval: Duration::from_secs(1),
                active_window: Duration::from_secs(30),
            },
            fills: FillConfig {
                direct_weight: dec!(1.0),
                size_weight: dec!(0.5),
                pnl_weight: dec!(0.5),
                threshold: dec!(1.0),
                size_tolerance_steps: dec!(1),
                tier_tolerance_pct: dec!(1),
            },
            retry: RetryPolicy::default(),
            breaker: BreakerConfig {
                failure_threshold: 5,
                cooldown: Duration::from_secs(60),
            },
            persistence: PersistenceConfig {
                flush_interval: Duration::from_secs(10),
            },
            instruments: InstrumentCatalog::default(),
            mirror_enabled: false,
            alert_target: "ops".to_string(),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.ladder.percentages(), &[dec!(85), dec!(5), dec!(5), dec!(5)]);
        assert_eq!(config.polling.standard, Duration::from_secs(12));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_test_config() {
        let config = Config::test();

        assert_eq!(config.environment, Environment::Test);
        assert_eq!(config.cache.min_refresh_interval, Duration::ZERO);
        assert_eq!(config.protection.fee_rate, dec!(0.0006));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protection_defaults() {
        let config = Config::default();

        assert_eq!(config.protection.safety_margin, dec!(0.0002));
        assert_eq!(config.protection.progressive_offsets.len(), 4);
        assert_eq!(config.protection.progressive_offsets[0], dec!(0.0006));
        assert_eq!(config.protection.emergency_offset, dec!(0.005));
        assert_eq!(config.fills.threshold, dec!(1.0));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.fills.threshold = Decimal::ZERO;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cache.ttl_active = Duration::from_secs(30);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.protection.progressive_offsets.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_ladder() {
        let ladder = Config::parse_ladder("K", "70, 10,10,10").unwrap();
        assert_eq!(ladder.len(), 4);
        assert!(Config::parse_ladder("K", "70,10").is_err());
        assert!(Config::parse_ladder("K", "abc").is_err());
    }

    #[test]
    fn test_instrument_overrides() {
        let rules = InstrumentRules::new(dec!(1), dec!(0.1), dec!(10)).unwrap();
        let catalog = InstrumentCatalog::default().with_override("ETHUSDT", rules);

        let eth = Symbol::from_pair("ETHUSDT").unwrap();
        let btc = Symbol::from_pair("BTCUSDT").unwrap();
        assert_eq!(catalog.rules_for(&eth).qty_step, dec!(1));
        assert_eq!(catalog.rules_for(&btc), InstrumentRules::default());
    }

    #[test]
    fn test_environment_display() {
        assert_eq!(Environment::Test.to_string(), "test");
        assert_eq!(Environment::Development.to_string(), "development");
        assert_eq!(Environment::Production.to_string(), "production");
    }
}
