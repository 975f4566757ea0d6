//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sentinel_domain::{Account, MonitorKey, Price, Quantity, Side, Symbol};
use sentinel_exec::{ExchangeRouter, StubExchange};
use sentinel_store::MemoryStore;
use sentineld::{ActivityTracker, Config, MemoryAlertGateway, MonitorRegistry, OpenPositionRequest, Services};
use tokio_util::sync::CancellationToken;

pub fn btc() -> Symbol {
    Symbol::from_pair("BTCUSDT").unwrap()
}

pub fn key(account: Account) -> MonitorKey {
    MonitorKey::new(btc(), Side::Long, account)
}

pub fn price(v: Decimal) -> Price {
    Price::new(v).unwrap()
}

pub fn qty(v: Decimal) -> Quantity {
    Quantity::new(v).unwrap()
}

pub struct Harness {
    pub primary: Arc<StubExchange>,
    pub mirror: Option<Arc<StubExchange>>,
    pub store: Arc<MemoryStore>,
    pub alerts: Arc<MemoryAlertGateway>,
    pub registry: Arc<MonitorRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Config::test(), false)
    }

    pub fn with_mirror() -> Self {
        let mut config = Config::test();
        config.mirror_enabled = true;
        Self::build(config, true)
    }

    fn build(config: Config, mirror: bool) -> Self {
        let primary = Arc::new(StubExchange::new(dec!(100)));
        let mut router = ExchangeRouter::new(primary.clone());
        let mirror = mirror.then(|| Arc::new(StubExchange::new(dec!(100))));
        if let Some(m) = &mirror {
            router = router.with_mirror(m.clone());
        }
        let store = Arc::new(MemoryStore::new());
        let alerts = Arc::new(MemoryAlertGateway::new());
        let services = Arc::new(Services::new(
            config,
            router,
            store.clone(),
            alerts.clone(),
            Arc::new(ActivityTracker::new()),
        ));
        let registry = Arc::new(MonitorRegistry::new(services, CancellationToken::new()));
        Self { primary, mirror, store, alerts, registry }
    }

    pub fn exchange(&self, account: Account) -> &Arc<StubExchange> {
        match account {
            Account::Primary => &self.primary,
            Account::Mirror => self.mirror.as_ref().unwrap(),
        }
    }
}

/// Long @ 100 with TPs at 104/106/108/110 and the stop at 99.
pub fn long_request(account: Account, size: Decimal, legs: Vec<(Decimal, Decimal)>) -> OpenPositionRequest {
    OpenPositionRequest {
        key: key(account),
        entry_price: price(dec!(100)),
        filled_size: qty(size),
        entry_legs: legs.into_iter().map(|(p, q)| (price(p), qty(q))).collect(),
        stop_price: price(dec!(99)),
        tp_prices: vec![price(dec!(104)), price(dec!(106)), price(dec!(108)), price(dec!(110))],
        alert_target: None,
    }
}
