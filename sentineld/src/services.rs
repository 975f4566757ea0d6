//! Shared service context.
//!
//! One instance per daemon, built once from the config and passed by `Arc`
//! to the registry and every watcher.

use std::sync::Arc;

use sentinel_exec::ExchangeRouter;
use sentinel_store::MonitorRepository;

use crate::activity::ActivityReporter;
use crate::alerts::{AlertDispatcher, AlertGateway};
use crate::breakeven::BreakevenCascade;
use crate::cache::ExchangeStateCache;
use crate::config::Config;
use crate::event_bus::EventBus;
use crate::fill_detector::FillDetector;
use crate::guard::ConcurrencyGuard;
use crate::mirror::MirrorCoordinator;
use crate::persistence::PersistenceWriter;
use crate::phase::PhaseStateMachine;
use crate::rebalancer::OrderRebalancer;

/// Event bus capacity
const EVENT_BUS_CAPACITY: usize = 1024;

pub struct Services {
    pub config: Config,
    pub router: ExchangeRouter,
    pub cache: ExchangeStateCache,
    pub guard: Arc<ConcurrencyGuard>,
    pub fills: FillDetector,
    pub phases: Arc<PhaseStateMachine>,
    pub rebalancer: OrderRebalancer,
    pub cascade: Arc<BreakevenCascade>,
    pub mirror: MirrorCoordinator,
    pub persistence: Arc<PersistenceWriter>,
    pub alerts: AlertDispatcher,
    pub bus: Arc<EventBus>,
    pub activity: Arc<dyn ActivityReporter>,
}

impl Services {
    pub fn new(
        config: Config,
        router: ExchangeRouter,
        repo: Arc<dyn MonitorRepository>,
        alert_gateway: Arc<dyn AlertGateway>,
        activity: Arc<dyn ActivityReporter>,
    ) -> Self {
        let guard = Arc::new(ConcurrencyGuard::new());
        let bus = Arc::new(EventBus::new(EVENT_BUS_CAPACITY));
        let alerts = AlertDispatcher::new(alert_gateway);
        let persistence = Arc::new(PersistenceWriter::new(repo, config.persistence.flush_interval));

        let phases = Arc::new(PhaseStateMachine::new(
            router.clone(),
            Arc::clone(&guard),
            Arc::clone(&bus),
            config.retry,
        ));
        let rebalancer = OrderRebalancer::new(
            router.clone(),
            Arc::clone(&guard),
            Arc::clone(&bus),
            config.retry,
            config.instruments.clone(),
            config.ladder.clone(),
            config.protection.clone(),
        );
        let cascade = Arc::new(BreakevenCascade::new(
            router.clone(),
            Arc::clone(&guard),
            Arc::clone(&bus),
            alerts.clone(),
            Arc::clone(&persistence),
            config.retry,
            config.protection.clone(),
            config.instruments.clone(),
        ));
        let mirror = MirrorCoordinator::new(
            Arc::clone(&phases),
            Arc::clone(&cascade),
            Arc::clone(&persistence),
            Arc::clone(&bus),
        );

        Self {
            cache: ExchangeStateCache::new(router.clone(), config.cache.clone()),
            fills: FillDetector::new(config.fills.clone(), config.ladder.clone()),
            router,
            guard,
            phases,
            rebalancer,
            cascade,
            mirror,
            persistence,
            alerts,
            bus,
            activity,
            config,
        }
    }
}
