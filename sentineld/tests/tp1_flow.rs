//! TP1 flow: fill detection through breakeven, on one account and mirrored.
//!
//! Flow:
//! 1. Open a long with resting entry legs; the stop covers the full exposure
//! 2. Fill TP1 on the exchange
//! 3. One watcher tick: fill confirmed, PROFIT_TAKING, legs cancelled,
//!    stop moved to breakeven and resized to the remaining size
//!
//! Watchers spawned by `open_position` are stopped through the registry
//! shutdown so each test drives ticks itself.

mod common;

use std::time::Duration;

use common::{btc, key, long_request, Harness};
use rust_decimal_macros::dec;
use sentinel_domain::{Account, BreakevenMethod, Phase, ProtectionStatus, Side, TpStatus};
use sentinel_exec::Injected;
use sentineld::{AlertTemplate, PositionWatcher, TickOutcome};

// =============================================================================
// Single account
// =============================================================================

#[tokio::test]
async fn test_tp1_moves_stop_to_breakeven_and_cancels_legs() {
    let h = Harness::new();
    h.primary.set_position(&btc(), Side::Long, dec!(100), dec!(100));
    let entry = h
        .registry
        .open_position(long_request(Account::Primary, dec!(100), vec![(dec!(97), dec!(50))]))
        .await
        .unwrap();
    h.registry.shutdown().await;

    // Building: stop covers filled size plus the resting leg
    assert_eq!(h.primary.live_stops(&btc())[0].quantity.as_decimal(), dec!(150));

    let tp1 = entry.snapshot().tp_orders[0].order_id.clone().unwrap();
    assert!(h.primary.fill_order(&tp1));

    let mut watcher = PositionWatcher::new(h.registry.clone(), entry.clone());
    let outcome = watcher.tick().await.unwrap();

    assert!(matches!(outcome, TickOutcome::Continue(_)));
    let record = entry.snapshot();
    assert_eq!(record.phase, Phase::ProfitTaking);
    assert_eq!(record.tp_orders[0].status, TpStatus::Filled);
    assert_eq!(record.remaining_size.as_decimal(), dec!(15));
    assert_eq!(record.open_entry_legs().count(), 0);
    assert!(record.sl_moved_to_breakeven);
    assert_eq!(record.protection.status, ProtectionStatus::Protected);

    assert!(h.primary.open_orders().iter().all(|o| o.reduce_only));
    let stops = h.primary.live_stops(&btc());
    assert_eq!(stops.len(), 1);
    assert_eq!(stops[0].trigger_price.unwrap().as_decimal(), dec!(100.08));
    assert_eq!(stops[0].quantity.as_decimal(), dec!(15));
    assert!(h.primary.stop_observations(&btc()).iter().all(|n| *n >= 1));

    assert!(h.alerts.wait_for(AlertTemplate::TakeProfitFilled, Duration::from_secs(1)).await);
    assert!(h.alerts.wait_for(AlertTemplate::BreakevenApplied, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn test_rejected_amend_falls_back_without_losing_the_stop() {
    let h = Harness::new();
    h.primary.set_position(&btc(), Side::Long, dec!(100), dec!(100));
    let entry = h
        .registry
        .open_position(long_request(Account::Primary, dec!(100), vec![]))
        .await
        .unwrap();
    h.registry.shutdown().await;

    let tp1 = entry.snapshot().tp_orders[0].order_id.clone().unwrap();
    h.primary.fill_order(&tp1);
    h.primary.script_amends([Injected::Reject]);

    let mut watcher = PositionWatcher::new(h.registry.clone(), entry.clone());
    watcher.tick().await.unwrap();

    let record = entry.snapshot();
    assert!(record.sl_moved_to_breakeven);
    let methods: Vec<_> = record.breakeven_log.iter().map(|a| (a.method, a.success)).collect();
    assert_eq!(
        methods,
        vec![(BreakevenMethod::Amend, false), (BreakevenMethod::CancelReplace, true)]
    );
    assert_eq!(h.primary.live_stops(&btc()).len(), 1);
    assert!(h.primary.stop_observations(&btc()).iter().all(|n| *n >= 1));
}

#[tokio::test]
async fn test_later_ticks_leave_breakeven_stop_alone() {
    let h = Harness::new();
    h.primary.set_position(&btc(), Side::Long, dec!(100), dec!(100));
    let entry = h
        .registry
        .open_position(long_request(Account::Primary, dec!(100), vec![]))
        .await
        .unwrap();
    h.registry.shutdown().await;
    let tp1 = entry.snapshot().tp_orders[0].order_id.clone().unwrap();
    h.primary.fill_order(&tp1);

    let mut watcher = PositionWatcher::new(h.registry.clone(), entry.clone());
    watcher.tick().await.unwrap();
    let calls = h.primary.calls();

    watcher.tick().await.unwrap();

    assert_eq!(h.primary.calls().amends, calls.amends);
    assert_eq!(h.primary.calls().places, calls.places);
    assert_eq!(entry.snapshot().breakeven_successes(), 1);
}

// =============================================================================
// Mirror account
// =============================================================================

#[tokio::test]
async fn test_mirror_follows_primary_at_its_own_size() {
    let h = Harness::with_mirror();
    let mirror = h.exchange(Account::Mirror).clone();
    h.primary.set_position(&btc(), Side::Long, dec!(100), dec!(100));
    mirror.set_position(&btc(), Side::Long, dec!(250), dec!(100));

    let primary_entry = h
        .registry
        .open_position(long_request(Account::Primary, dec!(100), vec![]))
        .await
        .unwrap();
    let mirror_entry = h
        .registry
        .open_position(long_request(Account::Mirror, dec!(250), vec![]))
        .await
        .unwrap();
    h.registry.shutdown().await;

    let tp1 = primary_entry.snapshot().tp_orders[0].order_id.clone().unwrap();
    h.primary.fill_order(&tp1);

    let mut watcher = PositionWatcher::new(h.registry.clone(), primary_entry.clone());
    watcher.tick().await.unwrap();

    let mirror_record = mirror_entry.snapshot();
    assert_eq!(mirror_record.phase, Phase::ProfitTaking);
    assert!(mirror_record.sl_moved_to_breakeven);

    let primary_stops = h.primary.live_stops(&btc());
    assert_eq!(primary_stops.len(), 1);
    assert_eq!(primary_stops[0].quantity.as_decimal(), dec!(15));

    let mirror_stops = mirror.live_stops(&btc());
    assert_eq!(mirror_stops.len(), 1);
    assert_eq!(mirror_stops[0].quantity.as_decimal(), dec!(250));
    assert_eq!(mirror_stops[0].trigger_price.unwrap().as_decimal(), dec!(100.08));
}

#[tokio::test]
async fn test_mirror_without_monitor_is_skipped() {
    let h = Harness::with_mirror();
    h.primary.set_position(&btc(), Side::Long, dec!(100), dec!(100));
    let entry = h
        .registry
        .open_position(long_request(Account::Primary, dec!(100), vec![]))
        .await
        .unwrap();
    h.registry.shutdown().await;
    let tp1 = entry.snapshot().tp_orders[0].order_id.clone().unwrap();
    h.primary.fill_order(&tp1);

    let mut watcher = PositionWatcher::new(h.registry.clone(), entry.clone());
    watcher.tick().await.unwrap();

    assert!(entry.snapshot().sl_moved_to_breakeven);
    assert!(!h.registry.contains(&key(Account::Mirror)).await);
    assert_eq!(h.exchange(Account::Mirror).calls().places, 0);
}
