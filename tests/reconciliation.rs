// ===============================
// tests/reconciliation.rs
// ===============================
//
// Heartbeat convergence, divergence handling and fill follow-ups.
//
mod common;

use std::time::Duration;

use rust_decimal_macros::dec;

use common::{exec, harness, harness_with, update, SYMBOL};
use perp_sync::domain::{now_ms, OrderRole, OrderStatus, Side, TakeProfitTarget};
use perp_sync::error::StateError;
use perp_sync::reconcile::{Escalation, ReconcileCfg};
use perp_sync::wire::StreamEvent;

#[tokio::test]
async fn disordered_pushes_converge_after_heartbeat() {
    let h = harness();
    let entry = h.orders.open(SYMBOL, Side::Buy, dec!(1), None, vec![]).await.unwrap();
    let link = entry.link_id;

    // final state first, then a late partial and a duplicate
    let filled = update("o1", &link, Side::Buy, OrderStatus::Filled, dec!(1), dec!(1), dec!(100), 3);
    let partial = update("o1", &link, Side::Buy, OrderStatus::PartiallyFilled, dec!(1), dec!(0.4), dec!(100), 2);
    h.reconciler.on_event(StreamEvent::Order(vec![filled.clone()])).await;
    h.reconciler.on_event(StreamEvent::Order(vec![partial, filled])).await;
    h.reconciler
        .on_event(StreamEvent::Execution(vec![exec("e1", "o1", &link, Side::Buy, dec!(0.4), dec!(100), dec!(1), dec!(0.6), 2)]))
        .await;

    tokio::time::sleep(Duration::from_millis(2)).await;
    h.venue.set_position(Some(Side::Buy), dec!(1), dec!(100));
    h.reconciler.heartbeat(SYMBOL).await.unwrap();

    let st = h.state.read();
    assert_eq!(st.position(SYMBOL).unwrap().net_qty(), dec!(1));
    assert_eq!(st.order(&link).unwrap().status, OrderStatus::Filled);
    assert!(!st.is_divergent(SYMBOL));
}

#[tokio::test]
async fn venue_flat_closes_local_and_venue_position_is_synthesized() {
    let h = harness();
    let entry = h.orders.open(SYMBOL, Side::Buy, dec!(1), None, vec![]).await.unwrap();
    h.reconciler
        .on_event(StreamEvent::Execution(vec![exec("e1", "o1", &entry.link_id, Side::Buy, dec!(1), dec!(100), dec!(1), dec!(0), 1)]))
        .await;
    tokio::time::sleep(Duration::from_millis(2)).await;

    h.venue.set_position(None, dec!(0), dec!(0));
    h.reconciler.heartbeat(SYMBOL).await.unwrap();
    assert!(h.state.read().position(SYMBOL).is_none());

    tokio::time::sleep(Duration::from_millis(2)).await;
    h.venue.set_position(Some(Side::Sell), dec!(0.3), dec!(101.5));
    h.reconciler.heartbeat(SYMBOL).await.unwrap();
    let p = h.state.read().position(SYMBOL).cloned().unwrap();
    assert_eq!(p.side, Side::Sell);
    assert_eq!(p.qty, dec!(0.3));
    assert_eq!(p.avg_entry_price, dec!(101.5));
}

#[tokio::test]
async fn divergence_blocks_new_exposure_and_escalates() {
    let mut h = harness_with(ReconcileCfg { symbols: vec![SYMBOL.into()], escalate_after: 3, ..ReconcileCfg::default() });
    let entry = h.orders.open(SYMBOL, Side::Buy, dec!(1), None, vec![]).await.unwrap();
    h.reconciler
        .on_event(StreamEvent::Execution(vec![exec("e1", "o1", &entry.link_id, Side::Buy, dec!(1), dec!(100), dec!(1), dec!(0), 1)]))
        .await;
    tokio::time::sleep(Duration::from_millis(2)).await;

    h.venue.set_position(Some(Side::Buy), dec!(0.5), dec!(100));
    h.reconciler.heartbeat(SYMBOL).await.unwrap();
    {
        let st = h.state.read();
        assert!(st.is_divergent(SYMBOL));
        // never overwritten by the poll
        assert_eq!(st.position(SYMBOL).unwrap().qty, dec!(1));
    }
    assert!(matches!(h.orders.pyramid_add(SYMBOL, dec!(0.1)).await, Err(StateError::Divergent(_))));
    assert!(h.escalations.try_recv().is_err());

    h.reconciler.heartbeat(SYMBOL).await.unwrap();
    h.reconciler.heartbeat(SYMBOL).await.unwrap();
    match h.escalations.try_recv() {
        Ok(Escalation::Irreconcilable { symbol, cycles, local_qty, venue_qty }) => {
            assert_eq!(symbol, SYMBOL);
            assert_eq!(cycles, 3);
            assert_eq!(local_qty, dec!(1));
            assert_eq!(venue_qty, dec!(0.5));
        }
        other => panic!("expected escalation, got {other:?}"),
    }

    // exits stay allowed
    let exit = h.orders.close(SYMBOL).await.unwrap();
    assert_eq!(exit.role, OrderRole::Exit);

    h.venue.set_position(Some(Side::Buy), dec!(1), dec!(100));
    h.reconciler.heartbeat(SYMBOL).await.unwrap();
    assert!(!h.state.read().is_divergent(SYMBOL));
}

#[tokio::test]
async fn tolerance_absorbs_small_differences() {
    let h = harness_with(ReconcileCfg { symbols: vec![SYMBOL.into()], divergence_tolerance: dec!(0.01), ..ReconcileCfg::default() });
    let entry = h.orders.open(SYMBOL, Side::Buy, dec!(1), None, vec![]).await.unwrap();
    h.reconciler
        .on_event(StreamEvent::Execution(vec![exec("e1", "o1", &entry.link_id, Side::Buy, dec!(1), dec!(100), dec!(1), dec!(0), 1)]))
        .await;
    tokio::time::sleep(Duration::from_millis(2)).await;
    h.venue.set_position(Some(Side::Buy), dec!(0.995), dec!(100));
    h.reconciler.heartbeat(SYMBOL).await.unwrap();
    assert!(!h.state.read().is_divergent(SYMBOL));
}

#[tokio::test]
async fn entry_fill_protects_position_and_first_target_promotes_breakeven_once() {
    let h = harness();
    let targets = vec![TakeProfitTarget::new(dec!(110), dec!(0.5)), TakeProfitTarget::new(dec!(120), dec!(0.5))];
    let entry = h.orders.open(SYMBOL, Side::Buy, dec!(1), Some(dec!(95)), targets).await.unwrap();
    h.reconciler
        .on_event(StreamEvent::Execution(vec![exec("e1", "o1", &entry.link_id, Side::Buy, dec!(1), dec!(100), dec!(1), dec!(0), 1)]))
        .await;

    let legs = {
        let b = h.venue.book();
        assert_eq!(b.stops, vec![(SYMBOL.to_string(), dec!(95))]);
        assert_eq!(b.batches.len(), 1);
        b.batches[0].clone()
    };
    assert_eq!(legs.len(), 2);
    assert!(legs.iter().all(|l| l.reduce_only && l.side == Side::Sell && l.qty == dec!(0.5)));
    assert!(legs[0].link_id.ends_with("_tp1"));

    let tp1 = update("b1-0", &legs[0].link_id, Side::Sell, OrderStatus::Filled, dec!(0.5), dec!(0.5), dec!(110), 2);
    h.reconciler.on_event(StreamEvent::Order(vec![tp1.clone()])).await;
    {
        let st = h.state.read();
        let p = st.position(SYMBOL).unwrap();
        assert_eq!(p.qty, dec!(0.5));
        assert_eq!(p.realized_pnl, dec!(5));
        assert!(p.breakeven_applied);
        assert_eq!(p.stop_loss, Some(dec!(100.1)));
        assert!(p.targets[0].filled);
    }
    assert_eq!(h.venue.book().stops.last(), Some(&(SYMBOL.to_string(), dec!(100.1))));

    // replay does not promote again
    h.reconciler.on_event(StreamEvent::Order(vec![tp1])).await;
    h.reconciler.breakeven(SYMBOL).await;
    assert_eq!(h.venue.book().stops.len(), 2);

    let tp2 = update("b1-1", &legs[1].link_id, Side::Sell, OrderStatus::Filled, dec!(0.5), dec!(0.5), dec!(120), 3);
    h.reconciler.on_event(StreamEvent::Order(vec![tp2])).await;
    assert!(h.state.read().position(SYMBOL).is_none());
}

#[tokio::test]
async fn orders_missing_from_two_polls_are_cancelled() {
    let h = harness();
    let order = h.orders.open(SYMBOL, Side::Buy, dec!(1), None, vec![]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;

    h.reconciler.poll_executions(SYMBOL).await.unwrap();
    assert_eq!(h.state.read().order(&order.link_id).unwrap().status, OrderStatus::Submitted);
    h.reconciler.poll_executions(SYMBOL).await.unwrap();
    assert_eq!(h.state.read().order(&order.link_id).unwrap().status, OrderStatus::Cancelled);
    assert!(h.state.read().open_orders().is_empty());
}

#[tokio::test]
async fn external_orders_are_adopted() {
    let h = harness();
    let t = now_ms();
    let manual = update("v-77", "", Side::Sell, OrderStatus::New, dec!(2), dec!(0), dec!(0), t);
    h.reconciler.on_event(StreamEvent::Order(vec![manual])).await;
    let open = h.state.read().open_orders();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].link_id, "venue:v-77");
    assert_eq!(open[0].role, OrderRole::External);
}

#[tokio::test]
async fn ladder_grows_with_partial_entry_fills_and_adds() {
    let h = harness();
    let targets = vec![TakeProfitTarget::new(dec!(110), dec!(0.5)), TakeProfitTarget::new(dec!(120), dec!(0.5))];
    let entry = h.orders.open(SYMBOL, Side::Buy, dec!(1), Some(dec!(95)), targets).await.unwrap();
    let link = entry.link_id;

    h.reconciler
        .on_event(StreamEvent::Order(vec![update("o1", &link, Side::Buy, OrderStatus::PartiallyFilled, dec!(1), dec!(0.4), dec!(100), 1)]))
        .await;
    h.reconciler.on_event(StreamEvent::Order(vec![update("o1", &link, Side::Buy, OrderStatus::Filled, dec!(1), dec!(1), dec!(100), 2)])).await;

    {
        let b = h.venue.book();
        assert_eq!(b.stops.len(), 1);
        assert_eq!(b.batches.len(), 2);
        let qty = |n: &str| -> rust_decimal::Decimal {
            b.batches.iter().flatten().filter(|l| l.link_id.ends_with(n)).map(|l| l.qty).sum()
        };
        assert_eq!(qty("_tp1"), dec!(0.5));
        assert_eq!(qty("_tp2"), dec!(0.5));
        assert!(b.batches[1].iter().all(|l| l.reduce_only && l.link_id.contains("-2_tp")));
    }
    {
        let st = h.state.read();
        let p = st.position(SYMBOL).unwrap();
        assert_eq!(p.qty, dec!(1));
        assert_eq!(p.ladder_basis, dec!(1));
        assert!(p.targets.iter().all(|t| t.placed_qty == dec!(0.5) && t.legs.len() == 2));
    }

    let add = h.orders.pyramid_add(SYMBOL, dec!(0.2)).await.unwrap();
    h.reconciler
        .on_event(StreamEvent::Execution(vec![exec("e9", "o2", &add.link_id, Side::Buy, dec!(0.2), dec!(101), dec!(0.2), dec!(0), 3)]))
        .await;
    let b = h.venue.book();
    assert_eq!(b.batches.len(), 3);
    assert!(b.batches[2].iter().all(|l| l.qty == dec!(0.1) && l.link_id.contains("-3_tp")));
}

#[tokio::test]
async fn tighter_trailing_stop_leaves_breakeven_unclaimed() {
    let h = harness();
    let targets = vec![TakeProfitTarget::new(dec!(110), dec!(0.5)), TakeProfitTarget::new(dec!(120), dec!(0.5))];
    let entry = h.orders.open(SYMBOL, Side::Buy, dec!(1), Some(dec!(95)), targets).await.unwrap();
    h.reconciler
        .on_event(StreamEvent::Execution(vec![exec("e1", "o1", &entry.link_id, Side::Buy, dec!(1), dec!(100), dec!(1), dec!(0), 1)]))
        .await;
    assert_eq!(h.orders.trail_stop(SYMBOL, dec!(101)).await.unwrap(), dec!(101));

    let tp1 = h.venue.book().batches[0][0].link_id.clone();
    h.reconciler.on_event(StreamEvent::Order(vec![update("b1-0", &tp1, Side::Sell, OrderStatus::Filled, dec!(0.5), dec!(0.5), dec!(110), 2)])).await;

    let st = h.state.read();
    let p = st.position(SYMBOL).unwrap();
    assert_eq!(p.qty, dec!(0.5));
    assert!(!p.breakeven_applied);
    assert_eq!(p.stop_loss, Some(dec!(101)));
    assert_eq!(h.venue.book().stops.len(), 2);
}
