//! Integration tests for the Event Bus: invariant 8 plus the ordering and
//! combinator contracts from `SPEC_FULL.md` §5/§8.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use devforge_core::events::EventBus;
use devforge_core::model::EventType;
use tokio::sync::Mutex;

#[tokio::test]
async fn handlers_run_sequentially_in_registration_order() {
    let bus = EventBus::new(1000);
    let order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..3 {
        let order = order.clone();
        bus.on(EventType::TaskStart, move |_event| {
            let order = order.clone();
            async move {
                order.lock().await.push(i);
            }
        })
        .await;
    }
    bus.emit(EventType::TaskStart, HashMap::new()).await;
    assert_eq!(*order.lock().await, vec![0, 1, 2]);
}

#[tokio::test]
async fn history_is_bounded_by_max_history_size() {
    // Invariant 8.
    let bus = EventBus::new(3);
    for _ in 0..10 {
        bus.emit(EventType::TaskProgress, HashMap::new()).await;
    }
    assert!(bus.history_len().await <= 3);
}

#[tokio::test]
async fn wait_for_resolves_on_next_matching_event() {
    let bus = EventBus::new(10);
    let bus2 = bus.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        bus2.emit(EventType::EngineComplete, HashMap::new()).await;
    });
    let event = bus.wait_for(EventType::EngineComplete, Some(Duration::from_secs(1))).await.unwrap();
    assert_eq!(event.event_type, EventType::EngineComplete);
}

#[tokio::test]
async fn wait_for_times_out_and_detaches() {
    let bus = EventBus::new(10);
    let result = bus.wait_for(EventType::EngineComplete, Some(Duration::from_millis(10))).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn filter_creates_child_bus_receiving_only_matching_events() {
    let bus = EventBus::new(10);
    let child = bus.filter(|e| e.event_type == EventType::TaskFailed).await;
    bus.emit(EventType::TaskStart, HashMap::new()).await;
    bus.emit(EventType::TaskFailed, HashMap::new()).await;
    let history = child.get_history(None).await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].event_type, EventType::TaskFailed);
}

#[tokio::test]
async fn once_handler_fires_a_single_time() {
    let bus = EventBus::new(10);
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    bus.once(EventType::TaskRetry, move |_| {
        let count_clone = count_clone.clone();
        async move {
            count_clone.fetch_add(1, Ordering::SeqCst);
        }
    })
    .await;
    bus.emit(EventType::TaskRetry, HashMap::new()).await;
    bus.emit(EventType::TaskRetry, HashMap::new()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn off_deregisters_a_handler() {
    let bus = EventBus::new(10);
    let count = Arc::new(AtomicUsize::new(0));
    let count_clone = count.clone();
    let id = bus
        .on(EventType::TaskStart, move |_| {
            let count_clone = count_clone.clone();
            async move {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
    bus.emit(EventType::TaskStart, HashMap::new()).await;
    bus.off(id).await;
    bus.emit(EventType::TaskStart, HashMap::new()).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
