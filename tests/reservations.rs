use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use ulid::Ulid;

use staybook::compactor;
use staybook::engine::{Engine, EngineError};
use staybook::model::*;
use staybook::notify::NotifyHub;

// ── Test infrastructure ──────────────────────────────────────

fn test_data_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("staybook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn start_engine(dir: &Path) -> Arc<Engine> {
    Arc::new(Engine::new(dir.join("staybook.wal"), Arc::new(NotifyHub::new())).unwrap())
}

fn day(n: i64) -> Ms {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms;
    now / DAY_MS * DAY_MS + n * DAY_MS
}

fn lake_house() -> NewProperty {
    NewProperty {
        title: "Lake house".into(),
        description: Some("Private jetty".into()),
        location: "Lake Bled, Slovenia".into(),
        price_per_night: 14_000,
        cleaning_fee: 4_000,
        max_guests: 6,
    }
}

async fn recv_event(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Event {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("channel closed")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn guest_journey() {
    let dir = test_data_dir();
    let engine = start_engine(&dir);
    let host = Caller::new(Ulid::new());
    let guest = Caller::new(Ulid::new());

    let p = engine.list_property(&host, lake_house()).await.unwrap();
    engine.add_window(&host, p.id, day(1), day(90), true).await.unwrap();

    // Browse
    let found = engine
        .search(&SearchQuery {
            location: Some("bled".into()),
            guests: Some(4),
            stay: Some(Span::new(day(14), day(17))),
            ..Default::default()
        })
        .await;
    assert_eq!(found, vec![p.clone()]);

    // Preview, then book
    let quote = engine.quote_stay(p.id, day(14), day(17)).await.unwrap();
    assert_eq!(quote.nights, 3);
    assert_eq!(quote.total_price, 3 * 14_000 + 4_000);
    let r = engine
        .create_reservation(&guest, p.id, day(14), day(17), 4)
        .await
        .unwrap();
    assert_eq!(r.total_price, quote.total_price);

    // The same dates are gone for everyone else
    let late = Caller::new(Ulid::new());
    assert!(matches!(
        engine.create_reservation(&late, p.id, day(15), day(16), 1).await,
        Err(EngineError::Unavailable { conflict: Some(id) }) if id == r.id
    ));
    assert!(!engine.is_available(p.id, day(14), day(17)).await);

    // Host sees it, guest cancels, the nights open up again
    assert_eq!(
        engine.reservations_for_property(&host, p.id).await.unwrap(),
        vec![r.clone()]
    );
    engine.cancel_reservation(&guest, r.id).await.unwrap();
    assert!(engine.is_available(p.id, day(14), day(17)).await);
    assert!(engine.reservations_for_guest(&guest).await.is_empty());
}

#[tokio::test]
async fn host_calendar_follows_bookings() {
    let dir = test_data_dir();
    let engine = start_engine(&dir);
    let host = Caller::new(Ulid::new());
    let guest = Caller::new(Ulid::new());

    let p = engine.list_property(&host, lake_house()).await.unwrap();
    let mut rx = engine.notify.subscribe(p.id);

    let w = engine.add_window(&host, p.id, day(1), day(30), true).await.unwrap();
    assert!(matches!(recv_event(&mut rx).await, Event::WindowAdded { id, .. } if id == w.id));

    let r = engine
        .create_reservation(&guest, p.id, day(5), day(8), 2)
        .await
        .unwrap();
    assert_eq!(
        recv_event(&mut rx).await,
        Event::ReservationCreated { reservation: r.clone() }
    );

    // A refused booking publishes nothing
    let other = Caller::new(Ulid::new());
    assert!(engine.create_reservation(&other, p.id, day(6), day(7), 1).await.is_err());
    assert!(rx.try_recv().is_err());

    engine.cancel_reservation(&guest, r.id).await.unwrap();
    assert_eq!(
        recv_event(&mut rx).await,
        Event::ReservationCancelled {
            id: r.id,
            property_id: p.id
        }
    );

    engine.delist_property(&host, p.id).await.unwrap();
    assert_eq!(recv_event(&mut rx).await, Event::PropertyDelisted { id: p.id });
    assert!(matches!(rx.recv().await, Err(RecvError::Closed)));
}

#[tokio::test]
async fn restart_after_compaction() {
    let dir = test_data_dir();
    let host = Caller::new(Ulid::new());
    let guest = Caller::new(Ulid::new());

    let (p, r) = {
        let engine = start_engine(&dir);
        let p = engine.list_property(&host, lake_house()).await.unwrap();
        engine.add_window(&host, p.id, day(1), day(60), true).await.unwrap();
        for i in 0..10 {
            let tmp = engine
                .create_reservation(&guest, p.id, day(20 + i), day(21 + i), 1)
                .await
                .unwrap();
            engine.cancel_reservation(&guest, tmp.id).await.unwrap();
        }
        let r = engine
            .create_reservation(&guest, p.id, day(10), day(12), 2)
            .await
            .unwrap();
        assert!(compactor::compact_if_needed(&engine, 5).await);

        // Appends after compaction land in the new file
        let p = engine
            .update_property(
                &host,
                p.id,
                PropertyPatch {
                    title: Patch::Set("Lake house with sauna".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        (p, r)
    };

    let engine = start_engine(&dir);
    assert_eq!(engine.get_property(p.id).await, Some(p.clone()));
    assert_eq!(engine.reservations_for_guest(&guest).await, vec![r.clone()]);
    assert!(!engine.is_available(p.id, day(10), day(12)).await);
    assert!(engine.is_available(p.id, day(20), day(30)).await);

    // Replayed state keeps enforcing the rules
    assert!(matches!(
        engine.create_reservation(&guest, p.id, day(11), day(13), 1).await,
        Err(EngineError::Unavailable { .. })
    ));
    engine.cancel_reservation(&guest, r.id).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_guests_one_weekend() {
    let dir = test_data_dir();
    let engine = start_engine(&dir);
    let host = Caller::new(Ulid::new());
    let p = engine.list_property(&host, lake_house()).await.unwrap();
    engine.add_window(&host, p.id, day(1), day(60), true).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let engine = engine.clone();
        let pid = p.id;
        handles.push(tokio::spawn(async move {
            let guest = Caller::new(Ulid::new());
            engine.create_reservation(&guest, pid, day(20), day(22), 2).await
        }));
    }

    let mut booked = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => booked += 1,
            Err(EngineError::Unavailable { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(booked, 1);

    // Durable too: a restart sees exactly one reservation
    drop(engine);
    let engine = start_engine(&dir);
    assert_eq!(
        engine.reservations_for_property(&host, p.id).await.unwrap().len(),
        1
    );
}
