mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{
    booked_ranges, covering_open_window, find_conflict, free_ranges, is_bookable,
    merge_overlapping, subtract_intervals,
};
pub use conflict::cancellation_deadline;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

pub type SharedPropertyState = Arc<RwLock<PropertyState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
/// A non-append command ends the batch; it runs after the batch is flushed.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("wal flush of {} events failed: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // Every sender hears Err, so none of the batch may survive on disk.
    if result.is_err()
        && let Err(e) = wal.rollback()
    {
        tracing::error!("wal rollback failed, refusing appends until compaction: {e}");
    }
    result
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Secondary indexes ────────────────────────────────────

/// Lookups that cut across properties. Kept in step with `apply_to_property`.
#[derive(Default)]
pub(super) struct Indexes {
    /// Window or reservation id → property id.
    entity_to_property: DashMap<Ulid, PropertyId>,
    /// Owner → properties they list.
    by_owner: DashMap<UserId, Vec<PropertyId>>,
    /// Guest → their reservations.
    by_guest: DashMap<UserId, Vec<ReservationId>>,
}

impl Indexes {
    fn add_property(&self, property: &Property) {
        self.by_owner.entry(property.owner_id).or_default().push(property.id);
    }

    /// Drop every index entry pointing into a property that is going away.
    fn forget_property(&self, ps: &PropertyState) {
        if let Some(mut owned) = self.by_owner.get_mut(&ps.property.owner_id) {
            owned.retain(|id| *id != ps.id());
        }
        for w in &ps.windows {
            self.entity_to_property.remove(&w.id);
        }
        for r in &ps.reservations {
            self.entity_to_property.remove(&r.id);
            self.forget_reservation(r.guest_id, r.id);
        }
    }

    fn forget_reservation(&self, guest_id: UserId, id: ReservationId) {
        if let Some(mut ids) = self.by_guest.get_mut(&guest_id) {
            ids.retain(|r| *r != id);
        }
    }
}

/// Apply an event directly to a PropertyState (caller holds the lock).
fn apply_to_property(ps: &mut PropertyState, event: &Event, idx: &Indexes) {
    match event {
        Event::PropertyUpdated { property } => {
            ps.property = property.clone();
        }
        Event::WindowAdded {
            id,
            property_id,
            span,
            available,
        } => {
            ps.insert_window(AvailabilityWindow {
                id: *id,
                property_id: *property_id,
                start: span.start,
                end: span.end,
                available: *available,
            });
            idx.entity_to_property.insert(*id, *property_id);
        }
        Event::WindowUpdated {
            id,
            property_id,
            span,
            available,
        } => {
            ps.remove_window(*id);
            ps.insert_window(AvailabilityWindow {
                id: *id,
                property_id: *property_id,
                start: span.start,
                end: span.end,
                available: *available,
            });
        }
        Event::WindowRemoved { id, .. } => {
            ps.remove_window(*id);
            idx.entity_to_property.remove(id);
        }
        Event::ReservationCreated { reservation } => {
            idx.entity_to_property
                .insert(reservation.id, reservation.property_id);
            idx.by_guest
                .entry(reservation.guest_id)
                .or_default()
                .push(reservation.id);
            ps.insert_reservation(reservation.clone());
        }
        Event::ReservationCancelled { id, .. } => {
            if let Some(r) = ps.remove_reservation(*id) {
                idx.forget_reservation(r.guest_id, r.id);
            }
            idx.entity_to_property.remove(id);
        }
        // Listing and delisting are handled at the DashMap level, not here
        Event::PropertyListed { .. } | Event::PropertyDelisted { .. } => {}
    }
}

pub struct Engine {
    pub state: DashMap<PropertyId, SharedPropertyState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) idx: Indexes,
    /// Held shared while a property is listed or delisted, exclusively while
    /// compaction snapshots the map.
    pub(super) catalog: RwLock<()>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside a tokio runtime.
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            idx: Indexes::default(),
            catalog: RwLock::new(()),
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds. blocking_write would panic inside an async context.
        for event in &events {
            match event {
                Event::PropertyListed { property } => {
                    engine.idx.add_property(property);
                    let ps = PropertyState::new(property.clone());
                    engine.state.insert(property.id, Arc::new(RwLock::new(ps)));
                }
                Event::PropertyDelisted { id } => {
                    if let Some((_, rs)) = engine.state.remove(id)
                        && let Ok(guard) = rs.try_read()
                    {
                        engine.idx.forget_property(&guard);
                    }
                }
                other => {
                    let Some(rs) = engine.get_property_state(&other.property_id()) else {
                        continue;
                    };
                    if let Ok(mut guard) = rs.try_write() {
                        apply_to_property(&mut guard, other, &engine.idx);
                    }
                }
            }
        }

        metrics::gauge!(crate::observability::PROPERTIES_ACTIVE).set(engine.state.len() as f64);
        tracing::info!(
            "replayed {} events from {}: {} properties",
            events.len(),
            wal_path.display(),
            engine.state.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_property_state(&self, id: &PropertyId) -> Option<SharedPropertyState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_property_for_entity(&self, entity_id: &Ulid) -> Option<PropertyId> {
        self.idx.entity_to_property.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PropertyState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_property(ps, event, &self.idx);
        self.notify.send(ps.id(), event);
        Ok(())
    }

    /// Acquire a property's write lock. Fails with NotFound if the property
    /// was delisted while we waited for the lock.
    pub(super) async fn lock_property(
        &self,
        id: PropertyId,
    ) -> Result<OwnedRwLockWriteGuard<PropertyState>, EngineError> {
        let rs = self.get_property_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.clone().write_owned().await;
        let still_listed = self
            .state
            .get(&id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), &rs));
        if !still_listed {
            return Err(EngineError::NotFound(id));
        }
        Ok(guard)
    }

    /// Lookup entity → property, then acquire that property's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PropertyState>, EngineError> {
        let property_id = self
            .get_property_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.lock_property(property_id).await
    }
}
