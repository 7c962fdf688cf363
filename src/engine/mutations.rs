use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{RwLock, oneshot};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{self, RESERVATIONS_CANCELLED_TOTAL, RESERVATIONS_CREATED_TOTAL};
use crate::pricing;

use super::conflict::{check_bookable, check_cancellable, now_ms, validate_span, validate_stay};
use super::{Engine, EngineError, WalCommand};

fn require_owner(ps: &PropertyState, caller: &Caller, msg: &'static str) -> Result<(), EngineError> {
    if ps.property.owner_id != caller.user_id {
        return Err(EngineError::Forbidden(msg));
    }
    Ok(())
}

fn validate_listing(p: &Property) -> Result<(), EngineError> {
    if p.title.trim().is_empty() {
        return Err(EngineError::InvalidInput("title must not be empty"));
    }
    if p.title.len() > MAX_TITLE_LEN {
        return Err(EngineError::LimitExceeded("title too long"));
    }
    if p.description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if p.location.trim().is_empty() {
        return Err(EngineError::InvalidInput("location must not be empty"));
    }
    if p.location.len() > MAX_LOCATION_LEN {
        return Err(EngineError::LimitExceeded("location too long"));
    }
    if p.price_per_night == 0 {
        return Err(EngineError::InvalidInput("nightly price must be positive"));
    }
    if p.max_guests == 0 {
        return Err(EngineError::InvalidInput("max guests must be at least 1"));
    }
    if p.max_guests > MAX_GUESTS_PER_PROPERTY {
        return Err(EngineError::LimitExceeded("max guests too high"));
    }
    Ok(())
}

fn patch_required<T>(patch: Patch<T>, slot: &mut T, field: &'static str) -> Result<(), EngineError> {
    match patch {
        Patch::Keep => Ok(()),
        Patch::Set(v) => {
            *slot = v;
            Ok(())
        }
        Patch::Clear => Err(EngineError::InvalidInput(field)),
    }
}

fn patch_nullable<T>(patch: Patch<T>, slot: &mut Option<T>) {
    match patch {
        Patch::Keep => {}
        Patch::Set(v) => *slot = Some(v),
        Patch::Clear => *slot = None,
    }
}

/// Apply a patch to a copy of the listing. Nothing is written if any field is rejected.
fn apply_patch(current: &Property, patch: PropertyPatch) -> Result<Property, EngineError> {
    let mut next = current.clone();
    patch_required(patch.title, &mut next.title, "title cannot be cleared")?;
    patch_nullable(patch.description, &mut next.description);
    patch_required(patch.location, &mut next.location, "location cannot be cleared")?;
    patch_required(patch.price_per_night, &mut next.price_per_night, "nightly price cannot be cleared")?;
    patch_required(patch.cleaning_fee, &mut next.cleaning_fee, "cleaning fee cannot be cleared")?;
    patch_required(patch.max_guests, &mut next.max_guests, "max guests cannot be cleared")?;
    patch_required(patch.active, &mut next.active, "active flag cannot be cleared")?;
    validate_listing(&next)?;
    Ok(next)
}

impl Engine {
    // ── Listings ─────────────────────────────────────────────

    pub async fn list_property(&self, caller: &Caller, new: NewProperty) -> Result<Property, EngineError> {
        let _catalog = self.catalog.read().await;
        if self.state.len() >= MAX_PROPERTIES {
            return Err(EngineError::LimitExceeded("too many properties"));
        }
        let property = Property {
            id: Ulid::new(),
            owner_id: caller.user_id,
            title: new.title,
            description: new.description,
            location: new.location,
            price_per_night: new.price_per_night,
            cleaning_fee: new.cleaning_fee,
            max_guests: new.max_guests,
            active: true,
            listed_at: now_ms(),
        };
        validate_listing(&property)?;

        let event = Event::PropertyListed {
            property: property.clone(),
        };
        self.wal_append(&event).await?;
        self.idx.add_property(&property);
        let ps = PropertyState::new(property.clone());
        self.state.insert(property.id, Arc::new(RwLock::new(ps)));
        self.notify.send(property.id, &event);
        metrics::gauge!(observability::PROPERTIES_ACTIVE).set(self.state.len() as f64);
        info!("property {} listed by {}", property.id, caller.user_id);
        Ok(property)
    }

    pub async fn update_property(
        &self,
        caller: &Caller,
        property_id: PropertyId,
        patch: PropertyPatch,
    ) -> Result<Property, EngineError> {
        let mut guard = self.lock_property(property_id).await?;
        require_owner(&guard, caller, "only the owner can edit a property")?;
        if patch.is_noop() {
            return Ok(guard.property.clone());
        }
        let property = apply_patch(&guard.property, patch)?;

        let event = Event::PropertyUpdated {
            property: property.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        debug!("property {property_id} updated");
        Ok(property)
    }

    /// Remove a property with its windows and past reservations.
    pub async fn delist_property(&self, caller: &Caller, property_id: PropertyId) -> Result<(), EngineError> {
        let _catalog = self.catalog.read().await;
        let guard = self.lock_property(property_id).await?;
        require_owner(&guard, caller, "only the owner can delist a property")?;
        if guard.has_upcoming_reservations(now_ms()) {
            return Err(EngineError::HasReservations(property_id));
        }

        let event = Event::PropertyDelisted { id: property_id };
        self.wal_append(&event).await?;
        // Still holding the write guard: waiters re-check the map and see NotFound.
        self.state.remove(&property_id);
        self.idx.forget_property(&guard);
        drop(guard);
        self.notify.send(property_id, &event);
        self.notify.remove(&property_id);
        metrics::gauge!(observability::PROPERTIES_ACTIVE).set(self.state.len() as f64);
        info!("property {property_id} delisted");
        Ok(())
    }

    // ── Availability windows ─────────────────────────────────

    pub async fn add_window(
        &self,
        caller: &Caller,
        property_id: PropertyId,
        start: Ms,
        end: Ms,
        available: bool,
    ) -> Result<AvailabilityWindow, EngineError> {
        let span = validate_span(start, end, MAX_WINDOW_MS)?;
        let mut guard = self.lock_property(property_id).await?;
        require_owner(&guard, caller, "only the owner can edit availability")?;
        if guard.windows.len() >= MAX_WINDOWS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many windows on property"));
        }

        let id = Ulid::new();
        let event = Event::WindowAdded {
            id,
            property_id,
            span,
            available,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(AvailabilityWindow {
            id,
            property_id,
            start,
            end,
            available,
        })
    }

    pub async fn update_window(
        &self,
        caller: &Caller,
        window_id: WindowId,
        start: Ms,
        end: Ms,
        available: bool,
    ) -> Result<AvailabilityWindow, EngineError> {
        let span = validate_span(start, end, MAX_WINDOW_MS)?;
        let mut guard = self.resolve_entity_write(&window_id).await?;
        if !guard.windows.iter().any(|w| w.id == window_id) {
            return Err(EngineError::NotFound(window_id));
        }
        require_owner(&guard, caller, "only the owner can edit availability")?;

        let property_id = guard.id();
        let event = Event::WindowUpdated {
            id: window_id,
            property_id,
            span,
            available,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(AvailabilityWindow {
            id: window_id,
            property_id,
            start,
            end,
            available,
        })
    }

    pub async fn remove_window(&self, caller: &Caller, window_id: WindowId) -> Result<(), EngineError> {
        let mut guard = self.resolve_entity_write(&window_id).await?;
        if !guard.windows.iter().any(|w| w.id == window_id) {
            return Err(EngineError::NotFound(window_id));
        }
        require_owner(&guard, caller, "only the owner can edit availability")?;

        let event = Event::WindowRemoved {
            id: window_id,
            property_id: guard.id(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    // ── Reservations ─────────────────────────────────────────

    /// Book `[check_in, check_out)` for the caller.
    ///
    /// Availability is re-checked under the property's write lock and the lock
    /// is held until the reservation is durable, so two overlapping requests
    /// can never both succeed.
    pub async fn create_reservation(
        &self,
        caller: &Caller,
        property_id: PropertyId,
        check_in: Ms,
        check_out: Ms,
        guest_count: u32,
    ) -> Result<Reservation, EngineError> {
        let started = Instant::now();
        let result = self
            .create_reservation_inner(caller, property_id, check_in, check_out, guest_count)
            .await;
        observability::record("create_reservation", started, &result);
        match &result {
            Ok(r) => {
                metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
                info!(
                    "reservation {} on {} for [{}, {}) total {}",
                    r.id, property_id, r.check_in, r.check_out, r.total_price
                );
            }
            Err(e) => {
                let reason = observability::error_label(e);
                metrics::counter!(observability::RESERVATIONS_REJECTED_TOTAL, "reason" => reason)
                    .increment(1);
                debug!("reservation on {property_id} refused: {e}");
            }
        }
        result
    }

    async fn create_reservation_inner(
        &self,
        caller: &Caller,
        property_id: PropertyId,
        check_in: Ms,
        check_out: Ms,
        guest_count: u32,
    ) -> Result<Reservation, EngineError> {
        let now = now_ms();
        let stay = validate_stay(check_in, check_out, now)?;

        let mut guard = self.lock_property(property_id).await?;
        let property = &guard.property;
        if !property.active {
            return Err(EngineError::Inactive(property_id));
        }
        if property.owner_id == caller.user_id {
            return Err(EngineError::Forbidden("cannot book your own property"));
        }
        if guest_count == 0 {
            return Err(EngineError::InvalidInput("at least one guest is required"));
        }
        if guest_count > property.max_guests {
            return Err(EngineError::TooManyGuests {
                requested: guest_count,
                max: property.max_guests,
            });
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many reservations on property"));
        }

        check_bookable(&guard, &stay)?;

        let quote = pricing::quote(
            guard.property.price_per_night,
            guard.property.cleaning_fee,
            check_in,
            check_out,
        )
        .ok_or(EngineError::LimitExceeded("total price overflow"))?;

        let reservation = Reservation {
            id: Ulid::new(),
            property_id,
            guest_id: caller.user_id,
            check_in,
            check_out,
            guest_count,
            total_price: quote.total_price,
            created_at: now,
        };
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(reservation)
    }

    pub async fn cancel_reservation(&self, caller: &Caller, reservation_id: ReservationId) -> Result<(), EngineError> {
        self.cancel_reservation_at(caller, reservation_id, now_ms()).await
    }

    /// Cancel as of `now`. Only the guest may cancel, and only strictly more
    /// than 24 hours before check-in.
    pub(crate) async fn cancel_reservation_at(
        &self,
        caller: &Caller,
        reservation_id: ReservationId,
        now: Ms,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = async {
            let mut guard = self.resolve_entity_write(&reservation_id).await?;
            let reservation = guard
                .reservations
                .iter()
                .find(|r| r.id == reservation_id)
                .ok_or(EngineError::NotFound(reservation_id))?;
            if reservation.guest_id != caller.user_id {
                return Err(EngineError::Forbidden("only the guest can cancel a reservation"));
            }
            check_cancellable(reservation, now)?;

            let event = Event::ReservationCancelled {
                id: reservation_id,
                property_id: guard.id(),
            };
            self.persist_and_apply(&mut guard, &event).await
        }
        .await;
        observability::record("cancel_reservation", started, &result);
        if result.is_ok() {
            metrics::counter!(RESERVATIONS_CANCELLED_TOTAL).increment(1);
            info!("reservation {reservation_id} cancelled");
        }
        result
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate the current state.
    ///
    /// Every property is read-locked until the compacted file is in place, so
    /// no mutation can land between the snapshot and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        let mut shared: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);
        let mut guards = Vec::with_capacity(shared.len());
        for (_, rs) in shared {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::PropertyListed {
                property: guard.property.clone(),
            });
            for w in &guard.windows {
                events.push(Event::WindowAdded {
                    id: w.id,
                    property_id: w.property_id,
                    span: w.span(),
                    available: w.available,
                });
            }
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        drop(guards);
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("wal compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
