use crate::limits::*;
use crate::model::*;
use crate::pricing::{self, Quote};

use super::availability::{booked_ranges, free_ranges, is_bookable};
use super::conflict::validate_span;
use super::{Engine, EngineError, SharedPropertyState};

fn validate_query(from: Ms, to: Ms) -> Result<Span, EngineError> {
    if from >= to {
        return Err(EngineError::InvalidDateRange("query start must be before end"));
    }
    if to.checked_sub(from).is_none_or(|width| width > MAX_QUERY_WINDOW_MS) {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(from, to))
}

fn matches_filters(p: &Property, q: &SearchQuery) -> bool {
    if !p.active {
        return false;
    }
    if let Some(loc) = &q.location
        && !p.location.to_lowercase().contains(&loc.to_lowercase())
    {
        return false;
    }
    q.guests.is_none_or(|g| p.max_guests >= g)
        && q.min_price.is_none_or(|min| p.price_per_night >= min)
        && q.max_price.is_none_or(|max| p.price_per_night <= max)
}

impl Engine {
    fn property_states(&self) -> Vec<SharedPropertyState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    /// Is `[check_in, check_out)` bookable right now? Unknown properties are not.
    pub async fn is_available(&self, property_id: PropertyId, check_in: Ms, check_out: Ms) -> bool {
        let Some(rs) = self.get_property_state(&property_id) else {
            return false;
        };
        let guard = rs.read().await;
        is_bookable(&guard, check_in, check_out)
    }

    /// Bookable ranges of a property within `[from, to)`.
    pub async fn free_ranges(&self, property_id: PropertyId, from: Ms, to: Ms) -> Result<Vec<Span>, EngineError> {
        let query = validate_query(from, to)?;
        let rs = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = rs.read().await;
        Ok(free_ranges(&guard, &query))
    }

    /// Reserved ranges of a property within `[from, to)`, without guest details.
    pub async fn booked_ranges(&self, property_id: PropertyId, from: Ms, to: Ms) -> Result<Vec<Span>, EngineError> {
        let query = validate_query(from, to)?;
        let rs = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = rs.read().await;
        Ok(booked_ranges(&guard, &query))
    }

    /// Price preview. Uses the same calculator as `create_reservation`.
    pub async fn quote_stay(&self, property_id: PropertyId, check_in: Ms, check_out: Ms) -> Result<Quote, EngineError> {
        validate_span(check_in, check_out, MAX_STAY_MS)?;
        let rs = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = rs.read().await;
        pricing::quote(
            guard.property.price_per_night,
            guard.property.cleaning_fee,
            check_in,
            check_out,
        )
        .ok_or(EngineError::LimitExceeded("total price overflow"))
    }

    pub async fn get_property(&self, property_id: PropertyId) -> Option<Property> {
        let rs = self.get_property_state(&property_id)?;
        let guard = rs.read().await;
        Some(guard.property.clone())
    }

    /// Active listings, oldest first.
    pub async fn list_properties(&self) -> Vec<Property> {
        self.search(&SearchQuery::default()).await
    }

    /// Everything an owner lists, active or not.
    pub async fn properties_by_owner(&self, owner_id: UserId) -> Vec<Property> {
        let ids = self
            .idx
            .by_owner
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.get_property(id).await {
                result.push(p);
            }
        }
        result.sort_by_key(|p| p.id);
        result
    }

    pub async fn search(&self, query: &SearchQuery) -> Vec<Property> {
        let mut result = Vec::new();
        for rs in self.property_states() {
            let guard = rs.read().await;
            if !matches_filters(&guard.property, query) {
                continue;
            }
            if let Some(stay) = &query.stay
                && !is_bookable(&guard, stay.start, stay.end)
            {
                continue;
            }
            result.push(guard.property.clone());
        }
        // ULIDs sort by creation time
        result.sort_by_key(|p| p.id);
        result
    }

    pub async fn windows(&self, property_id: PropertyId) -> Result<Vec<AvailabilityWindow>, EngineError> {
        let rs = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = rs.read().await;
        Ok(guard.windows.clone())
    }

    /// The caller's own reservations, by check-in.
    pub async fn reservations_for_guest(&self, caller: &Caller) -> Vec<Reservation> {
        let ids = self
            .idx
            .by_guest
            .get(&caller.user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(rs) = self
                .get_property_for_entity(&id)
                .and_then(|pid| self.get_property_state(&pid))
            else {
                continue;
            };
            let guard = rs.read().await;
            if let Some(r) = guard.reservations.iter().find(|r| r.id == id) {
                result.push(r.clone());
            }
        }
        result.sort_by_key(|r| r.check_in);
        result
    }

    /// All reservations on a property. Owner only.
    pub async fn reservations_for_property(
        &self,
        caller: &Caller,
        property_id: PropertyId,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_property_state(&property_id)
            .ok_or(EngineError::NotFound(property_id))?;
        let guard = rs.read().await;
        if guard.property.owner_id != caller.user_id {
            return Err(EngineError::Forbidden("only the owner can list a property's reservations"));
        }
        Ok(guard.reservations.clone())
    }

    /// A single reservation, visible to its guest and the property owner.
    pub async fn get_reservation(&self, caller: &Caller, reservation_id: ReservationId) -> Result<Reservation, EngineError> {
        let rs = self
            .get_property_for_entity(&reservation_id)
            .and_then(|pid| self.get_property_state(&pid))
            .ok_or(EngineError::NotFound(reservation_id))?;
        let guard = rs.read().await;
        let reservation = guard
            .reservations
            .iter()
            .find(|r| r.id == reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if reservation.guest_id != caller.user_id && guard.property.owner_id != caller.user_id {
            return Err(EngineError::Forbidden("not your reservation"));
        }
        Ok(reservation.clone())
    }
}
