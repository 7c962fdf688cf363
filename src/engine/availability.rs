use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// First reservation whose stay overlaps `stay` (half-open).
pub fn find_conflict<'a>(state: &'a PropertyState, stay: &Span) -> Option<&'a Reservation> {
    state.overlapping_reservations(stay).next()
}

/// First open window that fully contains `stay`. Blocked windows never qualify.
pub fn covering_open_window<'a>(
    state: &'a PropertyState,
    stay: &Span,
) -> Option<&'a AvailabilityWindow> {
    state
        .overlapping_windows(stay)
        .find(|w| w.available && w.span().contains_span(stay))
}

/// Two-phase check: no reservation overlaps AND one open window covers the
/// whole stay. Both must hold.
pub fn is_bookable(state: &PropertyState, check_in: Ms, check_out: Ms) -> bool {
    if check_in >= check_out {
        return false;
    }
    let stay = Span::new(check_in, check_out);
    find_conflict(state, &stay).is_none() && covering_open_window(state, &stay).is_some()
}

/// Bookable sub-ranges of `query`: each open window clamped to the query,
/// minus existing reservations.
///
/// Pieces from different windows are not merged, because a stay must fit inside a
/// single window. A stay within `query` is bookable iff one returned
/// range contains it. Sorted by start; overlapping windows give overlapping ranges.
pub fn free_ranges(state: &PropertyState, query: &Span) -> Vec<Span> {
    let booked: Vec<Span> = state
        .overlapping_reservations(query)
        .map(Reservation::stay)
        .collect();

    let mut free = Vec::new();
    for window in state.overlapping_windows(query).filter(|w| w.available) {
        let clamped = Span::new(window.start.max(query.start), window.end.min(query.end));
        free.extend(subtract_intervals(&[clamped], &booked));
    }
    free.sort_by_key(|s| (s.start, s.end));
    free.dedup();
    free
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Remove `to_remove` (sorted by start) from `base` (sorted, disjoint).
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

/// Ranges within `query` that are covered by at least one reservation, merged.
/// Used by host calendars; the inverse view of `free_ranges`.
pub fn booked_ranges(state: &PropertyState, query: &Span) -> Vec<Span> {
    let booked: Vec<Span> = state
        .overlapping_reservations(query)
        .map(|r| Span::new(r.check_in.max(query.start), r.check_out.min(query.end)))
        .collect();
    merge_overlapping(&booked)
}
