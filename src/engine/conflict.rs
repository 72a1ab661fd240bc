use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::error::Violation;
use super::store::Store;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Readers pad tags inconsistently; a tag is stored and looked up without
/// surrounding whitespace.
pub(crate) fn normalize_tag(tag: &str) -> &str {
    tag.trim()
}

/// Check a requested `[start, end)` and push what is wrong with it.
/// Returns the span only when it is well formed.
pub(crate) fn validate_range(start: Ms, end: Option<Ms>, violations: &mut Vec<Violation>) -> Option<Span> {
    let mut ok = true;
    for t in std::iter::once(start).chain(end) {
        if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
            violations.push(Violation::TimestampOutOfRange(t));
            ok = false;
        }
    }
    if let Some(end) = end
        && end <= start
    {
        violations.push(Violation::InvalidRange { start, end });
        ok = false;
    }
    ok.then(|| Span::new(start, end))
}

pub(crate) fn validate_notes(notes: Option<&str>, violations: &mut Vec<Violation>) {
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        violations.push(Violation::TooLong("notes"));
    }
}

/// The user must exist and be active.
pub(crate) fn check_user(store: &Store, user_id: Ulid, violations: &mut Vec<Violation>) {
    match store.user(&user_id) {
        None => violations.push(Violation::UnknownUser(user_id)),
        Some(u) if !u.active => violations.push(Violation::InactiveUser(user_id)),
        Some(_) => {}
    }
}

pub(crate) fn check_event(store: &Store, event_id: Option<Ulid>, violations: &mut Vec<Violation>) {
    if let Some(id) = event_id
        && store.calendar_event(&id).is_none()
    {
        violations.push(Violation::UnknownEvent(id));
    }
}

/// First reservation on `unit` (other than `exclude`) overlapping `span`.
/// Only reservations that can possibly overlap are visited.
pub(crate) fn find_conflict<'a>(
    unit: &'a EquipmentState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Option<&'a Reservation> {
    unit.overlapping(*span)
        .filter(|r| Some(r.id) != exclude)
        .find(|r| r.span.overlaps(span))
}

pub(crate) fn conflict_violation(store: &Store, existing: &Reservation) -> Violation {
    Violation::Conflict {
        equipment_id: existing.equipment_id,
        reservation_id: existing.id,
        holder: store.user_name(&existing.user_id),
        span: existing.span,
    }
}
