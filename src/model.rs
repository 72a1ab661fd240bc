use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_VALID_TIMESTAMP_MS;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

/// Stand-in end for open (ongoing) spans when comparing.
pub const OPEN_END: Ms = MAX_VALID_TIMESTAMP_MS;

/// Half-open interval `[start, end)`. `end == None` means ongoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Option<Ms>,
}

impl Span {
    pub fn new(start: Ms, end: Option<Ms>) -> Self {
        debug_assert!(end.is_none_or(|e| start < e), "Span start must be before end");
        Self { start, end }
    }

    pub fn closed(start: Ms, end: Ms) -> Self {
        Self::new(start, Some(end))
    }

    pub fn open(start: Ms) -> Self {
        Self::new(start, None)
    }

    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// End used for comparisons: the real end, or `OPEN_END`.
    pub fn effective_end(&self) -> Ms {
        self.end.unwrap_or(OPEN_END)
    }

    /// Overlap test. Spans that merely touch (`a.end == b.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.effective_end() && other.start < self.effective_end()
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.effective_end()
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{} .. {}", format_ms(self.start), format_ms(end)),
            None => write!(f, "{} .. open", format_ms(self.start)),
        }
    }
}

/// Render a timestamp for humans, e.g. `2026-10-16 09:30 UTC`.
pub fn format_ms(ms: Ms) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Cached availability label of a unit. Derived from reservations, not authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Available,
    InUse,
    Maintenance,
    Retired,
}

impl DisplayStatus {
    /// Maintenance and retired are set by hand and never recomputed.
    pub fn is_derived(self) -> bool {
        matches!(self, DisplayStatus::Available | DisplayStatus::InUse)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DisplayStatus::Available => "available",
            DisplayStatus::InUse => "in_use",
            DisplayStatus::Maintenance => "maintenance",
            DisplayStatus::Retired => "retired",
        }
    }
}

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub tag: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: Ulid,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub equipment_id: Ulid,
    pub user_id: Ulid,
    pub event_id: Option<Ulid>,
    pub span: Span,
    pub notes: Option<String>,
    pub creator_id: Ulid,
    pub created_at: Ms,
}

/// Immutable record of one completed loan session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLog {
    pub id: Ulid,
    pub session_id: Ulid,
    pub user_id: Ulid,
    pub committed_at: Ms,
    pub equipment_ids: Vec<Ulid>,
}

/// A tag the reader has seen that belongs to nobody yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTag {
    pub tag: String,
    pub first_seen_at: Ms,
    pub last_seen_at: Ms,
    pub seen_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentInfo {
    pub id: Ulid,
    pub name: String,
    pub category: String,
    pub tag: Option<String>,
    pub status: DisplayStatus,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct EquipmentState {
    pub id: Ulid,
    pub name: String,
    pub category: String,
    pub tag: Option<String>,
    pub status: DisplayStatus,
    pub active: bool,
    /// All reservations on this unit, sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl EquipmentState {
    pub fn new(info: &EquipmentInfo) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            category: info.category.clone(),
            tag: info.tag.clone(),
            status: info.status,
            active: info.active,
            reservations: Vec::new(),
        }
    }

    pub fn info(&self) -> EquipmentInfo {
        EquipmentInfo {
            id: self.id,
            name: self.name.clone(),
            category: self.category.clone(),
            tag: self.tag.clone(),
            status: self.status,
            active: self.active,
        }
    }

    /// Insert reservation maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Reservations that could overlap `query`: anything starting before the
    /// query ends whose end is open or later than the query start.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Reservation> {
        // Everything at index >= right_bound starts at or after the query end.
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.effective_end());
        let query_start = query.start;
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end.is_none_or(|end| end > query_start))
    }

    /// Reservations whose span contains `now`.
    pub fn active_at(&self, now: Ms) -> impl Iterator<Item = &Reservation> {
        self.overlapping(Span::closed(now, now + 1))
            .filter(move |r| r.span.contains_instant(now))
    }

    pub fn has_active_at_except(&self, now: Ms, except: Ulid) -> bool {
        self.active_at(now).any(|r| r.id != except)
    }
}

/// The WAL record payload. One commit is a `Vec<Event>` applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserUpserted {
        user: User,
    },
    CalendarEventRegistered {
        event: CalendarEvent,
    },
    CalendarEventRemoved {
        id: Ulid,
    },
    EquipmentRegistered {
        unit: EquipmentInfo,
    },
    EquipmentUpdated {
        id: Ulid,
        name: String,
        category: String,
        tag: Option<String>,
        active: bool,
    },
    /// Batched display-status write.
    StatusChanged {
        ids: Vec<Ulid>,
        status: DisplayStatus,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationUpdated {
        reservation: Reservation,
    },
    ReservationReturned {
        id: Ulid,
        equipment_id: Ulid,
        returned_at: Ms,
        notes: Option<String>,
    },
    ReservationDeleted {
        id: Ulid,
        equipment_id: Ulid,
    },
    UsageLogged {
        log: UsageLog,
    },
    /// Full pending-tag record after a sighting.
    PendingTagRecorded {
        pending: PendingTag,
    },
    PendingTagCleared {
        tag: String,
    },
}

impl Event {
    /// Units whose state this event mutates (and whose lock apply needs).
    pub fn unit_ids(&self) -> Vec<Ulid> {
        match self {
            Event::EquipmentUpdated { id, .. } => vec![*id],
            Event::StatusChanged { ids, .. } => ids.clone(),
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                vec![reservation.equipment_id]
            }
            Event::ReservationReturned { equipment_id, .. }
            | Event::ReservationDeleted { equipment_id, .. } => vec![*equipment_id],
            Event::UserUpserted { .. }
            | Event::CalendarEventRegistered { .. }
            | Event::CalendarEventRemoved { .. }
            | Event::EquipmentRegistered { .. }
            | Event::UsageLogged { .. }
            | Event::PendingTagRecorded { .. }
            | Event::PendingTagCleared { .. } => Vec::new(),
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Outcome of one status synchronization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub to_in_use: Vec<Ulid>,
    pub to_available: Vec<Ulid>,
}

impl SyncReport {
    pub fn writes(&self) -> usize {
        self.to_in_use.len() + self.to_available.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Option<Ms>) -> Reservation {
        Reservation {
            id: Ulid::new(),
            equipment_id: Ulid::new(),
            user_id: Ulid::new(),
            event_id: None,
            span: Span::new(start, end),
            notes: None,
            creator_id: Ulid::new(),
            created_at: 0,
        }
    }

    fn unit() -> EquipmentState {
        EquipmentState::new(&EquipmentInfo {
            id: Ulid::new(),
            name: "Camera A".into(),
            category: "camera".into(),
            tag: None,
            status: DisplayStatus::Available,
            active: true,
        })
    }

    #[test]
    fn span_basics() {
        let s = Span::closed(100, 200);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
        assert!(!s.is_open());

        let open = Span::open(100);
        assert!(open.is_open());
        assert_eq!(open.effective_end(), OPEN_END);
        assert!(open.contains_instant(OPEN_END - 1));
    }

    #[test]
    fn span_overlap_boundaries() {
        assert!(!Span::closed(0, 10).overlaps(&Span::closed(10, 20)));
        assert!(Span::closed(0, 10).overlaps(&Span::closed(5, 15)));
        assert!(Span::open(0).overlaps(&Span::closed(100, 200)));
        assert!(Span::open(0).overlaps(&Span::open(1_000_000)));
        assert!(!Span::closed(0, 100).overlaps(&Span::open(100)));
    }

    #[test]
    fn span_overlap_symmetric() {
        let spans = [
            Span::closed(0, 10),
            Span::closed(10, 20),
            Span::closed(5, 15),
            Span::closed(-50, 0),
            Span::open(0),
            Span::open(15),
            Span::closed(3, 4),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn span_display() {
        let s = Span::closed(0, 3_600_000);
        assert_eq!(s.to_string(), "1970-01-01 00:00 UTC .. 1970-01-01 01:00 UTC");
        assert_eq!(Span::open(0).to_string(), "1970-01-01 00:00 UTC .. open");
    }

    #[test]
    fn status_derivation_flags() {
        assert!(DisplayStatus::Available.is_derived());
        assert!(DisplayStatus::InUse.is_derived());
        assert!(!DisplayStatus::Maintenance.is_derived());
        assert!(!DisplayStatus::Retired.is_derived());
        assert_eq!(DisplayStatus::InUse.to_string(), "in_use");
    }

    #[test]
    fn reservation_ordering() {
        let mut u = unit();
        u.insert_reservation(reservation(300, Some(400)));
        u.insert_reservation(reservation(100, Some(200)));
        u.insert_reservation(reservation(200, None));
        let starts: Vec<Ms> = u.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut u = unit();
        let rs: Vec<Reservation> = (0..3).map(|i| reservation(i * 100, Some(i * 100 + 50))).collect();
        for r in &rs {
            u.insert_reservation(r.clone());
        }
        assert!(u.remove_reservation(rs[1].id).is_some());
        assert!(u.remove_reservation(Ulid::new()).is_none());
        assert_eq!(u.reservations.len(), 2);
        assert_eq!(u.reservations[0].id, rs[0].id);
        assert_eq!(u.reservations[1].id, rs[2].id);
    }

    #[test]
    fn overlapping_prunes_past_and_future() {
        let mut u = unit();
        u.insert_reservation(reservation(100, Some(200))); // past
        u.insert_reservation(reservation(450, Some(600))); // overlaps
        u.insert_reservation(reservation(1000, Some(1100))); // future

        let hits: Vec<_> = u.overlapping(Span::closed(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::closed(450, 600));
    }

    #[test]
    fn overlapping_keeps_open_reservations() {
        let mut u = unit();
        u.insert_reservation(reservation(0, None));
        let hits: Vec<_> = u.overlapping(Span::closed(5_000, 6_000)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut u = unit();
        u.insert_reservation(reservation(100, Some(200)));
        assert_eq!(u.overlapping(Span::closed(200, 300)).count(), 0);
        assert_eq!(u.overlapping(Span::closed(0, 100)).count(), 0);
    }

    #[test]
    fn active_at_respects_half_open_end() {
        let mut u = unit();
        let r = reservation(100, Some(200));
        let id = r.id;
        u.insert_reservation(r);
        assert_eq!(u.active_at(100).count(), 1);
        assert_eq!(u.active_at(199).count(), 1);
        assert_eq!(u.active_at(200).count(), 0);
        assert_eq!(u.active_at(99).count(), 0);
        assert!(!u.has_active_at_except(150, id));
    }

    #[test]
    fn event_unit_ids() {
        let r = reservation(0, None);
        let eid = r.equipment_id;
        assert_eq!(Event::ReservationCreated { reservation: r }.unit_ids(), vec![eid]);
        assert!(Event::PendingTagCleared { tag: "x".into() }.unit_ids().is_empty());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::StatusChanged {
            ids: vec![Ulid::new(), Ulid::new()],
            status: DisplayStatus::InUse,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
