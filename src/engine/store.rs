use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedUnit = Arc<RwLock<EquipmentState>>;

/// Write guards of the units an operation touches, keyed (and therefore
/// acquired) in ascending id order.
pub type UnitGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<EquipmentState>>;

/// Who a scanned tag belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOwner {
    User(Ulid),
    Equipment(Ulid),
}

/// In-process tables backing the engine. Mutated only through `apply_event`,
/// always after the event's commit is durable in the WAL.
pub struct Store {
    units: DashMap<Ulid, SharedUnit>,
    /// Reverse lookup: reservation id → equipment id.
    reservation_index: DashMap<Ulid, Ulid>,
    users: DashMap<Ulid, User>,
    calendar_events: DashMap<Ulid, CalendarEvent>,
    tags: DashMap<String, TagOwner>,
    pending_tags: DashMap<String, PendingTag>,
    usage_logs: DashMap<Ulid, UsageLog>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            units: DashMap::new(),
            reservation_index: DashMap::new(),
            users: DashMap::new(),
            calendar_events: DashMap::new(),
            tags: DashMap::new(),
            pending_tags: DashMap::new(),
            usage_logs: DashMap::new(),
        }
    }

    // ── Equipment ────────────────────────────────────────────

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn contains_unit(&self, id: &Ulid) -> bool {
        self.units.contains_key(id)
    }

    pub fn unit(&self, id: &Ulid) -> Option<SharedUnit> {
        self.units.get(id).map(|e| e.value().clone())
    }

    pub fn unit_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.units.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    pub fn equipment_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    // ── Directory lookups ────────────────────────────────────

    pub fn user(&self, id: &Ulid) -> Option<User> {
        self.users.get(id).map(|e| e.value().clone())
    }

    pub fn users(&self) -> Vec<User> {
        self.users.iter().map(|e| e.value().clone()).collect()
    }

    pub fn user_name(&self, id: &Ulid) -> String {
        self.users
            .get(id)
            .map(|e| e.value().name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    pub fn calendar_event(&self, id: &Ulid) -> Option<CalendarEvent> {
        self.calendar_events.get(id).map(|e| e.value().clone())
    }

    pub fn calendar_events(&self) -> Vec<CalendarEvent> {
        self.calendar_events.iter().map(|e| e.value().clone()).collect()
    }

    pub fn tag_owner(&self, tag: &str) -> Option<TagOwner> {
        self.tags.get(tag).map(|e| *e.value())
    }

    pub fn pending_tag(&self, tag: &str) -> Option<PendingTag> {
        self.pending_tags.get(tag).map(|e| e.value().clone())
    }

    pub fn pending_tags(&self) -> Vec<PendingTag> {
        self.pending_tags.iter().map(|e| e.value().clone()).collect()
    }

    pub fn usage_logs(&self) -> Vec<UsageLog> {
        self.usage_logs.iter().map(|e| e.value().clone()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply one committed event. Unit-scoped events mutate the matching
    /// guard in `guards`; the caller locked every id in `Event::unit_ids`.
    pub fn apply_event(&self, event: &Event, guards: &mut UnitGuards) {
        match event {
            Event::UserUpserted { user } => {
                let previous_tag = self.users.get(&user.id).and_then(|e| e.value().tag.clone());
                if let Some(old) = previous_tag
                    && user.tag.as_deref() != Some(old.as_str())
                {
                    self.tags.remove(&old);
                }
                if let Some(tag) = &user.tag {
                    self.tags.insert(tag.clone(), TagOwner::User(user.id));
                    self.pending_tags.remove(tag);
                }
                self.users.insert(user.id, user.clone());
            }
            Event::CalendarEventRegistered { event } => {
                self.calendar_events.insert(event.id, event.clone());
            }
            Event::CalendarEventRemoved { id } => {
                self.calendar_events.remove(id);
            }
            Event::EquipmentRegistered { unit } => {
                if let Some(tag) = &unit.tag {
                    self.tags.insert(tag.clone(), TagOwner::Equipment(unit.id));
                    self.pending_tags.remove(tag);
                }
                self.units
                    .insert(unit.id, Arc::new(RwLock::new(EquipmentState::new(unit))));
            }
            Event::EquipmentUpdated {
                id,
                name,
                category,
                tag,
                active,
            } => {
                if let Some(unit) = guards.get_mut(id) {
                    if let Some(old) = unit.tag.take()
                        && tag.as_deref() != Some(old.as_str())
                    {
                        self.tags.remove(&old);
                    }
                    if let Some(tag) = tag {
                        self.tags.insert(tag.clone(), TagOwner::Equipment(*id));
                        self.pending_tags.remove(tag);
                    }
                    unit.name = name.clone();
                    unit.category = category.clone();
                    unit.tag = tag.clone();
                    unit.active = *active;
                }
            }
            Event::StatusChanged { ids, status } => {
                for id in ids {
                    if let Some(unit) = guards.get_mut(id) {
                        unit.status = *status;
                    }
                }
            }
            Event::ReservationCreated { reservation } => {
                if let Some(unit) = guards.get_mut(&reservation.equipment_id) {
                    unit.insert_reservation(reservation.clone());
                    self.reservation_index
                        .insert(reservation.id, reservation.equipment_id);
                }
            }
            Event::ReservationUpdated { reservation } => {
                if let Some(unit) = guards.get_mut(&reservation.equipment_id) {
                    unit.remove_reservation(reservation.id);
                    unit.insert_reservation(reservation.clone());
                }
            }
            Event::ReservationReturned {
                id,
                equipment_id,
                returned_at,
                notes,
            } => {
                if let Some(unit) = guards.get_mut(equipment_id)
                    && let Some(r) = unit.reservation_mut(*id)
                {
                    r.span.end = Some(*returned_at);
                    if notes.is_some() {
                        r.notes = notes.clone();
                    }
                }
            }
            Event::ReservationDeleted { id, equipment_id } => {
                if let Some(unit) = guards.get_mut(equipment_id) {
                    unit.remove_reservation(*id);
                }
                self.reservation_index.remove(id);
            }
            Event::UsageLogged { log } => {
                self.usage_logs.insert(log.id, log.clone());
            }
            Event::PendingTagRecorded { pending } => {
                self.pending_tags.insert(pending.tag.clone(), pending.clone());
            }
            Event::PendingTagCleared { tag } => {
                self.pending_tags.remove(tag);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(tag: Option<&str>) -> EquipmentInfo {
        EquipmentInfo {
            id: Ulid::new(),
            name: "Tripod".into(),
            category: "grip".into(),
            tag: tag.map(String::from),
            status: DisplayStatus::Available,
            active: true,
        }
    }

    fn pending(tag: &str, at: Ms) -> Event {
        Event::PendingTagRecorded {
            pending: PendingTag {
                tag: tag.into(),
                first_seen_at: at,
                last_seen_at: at,
                seen_count: 1,
            },
        }
    }

    #[test]
    fn assigning_a_tag_clears_pending_and_indexes_it() {
        let store = Store::new();
        let mut guards = UnitGuards::new();
        store.apply_event(&pending("AB", 1), &mut guards);

        let unit = info(Some("AB"));
        store.apply_event(&Event::EquipmentRegistered { unit: unit.clone() }, &mut guards);

        assert!(store.pending_tag("AB").is_none());
        assert_eq!(store.tag_owner("AB"), Some(TagOwner::Equipment(unit.id)));
        assert!(store.contains_unit(&unit.id));
    }

    #[test]
    fn retagging_a_user_frees_the_old_tag() {
        let store = Store::new();
        let mut guards = UnitGuards::new();
        let mut user = User {
            id: Ulid::new(),
            name: "Mika".into(),
            tag: Some("OLD".into()),
            active: true,
        };
        store.apply_event(&Event::UserUpserted { user: user.clone() }, &mut guards);
        user.tag = Some("NEW".into());
        store.apply_event(&Event::UserUpserted { user: user.clone() }, &mut guards);

        assert_eq!(store.tag_owner("OLD"), None);
        assert_eq!(store.tag_owner("NEW"), Some(TagOwner::User(user.id)));
        assert_eq!(store.user_name(&user.id), "Mika");
    }

    #[tokio::test]
    async fn unit_events_need_the_guard() {
        let store = Store::new();
        let mut guards = UnitGuards::new();
        let unit = info(None);
        store.apply_event(&Event::EquipmentRegistered { unit: unit.clone() }, &mut guards);

        let shared = store.unit(&unit.id).unwrap();
        guards.insert(unit.id, shared.clone().write_owned().await);
        store.apply_event(
            &Event::StatusChanged {
                ids: vec![unit.id],
                status: DisplayStatus::Maintenance,
            },
            &mut guards,
        );
        drop(guards);

        assert_eq!(shared.read().await.status, DisplayStatus::Maintenance);
    }
}
