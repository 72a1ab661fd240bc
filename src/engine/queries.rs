use serde::Deserialize;
use ulid::Ulid;

use crate::model::*;

use super::conflict::normalize_tag;
use super::store::TagOwner;
use super::{Engine, EngineError};

/// Every set field must match. `active_at` keeps reservations whose span
/// contains that instant.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReservationFilter {
    pub equipment_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub event_id: Option<Ulid>,
    pub active_at: Option<Ms>,
}

impl ReservationFilter {
    fn matches(&self, r: &Reservation) -> bool {
        self.user_id.is_none_or(|id| r.user_id == id)
            && self.event_id.is_none_or(|id| r.event_id == Some(id))
            && self.active_at.is_none_or(|t| r.span.contains_instant(t))
    }
}

/// Usage-log history filter. `[from, to)` bounds `committed_at`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UsageFilter {
    pub user_id: Option<Ulid>,
    pub equipment_id: Option<Ulid>,
    pub from: Option<Ms>,
    pub to: Option<Ms>,
}

impl UsageFilter {
    fn matches(&self, log: &UsageLog) -> bool {
        self.user_id.is_none_or(|id| log.user_id == id)
            && self.equipment_id.is_none_or(|id| log.equipment_ids.contains(&id))
            && self.from.is_none_or(|t| log.committed_at >= t)
            && self.to.is_none_or(|t| log.committed_at < t)
    }
}

impl Engine {
    // ── Reservations ─────────────────────────────────────────

    /// Matching reservations ordered by start.
    pub async fn list_reservations(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        let ids = match filter.equipment_id {
            Some(id) => vec![id],
            None => self.store.unit_ids(),
        };
        let mut out = Vec::new();
        for id in ids {
            let Some(unit) = self.store.unit(&id) else {
                continue;
            };
            let guard = unit.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by_key(|r| (r.span.start, r.id));
        out
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let equipment_id = self
            .store
            .equipment_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let unit = self.store.unit(&equipment_id).ok_or(EngineError::NotFound(id))?;
        let guard = unit.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(id))
    }

    // ── Equipment ────────────────────────────────────────────

    /// All units with freshly synchronized status.
    pub async fn list_equipment(&self) -> Result<Vec<EquipmentInfo>, EngineError> {
        self.sync_status().await?;
        let mut out = Vec::with_capacity(self.store.unit_count());
        for id in self.store.unit_ids() {
            if let Some(unit) = self.store.unit(&id) {
                out.push(unit.read().await.info());
            }
        }
        Ok(out)
    }

    pub async fn get_equipment(&self, id: Ulid) -> Result<EquipmentInfo, EngineError> {
        let unit = self.store.unit(&id).ok_or(EngineError::NotFound(id))?;
        self.sync_status().await?;
        Ok(unit.read().await.info())
    }

    // ── Directory ────────────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Option<User> {
        self.store.user(&id)
    }

    /// All users, by name.
    pub fn list_users(&self) -> Vec<User> {
        let mut users = self.store.users();
        users.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        users
    }

    pub fn find_by_tag(&self, tag: &str) -> Option<TagOwner> {
        self.store.tag_owner(normalize_tag(tag))
    }

    /// Unassigned tags, most recently seen first.
    pub fn pending_tags(&self) -> Vec<PendingTag> {
        let mut tags = self.store.pending_tags();
        tags.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at).then_with(|| a.tag.cmp(&b.tag)));
        tags
    }

    // ── Usage history ────────────────────────────────────────

    /// Matching usage logs, oldest first.
    pub fn usage_history(&self, filter: &UsageFilter) -> Vec<UsageLog> {
        let mut logs: Vec<UsageLog> = self
            .store
            .usage_logs()
            .into_iter()
            .filter(|l| filter.matches(l))
            .collect();
        logs.sort_by_key(|l| (l.committed_at, l.id));
        logs
    }

    pub fn usage_by_user(&self, user_id: Ulid) -> Vec<UsageLog> {
        self.usage_history(&UsageFilter {
            user_id: Some(user_id),
            ..Default::default()
        })
    }

    pub fn usage_by_equipment(&self, equipment_id: Ulid) -> Vec<UsageLog> {
        self.usage_history(&UsageFilter {
            equipment_id: Some(equipment_id),
            ..Default::default()
        })
    }

    pub fn usage_between(&self, from: Ms, to: Ms) -> Vec<UsageLog> {
        self.usage_history(&UsageFilter {
            from: Some(from),
            to: Some(to),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log(user_id: Ulid, equipment_ids: Vec<Ulid>, committed_at: Ms) -> UsageLog {
        UsageLog {
            id: Ulid::new(),
            session_id: Ulid::new(),
            user_id,
            committed_at,
            equipment_ids,
        }
    }

    #[test]
    fn usage_filter_bounds_are_half_open() {
        let l = log(Ulid::new(), vec![], 100);
        let f = |from, to| UsageFilter {
            from,
            to,
            ..Default::default()
        };
        assert!(f(Some(100), Some(101)).matches(&l));
        assert!(!f(Some(101), None).matches(&l));
        assert!(!f(None, Some(100)).matches(&l));
    }

    #[test]
    fn usage_filter_combines_fields() {
        let user = Ulid::new();
        let cam = Ulid::new();
        let l = log(user, vec![cam], 10);
        let filter = UsageFilter {
            user_id: Some(user),
            equipment_id: Some(cam),
            ..Default::default()
        };
        assert!(filter.matches(&l));
        let other = UsageFilter {
            user_id: Some(user),
            equipment_id: Some(Ulid::new()),
            ..Default::default()
        };
        assert!(!other.matches(&l));
    }
}
