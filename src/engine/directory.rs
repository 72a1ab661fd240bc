use std::collections::BTreeSet;

use serde::Deserialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{normalize_tag, now_ms};
use super::status::{occupancy, status_writes};
use super::store::TagOwner;
use super::{Engine, EngineError, Violation};

#[derive(Debug, Clone, Deserialize)]
pub struct NewEquipment {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// Fields left `None` are unchanged; `tag: Some(None)` unlinks the tag.
#[derive(Debug, Clone, Default)]
pub struct EquipmentPatch {
    pub name: Option<String>,
    pub category: Option<String>,
    pub tag: Option<Option<String>>,
    pub active: Option<bool>,
}

/// Manual service state of a unit. Only `InService` units take part in
/// status derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceCondition {
    InService,
    Maintenance,
    Retired,
}

fn validate_name(field: &'static str, name: &str, violations: &mut Vec<Violation>) {
    if name.trim().is_empty() {
        violations.push(Violation::MissingField(field));
    } else if name.len() > MAX_NAME_LEN {
        violations.push(Violation::TooLong(field));
    }
}

fn normalized(tag: Option<String>) -> Option<String> {
    tag.map(|t| normalize_tag(&t).to_string())
}

fn validate_tag(tag: Option<&str>, violations: &mut Vec<Violation>) {
    match tag {
        Some(t) if t.is_empty() => violations.push(Violation::MissingField("tag")),
        Some(t) if t.len() > MAX_TAG_LEN => violations.push(Violation::TooLong("tag")),
        _ => {}
    }
}

impl Engine {
    /// A tag may only move to `owner` if it is free or already theirs.
    fn check_tag_free(&self, tag: Option<&str>, owner: TagOwner, violations: &mut Vec<Violation>) {
        if let Some(tag) = tag
            && let Some(existing) = self.store.tag_owner(tag)
            && existing != owner
        {
            violations.push(Violation::TagInUse(tag.to_string()));
        }
    }

    // ── Users ────────────────────────────────────────────────

    /// Insert or replace a user. Assigning a tag clears it from the pending list.
    pub async fn upsert_user(&self, mut user: User) -> Result<User, EngineError> {
        user.tag = normalized(user.tag);
        let mut violations = Vec::new();
        validate_name("name", &user.name, &mut violations);
        validate_tag(user.tag.as_deref(), &mut violations);

        // Directory writes are rare; exclusive access keeps tag checks race-free.
        let _exclusive = self.commit_gate.write().await;
        self.check_tag_free(user.tag.as_deref(), TagOwner::User(user.id), &mut violations);
        if !violations.is_empty() {
            return Err(EngineError::Validation(violations));
        }
        self.commit(vec![Event::UserUpserted { user: user.clone() }], &mut Default::default())
            .await?;
        Ok(user)
    }

    pub async fn set_user_active(&self, id: Ulid, active: bool) -> Result<User, EngineError> {
        let _exclusive = self.commit_gate.write().await;
        let mut user = self.store.user(&id).ok_or(EngineError::NotFound(id))?;
        if user.active == active {
            return Ok(user);
        }
        user.active = active;
        self.commit(vec![Event::UserUpserted { user: user.clone() }], &mut Default::default())
            .await?;
        Ok(user)
    }

    // ── Calendar events ──────────────────────────────────────

    pub async fn register_calendar_event(&self, event: CalendarEvent) -> Result<CalendarEvent, EngineError> {
        let mut violations = Vec::new();
        validate_name("title", &event.title, &mut violations);
        if !violations.is_empty() {
            return Err(EngineError::Validation(violations));
        }
        let _gate = self.begin_write().await;
        self.commit(
            vec![Event::CalendarEventRegistered { event: event.clone() }],
            &mut Default::default(),
        )
        .await?;
        Ok(event)
    }

    /// Reservations that reference the event keep the reference.
    pub async fn remove_calendar_event(&self, id: Ulid) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;
        if self.store.calendar_event(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }
        self.commit(vec![Event::CalendarEventRemoved { id }], &mut Default::default())
            .await
    }

    pub fn calendar_event_exists(&self, id: Ulid) -> bool {
        self.store.calendar_event(&id).is_some()
    }

    // ── Equipment ────────────────────────────────────────────

    pub async fn register_equipment(&self, mut new: NewEquipment) -> Result<EquipmentInfo, EngineError> {
        new.tag = normalized(new.tag);
        let mut violations = Vec::new();
        validate_name("name", &new.name, &mut violations);
        if new.category.len() > MAX_NAME_LEN {
            violations.push(Violation::TooLong("category"));
        }
        validate_tag(new.tag.as_deref(), &mut violations);

        let _exclusive = self.commit_gate.write().await;
        if self.store.contains_unit(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if self.store.unit_count() >= MAX_UNITS {
            return Err(EngineError::LimitExceeded("too many equipment units"));
        }
        self.check_tag_free(new.tag.as_deref(), TagOwner::Equipment(new.id), &mut violations);
        if !violations.is_empty() {
            return Err(EngineError::Validation(violations));
        }

        let info = EquipmentInfo {
            id: new.id,
            name: new.name,
            category: new.category,
            tag: new.tag,
            status: DisplayStatus::Available,
            active: true,
        };
        self.commit(
            vec![Event::EquipmentRegistered { unit: info.clone() }],
            &mut Default::default(),
        )
        .await?;
        tracing::info!(equipment = %info.id, name = %info.name, "equipment registered");
        Ok(info)
    }

    pub async fn update_equipment(&self, id: Ulid, mut patch: EquipmentPatch) -> Result<EquipmentInfo, EngineError> {
        patch.tag = patch.tag.map(normalized);
        let mut violations = Vec::new();
        if let Some(name) = &patch.name {
            validate_name("name", name, &mut violations);
        }
        if patch.category.as_ref().is_some_and(|c| c.len() > MAX_NAME_LEN) {
            violations.push(Violation::TooLong("category"));
        }
        if let Some(tag) = &patch.tag {
            validate_tag(tag.as_deref(), &mut violations);
        }

        let _exclusive = self.commit_gate.write().await;
        let (mut guards, missing) = self.lock_units(&BTreeSet::from([id])).await;
        if !missing.is_empty() {
            return Err(EngineError::NotFound(id));
        }
        let Some(unit) = guards.get(&id) else {
            return Err(EngineError::NotFound(id));
        };
        if let Some(tag) = &patch.tag {
            self.check_tag_free(tag.as_deref(), TagOwner::Equipment(id), &mut violations);
        }
        if !violations.is_empty() {
            return Err(EngineError::Validation(violations));
        }

        let mut info = unit.info();
        if let Some(name) = patch.name {
            info.name = name;
        }
        if let Some(category) = patch.category {
            info.category = category;
        }
        if let Some(tag) = patch.tag {
            info.tag = tag;
        }
        if let Some(active) = patch.active {
            info.active = active;
        }
        let event = Event::EquipmentUpdated {
            id,
            name: info.name.clone(),
            category: info.category.clone(),
            tag: info.tag.clone(),
            active: info.active,
        };
        self.commit(vec![event], &mut guards).await?;
        Ok(info)
    }

    /// Put a unit into maintenance, retire it, or bring it back into
    /// service. Back in service, the status is re-derived from the
    /// reservations active now.
    pub async fn set_equipment_condition(
        &self,
        id: Ulid,
        condition: ServiceCondition,
    ) -> Result<EquipmentInfo, EngineError> {
        let _gate = self.begin_write().await;
        let (mut guards, missing) = self.lock_units(&BTreeSet::from([id])).await;
        if !missing.is_empty() {
            return Err(EngineError::NotFound(id));
        }
        let Some(unit) = guards.get(&id) else {
            return Err(EngineError::NotFound(id));
        };

        let target = match condition {
            ServiceCondition::Maintenance => DisplayStatus::Maintenance,
            ServiceCondition::Retired => DisplayStatus::Retired,
            ServiceCondition::InService => occupancy(unit, now_ms()),
        };
        let mut info = unit.info();
        if info.status == target {
            return Ok(info);
        }
        let commit = match target {
            DisplayStatus::InUse => status_writes(&[id], &[]),
            DisplayStatus::Available => status_writes(&[], &[id]),
            manual => vec![Event::StatusChanged {
                ids: vec![id],
                status: manual,
            }],
        };
        self.commit(commit, &mut guards).await?;
        tracing::info!(equipment = %id, status = %target, "service condition changed");
        info.status = target;
        Ok(info)
    }

    /// Link a tag to a unit, typically one that showed up as pending.
    pub async fn assign_equipment_tag(&self, id: Ulid, tag: String) -> Result<EquipmentInfo, EngineError> {
        self.update_equipment(
            id,
            EquipmentPatch {
                tag: Some(Some(tag)),
                ..Default::default()
            },
        )
        .await
    }

    /// Link a tag to a user, typically one that showed up as pending.
    pub async fn assign_user_tag(&self, id: Ulid, tag: String) -> Result<User, EngineError> {
        let mut user = self.store.user(&id).ok_or(EngineError::NotFound(id))?;
        user.tag = Some(tag);
        self.upsert_user(user).await
    }

    /// Forget a pending tag without assigning it.
    pub async fn dismiss_pending_tag(&self, tag: &str) -> Result<(), EngineError> {
        let tag = normalize_tag(tag);
        let _gate = self.begin_write().await;
        if self.store.pending_tag(tag).is_none() {
            return Ok(());
        }
        self.commit(
            vec![Event::PendingTagCleared { tag: tag.to_string() }],
            &mut Default::default(),
        )
        .await
    }
}
