use std::collections::BTreeSet;

use serde::Deserialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    check_event, check_user, conflict_violation, find_conflict, now_ms, validate_notes, validate_range,
};
use super::status::{derived_status_replacing, status_writes};
use super::{Engine, EngineError, Violation};

/// A request to book one or more units for the same user and interval.
#[derive(Debug, Clone, Deserialize)]
pub struct NewReservation {
    pub equipment_ids: Vec<Ulid>,
    pub user_id: Ulid,
    #[serde(default)]
    pub event_id: Option<Ulid>,
    pub start: Ms,
    #[serde(default)]
    pub end: Option<Ms>,
    #[serde(default)]
    pub notes: Option<String>,
    /// Already authenticated by the caller; must be an active user.
    pub creator_id: Ulid,
}

/// Fields left `None` are unchanged. The unit of a reservation is fixed.
#[derive(Debug, Clone, Default)]
pub struct ReservationPatch {
    pub user_id: Option<Ulid>,
    pub event_id: Option<Option<Ulid>>,
    pub start: Option<Ms>,
    pub end: Option<Option<Ms>>,
    pub notes: Option<Option<String>>,
}

impl Engine {
    fn check_creator(&self, creator_id: Ulid) -> Result<(), EngineError> {
        match self.store.user(&creator_id) {
            Some(u) if u.active => Ok(()),
            _ => Err(EngineError::Unauthorized(creator_id)),
        }
    }

    /// Book every listed unit or none of them.
    ///
    /// All units are checked even after the first problem, so the error lists
    /// every violation. Units whose new reservation contains now flip to
    /// `in_use` in the same commit.
    pub async fn create_reservations(&self, req: NewReservation) -> Result<Vec<Reservation>, EngineError> {
        self.check_creator(req.creator_id)?;
        if req.equipment_ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("too many units in one reservation"));
        }

        let mut violations = Vec::new();
        if req.equipment_ids.is_empty() {
            violations.push(Violation::MissingField("equipment_ids"));
        }
        let mut unique = BTreeSet::new();
        for id in &req.equipment_ids {
            if !unique.insert(*id) {
                violations.push(Violation::DuplicateEquipment(*id));
            }
        }
        let span = validate_range(req.start, req.end, &mut violations);
        validate_notes(req.notes.as_deref(), &mut violations);
        check_user(&self.store, req.user_id, &mut violations);
        check_event(&self.store, req.event_id, &mut violations);

        let _gate = self.begin_write().await;
        let (mut guards, missing) = self.lock_units(&unique).await;
        violations.extend(missing.into_iter().map(Violation::UnknownEquipment));

        let mut at_capacity = false;
        for id in &unique {
            let Some(unit) = guards.get(id) else {
                continue;
            };
            if !unit.active {
                violations.push(Violation::InactiveEquipment(*id));
                continue;
            }
            if unit.reservations.len() >= MAX_RESERVATIONS_PER_UNIT {
                at_capacity = true;
            }
            if let Some(span) = &span
                && let Some(existing) = find_conflict(unit, span, None)
            {
                violations.push(conflict_violation(&self.store, existing));
            }
        }

        let span = match span {
            Some(span) if violations.is_empty() => span,
            _ => {
                let conflicts = violations
                    .iter()
                    .filter(|v| matches!(v, Violation::Conflict { .. }))
                    .count();
                if conflicts > 0 {
                    metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL)
                        .increment(conflicts as u64);
                }
                tracing::debug!(violations = violations.len(), "reservation rejected");
                return Err(EngineError::Validation(violations));
            }
        };
        if at_capacity {
            return Err(EngineError::LimitExceeded("too many reservations on unit"));
        }

        let now = now_ms();
        let reservations: Vec<Reservation> = req
            .equipment_ids
            .iter()
            .map(|equipment_id| Reservation {
                id: Ulid::new(),
                equipment_id: *equipment_id,
                user_id: req.user_id,
                event_id: req.event_id,
                span,
                notes: req.notes.clone(),
                creator_id: req.creator_id,
                created_at: now,
            })
            .collect();

        let to_in_use: Vec<Ulid> = if span.contains_instant(now) {
            guards
                .values()
                .filter(|u| u.status == DisplayStatus::Available)
                .map(|u| u.id)
                .collect()
        } else {
            Vec::new()
        };

        let mut commit: Vec<Event> = reservations
            .iter()
            .cloned()
            .map(|reservation| Event::ReservationCreated { reservation })
            .collect();
        commit.extend(status_writes(&to_in_use, &[]));
        self.commit(commit, &mut guards).await?;

        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL)
            .increment(reservations.len() as u64);
        tracing::info!(
            user = %req.user_id,
            units = reservations.len(),
            span = %span,
            "reservations created"
        );
        Ok(reservations)
    }

    /// Change user, event, interval or notes. A changed interval is checked
    /// against the unit's other reservations and the unit's status is
    /// recomputed in the same commit.
    pub async fn update_reservation(&self, id: Ulid, patch: ReservationPatch) -> Result<Reservation, EngineError> {
        let _gate = self.begin_write().await;
        let (equipment_id, mut guards) = self.lock_reservation(id).await?;
        let Some(unit) = guards.get(&equipment_id) else {
            return Err(EngineError::NotFound(id));
        };
        let Some(current) = unit.reservation(id).cloned() else {
            return Err(EngineError::NotFound(id));
        };

        let mut violations = Vec::new();
        let mut updated = current.clone();
        if let Some(user_id) = patch.user_id
            && user_id != current.user_id
        {
            check_user(&self.store, user_id, &mut violations);
            updated.user_id = user_id;
        }
        if let Some(event_id) = patch.event_id
            && event_id != current.event_id
        {
            check_event(&self.store, event_id, &mut violations);
            updated.event_id = event_id;
        }
        if let Some(notes) = patch.notes {
            validate_notes(notes.as_deref(), &mut violations);
            updated.notes = notes;
        }

        let start = patch.start.unwrap_or(current.span.start);
        let end = patch.end.unwrap_or(current.span.end);
        if (start, end) != (current.span.start, current.span.end)
            && let Some(span) = validate_range(start, end, &mut violations)
        {
            if let Some(existing) = find_conflict(unit, &span, Some(id)) {
                metrics::counter!(crate::observability::RESERVATION_CONFLICTS_TOTAL).increment(1);
                violations.push(conflict_violation(&self.store, existing));
            }
            updated.span = span;
        }

        if !violations.is_empty() {
            return Err(EngineError::Validation(violations));
        }

        let now = now_ms();
        let mut commit = vec![Event::ReservationUpdated {
            reservation: updated.clone(),
        }];
        match derived_status_replacing(unit, now, id, Some(updated.span)) {
            Some(DisplayStatus::InUse) if unit.status != DisplayStatus::InUse => {
                commit.extend(status_writes(&[equipment_id], &[]))
            }
            Some(DisplayStatus::Available) if unit.status != DisplayStatus::Available => {
                commit.extend(status_writes(&[], &[equipment_id]))
            }
            _ => {}
        }
        self.commit(commit, &mut guards).await?;
        Ok(updated)
    }

    /// Close an ongoing reservation at now. The unit goes back to
    /// `available` unless another of its reservations is still active.
    pub async fn return_equipment(&self, id: Ulid, notes: Option<String>) -> Result<Reservation, EngineError> {
        let _gate = self.begin_write().await;
        let (equipment_id, mut guards) = self.lock_reservation(id).await?;
        let Some(unit) = guards.get(&equipment_id) else {
            return Err(EngineError::NotFound(id));
        };
        let Some(mut reservation) = unit.reservation(id).cloned() else {
            return Err(EngineError::NotFound(id));
        };

        let now = now_ms();
        let mut violations = Vec::new();
        if reservation.span.end.is_some() {
            violations.push(Violation::AlreadyReturned(id));
        } else if now <= reservation.span.start {
            violations.push(Violation::NotStarted(id));
        }
        validate_notes(notes.as_deref(), &mut violations);
        if !violations.is_empty() {
            return Err(EngineError::Validation(violations));
        }

        let mut commit = vec![Event::ReservationReturned {
            id,
            equipment_id,
            returned_at: now,
            notes: notes.clone(),
        }];
        if unit.status == DisplayStatus::InUse && !unit.has_active_at_except(now, id) {
            commit.extend(status_writes(&[], &[equipment_id]));
        }
        self.commit(commit, &mut guards).await?;

        reservation.span.end = Some(now);
        if notes.is_some() {
            reservation.notes = notes;
        }
        tracing::info!(reservation = %id, equipment = %equipment_id, "equipment returned");
        Ok(reservation)
    }

    /// Remove a reservation outright. If it was active and nothing else on
    /// the unit is, the unit flips to `available` in the same commit.
    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let _gate = self.begin_write().await;
        let (equipment_id, mut guards) = self.lock_reservation(id).await?;
        let Some(unit) = guards.get(&equipment_id) else {
            return Err(EngineError::NotFound(id));
        };
        let Some(reservation) = unit.reservation(id).cloned() else {
            return Err(EngineError::NotFound(id));
        };

        let now = now_ms();
        let was_active = reservation.span.contains_instant(now);
        let mut commit = vec![Event::ReservationDeleted { id, equipment_id }];
        if was_active && unit.status == DisplayStatus::InUse && !unit.has_active_at_except(now, id) {
            commit.extend(status_writes(&[], &[equipment_id]));
        }
        self.commit(commit, &mut guards).await?;
        Ok(reservation)
    }
}
