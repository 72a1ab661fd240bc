use std::collections::BTreeSet;

use ulid::Ulid;

use crate::model::*;

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// The one recomputation rule for the cached status.
///
/// Returns `None` for maintenance/retired units, which are never recomputed;
/// otherwise `InUse` iff some reservation contains `now`.
pub fn derived_status(unit: &EquipmentState, now: Ms) -> Option<DisplayStatus> {
    unit.status.is_derived().then(|| occupancy(unit, now))
}

/// What the reservations alone say, ignoring maintenance/retired.
pub(super) fn occupancy(unit: &EquipmentState, now: Ms) -> DisplayStatus {
    if unit.active_at(now).next().is_some() {
        DisplayStatus::InUse
    } else {
        DisplayStatus::Available
    }
}

/// `derived_status` as it will be once reservation `replaced` carries
/// `replacement` (or is gone, for `None`).
pub(super) fn derived_status_replacing(
    unit: &EquipmentState,
    now: Ms,
    replaced: Ulid,
    replacement: Option<Span>,
) -> Option<DisplayStatus> {
    if !unit.status.is_derived() {
        return None;
    }
    let active = unit.has_active_at_except(now, replaced)
        || replacement.is_some_and(|span| span.contains_instant(now));
    if active {
        Some(DisplayStatus::InUse)
    } else {
        Some(DisplayStatus::Available)
    }
}

/// `StatusChanged` events for whichever of the two groups are non-empty.
pub(super) fn status_writes(to_in_use: &[Ulid], to_available: &[Ulid]) -> Vec<Event> {
    let mut events = Vec::with_capacity(2);
    if !to_in_use.is_empty() {
        events.push(Event::StatusChanged {
            ids: to_in_use.to_vec(),
            status: DisplayStatus::InUse,
        });
    }
    if !to_available.is_empty() {
        events.push(Event::StatusChanged {
            ids: to_available.to_vec(),
            status: DisplayStatus::Available,
        });
    }
    events
}

impl Engine {
    pub async fn sync_status(&self) -> Result<SyncReport, EngineError> {
        self.sync_status_at(now_ms()).await
    }

    /// Bring every derived status in line with the reservations active at
    /// `now`. Stale units are written in at most two batched status writes,
    /// both in one commit. Nothing stale means nothing written.
    pub async fn sync_status_at(&self, now: Ms) -> Result<SyncReport, EngineError> {
        // Cheap read pass first so an in-sync fleet takes no write locks.
        let mut stale = BTreeSet::new();
        for id in self.store.unit_ids() {
            let Some(unit) = self.store.unit(&id) else {
                continue;
            };
            let guard = unit.read().await;
            if derived_status(&guard, now).is_some_and(|s| s != guard.status) {
                stale.insert(id);
            }
        }
        if stale.is_empty() {
            return Ok(SyncReport::default());
        }

        let _gate = self.begin_write().await;
        let (mut guards, _) = self.lock_units(&stale).await;

        // Re-derive under the write locks; another writer may have fixed some.
        let mut report = SyncReport::default();
        for (id, unit) in &guards {
            match derived_status(unit, now) {
                Some(DisplayStatus::InUse) if unit.status != DisplayStatus::InUse => {
                    report.to_in_use.push(*id)
                }
                Some(DisplayStatus::Available) if unit.status != DisplayStatus::Available => {
                    report.to_available.push(*id)
                }
                _ => {}
            }
        }

        let commit = status_writes(&report.to_in_use, &report.to_available);
        self.commit(commit, &mut guards).await?;

        if report.writes() > 0 {
            metrics::counter!(crate::observability::STATUS_WRITES_TOTAL).increment(report.writes() as u64);
            tracing::debug!(
                in_use = report.to_in_use.len(),
                available = report.to_available.len(),
                "status sync"
            );
        }
        Ok(report)
    }
}
