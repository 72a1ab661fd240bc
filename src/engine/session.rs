//! Loan session machine.
//!
//! One session slot for the whole kiosk: `Idle`, or `Open` for one user with
//! a cart of units. Scans drive it; there is no background timer, an open
//! session that has been quiet for longer than the timeout is simply treated
//! as `Idle` the next time anything looks at it.
//!
//! The state transition itself is the pure [`transition`] function; the
//! engine resolves tags before it and performs the usage-log commit after.

use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{normalize_tag, now_ms};
use super::store::TagOwner;
use super::{Engine, EngineError, Violation};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartItem {
    pub equipment_id: Ulid,
    pub name: String,
}

/// The live session. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoanSession {
    pub session_id: Ulid,
    pub user_id: Ulid,
    pub user_name: String,
    /// In scan order.
    pub items: Vec<CartItem>,
    pub opened_at: Ms,
    pub last_activity_at: Ms,
}

impl LoanSession {
    fn expired(&self, now: Ms, timeout_ms: Ms) -> bool {
        now - self.last_activity_at > timeout_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) enum SessionState {
    #[default]
    Idle,
    Open(LoanSession),
}

/// What `current_session` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub session: LoanSession,
    pub expires_at: Ms,
}

/// Response to one scan. Serialized with a `kind` tag for the kiosk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanOutcome {
    SessionOpened {
        session_id: Ulid,
        user_id: Ulid,
        user_name: String,
        items: Vec<CartItem>,
        count: usize,
    },
    /// Closed with an empty cart; nothing recorded.
    SessionClosed {
        session_id: Ulid,
        user_id: Ulid,
        user_name: String,
    },
    LogCreated {
        log_id: Ulid,
        session_id: Ulid,
        user_id: Ulid,
        user_name: String,
        items: Vec<CartItem>,
        count: usize,
    },
    SessionBusy {
        holder_id: Ulid,
        holder_name: String,
        requested_by_id: Ulid,
        requested_by_name: String,
    },
    NoSession {
        equipment_id: Ulid,
        equipment_name: String,
    },
    EquipmentAdded {
        user_name: String,
        item: CartItem,
        items: Vec<CartItem>,
        count: usize,
    },
    EquipmentRemoved {
        user_name: String,
        item: CartItem,
        items: Vec<CartItem>,
        count: usize,
    },
    Pending {
        tag: String,
        seen_count: u32,
        first_seen_at: Ms,
        last_seen_at: Ms,
    },
}

/// A scanned tag after lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scan {
    Badge { user_id: Ulid, name: String },
    Equipment { equipment_id: Ulid, name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    Respond(ScanOutcome),
    /// Owner closed a non-empty cart. Becomes `LogCreated` once the usage log
    /// is durable; until then the session stays open.
    CommitLog(LoanSession),
    CartFull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Transition {
    pub next: SessionState,
    pub effect: Effect,
    /// The session that timed out before this scan was handled, if any.
    pub expired: Option<LoanSession>,
}

pub(crate) fn transition(state: &SessionState, scan: Scan, now: Ms, timeout_ms: Ms) -> Transition {
    let (current, expired) = match state {
        SessionState::Open(s) if s.expired(now, timeout_ms) => (None, Some(s.clone())),
        SessionState::Open(s) => (Some(s), None),
        SessionState::Idle => (None, None),
    };

    let (next, effect) = match (current, scan) {
        (None, Scan::Badge { user_id, name }) => {
            let session = LoanSession {
                session_id: Ulid::new(),
                user_id,
                user_name: name,
                items: Vec::new(),
                opened_at: now,
                last_activity_at: now,
            };
            let outcome = ScanOutcome::SessionOpened {
                session_id: session.session_id,
                user_id,
                user_name: session.user_name.clone(),
                items: Vec::new(),
                count: 0,
            };
            (SessionState::Open(session), Effect::Respond(outcome))
        }
        (None, Scan::Equipment { equipment_id, name }) => (
            SessionState::Idle,
            Effect::Respond(ScanOutcome::NoSession {
                equipment_id,
                equipment_name: name,
            }),
        ),
        (Some(s), Scan::Badge { user_id, .. }) if user_id == s.user_id => {
            if s.items.is_empty() {
                let outcome = ScanOutcome::SessionClosed {
                    session_id: s.session_id,
                    user_id,
                    user_name: s.user_name.clone(),
                };
                (SessionState::Idle, Effect::Respond(outcome))
            } else {
                (SessionState::Idle, Effect::CommitLog(s.clone()))
            }
        }
        (Some(s), Scan::Badge { user_id, name }) => (
            SessionState::Open(s.clone()),
            Effect::Respond(ScanOutcome::SessionBusy {
                holder_id: s.user_id,
                holder_name: s.user_name.clone(),
                requested_by_id: user_id,
                requested_by_name: name,
            }),
        ),
        (Some(s), Scan::Equipment { equipment_id, name }) => {
            let mut session = s.clone();
            let item = CartItem { equipment_id, name };
            if let Some(pos) = session.items.iter().position(|i| i.equipment_id == equipment_id) {
                session.items.remove(pos);
                session.last_activity_at = now;
                let outcome = ScanOutcome::EquipmentRemoved {
                    user_name: session.user_name.clone(),
                    item,
                    items: session.items.clone(),
                    count: session.items.len(),
                };
                (SessionState::Open(session), Effect::Respond(outcome))
            } else if session.items.len() >= MAX_CART_ITEMS {
                (SessionState::Open(s.clone()), Effect::CartFull)
            } else {
                session.items.push(item.clone());
                session.last_activity_at = now;
                let outcome = ScanOutcome::EquipmentAdded {
                    user_name: session.user_name.clone(),
                    item,
                    items: session.items.clone(),
                    count: session.items.len(),
                };
                (SessionState::Open(session), Effect::Respond(outcome))
            }
        }
    };

    Transition { next, effect, expired }
}

impl Engine {
    /// Handle one tag scan from the kiosk reader.
    pub async fn scan(&self, tag: &str) -> Result<ScanOutcome, EngineError> {
        self.scan_at(tag, now_ms()).await
    }

    pub async fn scan_at(&self, tag: &str, now: Ms) -> Result<ScanOutcome, EngineError> {
        let tag = normalize_tag(tag);
        if tag.is_empty() {
            return Err(EngineError::invalid(Violation::MissingField("tag")));
        }
        if tag.len() > MAX_TAG_LEN {
            return Err(EngineError::invalid(Violation::TooLong("tag")));
        }

        // One scan at a time, system wide, including the usage-log commit.
        let mut slot = self.session.lock().await;

        let scan = match self.store.tag_owner(tag) {
            Some(TagOwner::User(id)) => match self.store.user(&id) {
                Some(user) if user.active => Scan::Badge {
                    user_id: id,
                    name: user.name,
                },
                Some(_) => return Err(EngineError::invalid(Violation::InactiveUser(id))),
                None => return Err(EngineError::invalid(Violation::UnknownUser(id))),
            },
            Some(TagOwner::Equipment(id)) => {
                let unit = self
                    .store
                    .unit(&id)
                    .ok_or(EngineError::invalid(Violation::UnknownEquipment(id)))?;
                let unit = unit.read().await;
                if !unit.active {
                    return Err(EngineError::invalid(Violation::InactiveEquipment(id)));
                }
                Scan::Equipment {
                    equipment_id: id,
                    name: unit.name.clone(),
                }
            }
            None => {
                let outcome = self.record_pending_tag(tag, now).await?;
                metrics::counter!(crate::observability::SCANS_TOTAL, "outcome" => "pending").increment(1);
                return Ok(outcome);
            }
        };

        let Transition { next, effect, expired } = transition(&slot, scan, now, self.session_timeout_ms);
        if let Some(old) = &expired {
            metrics::counter!(crate::observability::SESSIONS_EXPIRED_TOTAL).increment(1);
            tracing::info!(
                session = %old.session_id,
                user = %old.user_name,
                items = old.items.len(),
                "loan session expired"
            );
        }

        let outcome = match effect {
            Effect::Respond(outcome) => {
                *slot = next;
                outcome
            }
            Effect::CartFull => return Err(EngineError::LimitExceeded("cart is full")),
            Effect::CommitLog(session) => {
                let log = UsageLog {
                    id: Ulid::new(),
                    session_id: session.session_id,
                    user_id: session.user_id,
                    committed_at: now,
                    equipment_ids: session.items.iter().map(|i| i.equipment_id).collect(),
                };
                {
                    let _gate = self.begin_write().await;
                    self.commit(vec![Event::UsageLogged { log: log.clone() }], &mut Default::default())
                        .await?;
                }
                *slot = next;
                tracing::info!(
                    session = %session.session_id,
                    user = %session.user_name,
                    items = log.equipment_ids.len(),
                    "usage log created"
                );
                ScanOutcome::LogCreated {
                    log_id: log.id,
                    session_id: session.session_id,
                    user_id: session.user_id,
                    user_name: session.user_name,
                    count: session.items.len(),
                    items: session.items,
                }
            }
        };

        match &outcome {
            ScanOutcome::SessionOpened { session_id, user_name, .. } => {
                tracing::info!(session = %session_id, user = %user_name, "loan session opened")
            }
            ScanOutcome::SessionClosed { session_id, .. } => {
                tracing::info!(session = %session_id, "loan session closed empty")
            }
            ScanOutcome::SessionBusy {
                holder_name,
                requested_by_name,
                ..
            } => tracing::debug!(holder = %holder_name, requested_by = %requested_by_name, "kiosk busy"),
            _ => {}
        }
        metrics::counter!(
            crate::observability::SCANS_TOTAL,
            "outcome" => crate::observability::outcome_label(&outcome)
        )
        .increment(1);
        Ok(outcome)
    }

    async fn record_pending_tag(&self, tag: &str, now: Ms) -> Result<ScanOutcome, EngineError> {
        let _gate = self.begin_write().await;
        let pending = match self.store.pending_tag(tag) {
            Some(mut p) => {
                p.last_seen_at = now;
                p.seen_count = p.seen_count.saturating_add(1);
                p
            }
            None => PendingTag {
                tag: tag.to_string(),
                first_seen_at: now,
                last_seen_at: now,
                seen_count: 1,
            },
        };
        self.commit(
            vec![Event::PendingTagRecorded {
                pending: pending.clone(),
            }],
            &mut Default::default(),
        )
        .await?;
        tracing::debug!(tag, seen = pending.seen_count, "unrecognized tag");
        Ok(ScanOutcome::Pending {
            tag: pending.tag,
            seen_count: pending.seen_count,
            first_seen_at: pending.first_seen_at,
            last_seen_at: pending.last_seen_at,
        })
    }

    /// The live session, if one is open and has not timed out.
    pub async fn current_session(&self) -> Option<SessionView> {
        self.current_session_at(now_ms()).await
    }

    pub async fn current_session_at(&self, now: Ms) -> Option<SessionView> {
        match &*self.session.lock().await {
            SessionState::Open(s) if !s.expired(now, self.session_timeout_ms) => Some(SessionView {
                session: s.clone(),
                expires_at: s.last_activity_at + self.session_timeout_ms,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Ms = 180_000;

    fn badge(user_id: Ulid, name: &str) -> Scan {
        Scan::Badge {
            user_id,
            name: name.into(),
        }
    }

    fn equipment(equipment_id: Ulid, name: &str) -> Scan {
        Scan::Equipment {
            equipment_id,
            name: name.into(),
        }
    }

    /// Apply a transition that is expected to respond, returning the outcome.
    fn step(state: &mut SessionState, scan: Scan, now: Ms) -> ScanOutcome {
        let t = transition(state, scan, now, TIMEOUT);
        *state = t.next;
        match t.effect {
            Effect::Respond(outcome) => outcome,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    #[test]
    fn toggle_then_close_empty() {
        let u1 = Ulid::new();
        let a = Ulid::new();
        let mut state = SessionState::Idle;

        assert!(matches!(
            step(&mut state, badge(u1, "Ana"), 0),
            ScanOutcome::SessionOpened { count: 0, .. }
        ));
        match step(&mut state, equipment(a, "Camera A"), 10) {
            ScanOutcome::EquipmentAdded { items, count, .. } => {
                assert_eq!(count, 1);
                assert_eq!(items[0].equipment_id, a);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            step(&mut state, equipment(a, "Camera A"), 20),
            ScanOutcome::EquipmentRemoved { count: 0, .. }
        ));
        assert!(matches!(
            step(&mut state, badge(u1, "Ana"), 30),
            ScanOutcome::SessionClosed { .. }
        ));
        assert_eq!(state, SessionState::Idle);
    }

    #[test]
    fn closing_a_full_cart_asks_for_a_commit() {
        let u1 = Ulid::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut state = SessionState::Idle;
        step(&mut state, badge(u1, "Ana"), 0);
        step(&mut state, equipment(a, "Camera A"), 1);
        step(&mut state, equipment(b, "Tripod B"), 2);

        let t = transition(&state, badge(u1, "Ana"), 3, TIMEOUT);
        assert_eq!(t.next, SessionState::Idle);
        match t.effect {
            Effect::CommitLog(session) => {
                let ids: Vec<Ulid> = session.items.iter().map(|i| i.equipment_id).collect();
                assert_eq!(ids, vec![a, b]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn second_badge_is_busy_and_state_unchanged() {
        let (u1, u2) = (Ulid::new(), Ulid::new());
        let mut state = SessionState::Idle;
        step(&mut state, badge(u1, "Ana"), 0);
        let before = state.clone();

        match step(&mut state, badge(u2, "Ben"), 5) {
            ScanOutcome::SessionBusy {
                holder_id,
                holder_name,
                requested_by_id,
                ..
            } => {
                assert_eq!(holder_id, u1);
                assert_eq!(holder_name, "Ana");
                assert_eq!(requested_by_id, u2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(state, before);
    }

    #[test]
    fn expired_session_reopens_instead_of_closing() {
        let u1 = Ulid::new();
        let mut state = SessionState::Idle;
        step(&mut state, badge(u1, "Ana"), 0);
        step(&mut state, equipment(Ulid::new(), "Mic"), 1_000);

        // Exactly at the timeout the session is still live.
        let live = transition(&state, badge(Ulid::new(), "Ben"), 1_000 + TIMEOUT, TIMEOUT);
        assert!(live.expired.is_none());

        let t = transition(&state, badge(u1, "Ana"), 1_001 + TIMEOUT, TIMEOUT);
        assert!(t.expired.is_some());
        assert!(matches!(t.effect, Effect::Respond(ScanOutcome::SessionOpened { count: 0, .. })));
    }

    #[test]
    fn equipment_without_session() {
        let mut state = SessionState::Idle;
        assert!(matches!(
            step(&mut state, equipment(Ulid::new(), "Mic"), 0),
            ScanOutcome::NoSession { .. }
        ));
        assert_eq!(state, SessionState::Idle);
    }

    #[test]
    fn cart_is_capped() {
        let u1 = Ulid::new();
        let mut state = SessionState::Idle;
        step(&mut state, badge(u1, "Ana"), 0);
        for i in 0..MAX_CART_ITEMS {
            step(&mut state, equipment(Ulid::new(), "Cable"), i as Ms);
        }
        let t = transition(&state, equipment(Ulid::new(), "Cable"), 500, TIMEOUT);
        assert_eq!(t.effect, Effect::CartFull);
        assert_eq!(t.next, state);
    }

    #[test]
    fn outcome_serializes_with_kind_tag() {
        let json = serde_json::to_value(ScanOutcome::NoSession {
            equipment_id: Ulid::nil(),
            equipment_name: "Mic".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "no_session");
        assert_eq!(json["equipment_name"], "Mic");
    }
}
