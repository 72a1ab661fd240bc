use std::fmt;

use ulid::Ulid;

use crate::model::{Ms, Span};

/// One reason a request was refused. Validation errors carry every
/// violation found, not just the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    MissingField(&'static str),
    InvalidRange { start: Ms, end: Ms },
    TimestampOutOfRange(Ms),
    TooLong(&'static str),
    UnknownUser(Ulid),
    InactiveUser(Ulid),
    UnknownEvent(Ulid),
    UnknownEquipment(Ulid),
    InactiveEquipment(Ulid),
    DuplicateEquipment(Ulid),
    TagInUse(String),
    Conflict {
        equipment_id: Ulid,
        reservation_id: Ulid,
        holder: String,
        span: Span,
    },
    AlreadyReturned(Ulid),
    NotStarted(Ulid),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::MissingField(field) => write!(f, "{field} is required"),
            Violation::InvalidRange { start, end } => {
                write!(f, "end ({end}) must be after start ({start})")
            }
            Violation::TimestampOutOfRange(t) => write!(f, "timestamp {t} out of range"),
            Violation::TooLong(field) => write!(f, "{field} too long"),
            Violation::UnknownUser(id) => write!(f, "user {id} does not exist"),
            Violation::InactiveUser(id) => write!(f, "user {id} is inactive"),
            Violation::UnknownEvent(id) => write!(f, "event {id} does not exist"),
            Violation::UnknownEquipment(id) => write!(f, "equipment {id} does not exist"),
            Violation::InactiveEquipment(id) => write!(f, "equipment {id} is inactive"),
            Violation::DuplicateEquipment(id) => {
                write!(f, "equipment {id} listed more than once")
            }
            Violation::TagInUse(tag) => write!(f, "tag {tag} is already assigned"),
            Violation::Conflict {
                equipment_id,
                holder,
                span,
                ..
            } => write!(f, "equipment {equipment_id} is reserved by {holder} ({span})"),
            Violation::AlreadyReturned(id) => write!(f, "reservation {id} was already returned"),
            Violation::NotStarted(id) => {
                write!(f, "reservation {id} has not started; delete it instead")
            }
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    Validation(Vec<Violation>),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The caller identity handed in by the surrounding layer is not an active user.
    Unauthorized(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn invalid(violation: Violation) -> Self {
        EngineError::Validation(vec![violation])
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            EngineError::Validation(v) => v,
            _ => &[],
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(violations) => {
                write!(f, "validation failed: ")?;
                for (i, v) in violations.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{v}")?;
                }
                Ok(())
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Unauthorized(id) => write!(f, "caller {id} is not authorized"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
