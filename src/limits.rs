use crate::model::Ms;

/// Earliest accepted timestamp (Unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// 9999-12-31T23:59:59.999Z. Open-ended spans compare as ending here.
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

/// Units a single create call may reserve.
pub const MAX_BATCH_SIZE: usize = 64;

/// Items one loan session may hold in its cart.
pub const MAX_CART_ITEMS: usize = 100;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 4096;
pub const MAX_TAG_LEN: usize = 128;

/// Reservations kept per unit before create starts refusing.
pub const MAX_RESERVATIONS_PER_UNIT: usize = 100_000;

pub const MAX_UNITS: usize = 100_000;
