//! Range naming. Every range the engine touches is named here.

use commendable_core::RangeKey;

pub const ACTIVE_OBJECTS: &str = "COMMENDABLE_ACTIVE_OBJECTS";
pub const CHANGES: &str = "COMMENDABLE_CHANGES";

#[must_use]
pub fn active_objects() -> RangeKey {
    RangeKey::new(ACTIVE_OBJECTS)
}

#[must_use]
pub fn changes() -> RangeKey {
    RangeKey::new(CHANGES)
}

#[must_use]
pub fn user_likes(user: &str) -> RangeKey {
    RangeKey::new(format!("USER_{user}_LIKES"))
}

#[must_use]
pub fn user_views(user: &str) -> RangeKey {
    RangeKey::new(format!("USER_{user}_VIEWS"))
}

#[must_use]
pub fn user_recommended(user: &str) -> RangeKey {
    RangeKey::new(format!("USER_{user}_RECOMMENDED"))
}

/// A fresh range for one filtered read; the reader clears it afterwards.
#[must_use]
pub fn scratch_recommended(user: &str) -> RangeKey {
    RangeKey::new(format!("USER_{user}_RECOMMENDED_{}", ulid::Ulid::new()))
}

#[must_use]
pub fn object_likes(object: &str) -> RangeKey {
    RangeKey::new(format!("OBJECT_{object}_LIKES"))
}
