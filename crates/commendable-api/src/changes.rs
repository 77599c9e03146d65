//! The change queue: pending recommendation refreshes, oldest first.
//!
//! Keys are the encoded clock reading followed by a ULID so that repeated
//! likes by one user inside the same instant still queue separate entries.
//! Values are the user id.

use commendable_core::codec::encode_i64;
use commendable_core::{CoreError, OrderedStore, ScanRange};
use time::OffsetDateTime;

use crate::keys;
use crate::mutation::timestamp_nanos;

pub(crate) fn push(
    store: &dyn OrderedStore,
    now: OffsetDateTime,
    user: &str,
) -> Result<(), CoreError> {
    let mut key = encode_i64(timestamp_nanos(now)).to_vec();
    key.extend_from_slice(&ulid::Ulid::new().to_bytes());
    store.put(&keys::changes(), &key, user.as_bytes())
}

/// Remove and return the oldest queued user.
pub(crate) fn pop_oldest(store: &dyn OrderedStore) -> Result<Option<String>, CoreError> {
    let range = keys::changes();
    loop {
        let Some(oldest) = store.slice(&range, &ScanRange::all().limit(1))?.into_iter().next()
        else {
            return Ok(None);
        };
        // Lost a race with another consumer; take the next one.
        if !store.delete(&range, &oldest.key)? {
            continue;
        }
        return String::from_utf8(oldest.value)
            .map(Some)
            .map_err(|err| CoreError::Decode(format!("change queue user is not UTF-8: {err}")));
    }
}

pub(crate) fn pending(store: &dyn OrderedStore) -> Result<usize, CoreError> {
    store.count(&keys::changes())
}
