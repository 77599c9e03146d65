//! Event application: how likes, views and deactivations land in the store.

use commendable_core::codec::{encode_f64, encode_i64};
use commendable_core::{CoreError, Event, OrderedStore, RangeKey, ScanRange};
use time::{Duration, OffsetDateTime};

use crate::{changes, keys};

/// Nanoseconds since the Unix epoch, saturated to the `i64` range.
pub(crate) fn timestamp_nanos(at: OffsetDateTime) -> i64 {
    let nanos = at.unix_timestamp_nanos();
    i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX })
}

/// Apply one event at clock reading `now`.
///
/// Returns `true` when the event queued a recommendation refresh.
pub(crate) fn apply_event(
    store: &dyn OrderedStore,
    retention: Duration,
    event: &Event,
    now: OffsetDateTime,
) -> Result<bool, CoreError> {
    let stamp = encode_i64(timestamp_nanos(now));
    match event {
        Event::View { user, object } => {
            let views = keys::user_views(user);
            let actives = keys::active_objects();
            store.put(&actives, object.as_bytes(), &stamp)?;
            store.put(&views, object.as_bytes(), &stamp)?;
            sweep(store, &views, retention, now)?;
            sweep(store, &actives, retention, now)?;
            Ok(false)
        }
        Event::Like { user, object, weight, dont_activate } => {
            let actives = keys::active_objects();
            store.put(&keys::user_likes(user), object.as_bytes(), &encode_f64(*weight))?;
            store.put(&keys::object_likes(object), user.as_bytes(), &[])?;
            if !dont_activate {
                store.put(&actives, object.as_bytes(), &stamp)?;
            }
            sweep(store, &actives, retention, now)?;
            changes::push(store, now, user)?;
            Ok(true)
        }
        Event::Deactivate { object } => {
            store.delete(&keys::active_objects(), object.as_bytes())?;
            Ok(false)
        }
    }
}

/// Delete every entry of a timestamp-valued range stamped at or before
/// `now - retention`, walking the age-ordered mirror prefix.
fn sweep(
    store: &dyn OrderedStore,
    range: &RangeKey,
    retention: Duration,
    now: OffsetDateTime,
) -> Result<usize, CoreError> {
    let Some(cutoff) = now.checked_sub(retention) else {
        return Ok(0);
    };
    let expired =
        store.mirror_slice(range, &ScanRange::up_to(encode_i64(timestamp_nanos(cutoff)), true))?;
    for item in &expired {
        store.delete(range, &item.value)?;
    }
    if !expired.is_empty() {
        tracing::debug!(range = %range, expired = expired.len(), "swept expired entries");
    }
    Ok(expired.len())
}
