//! Two-hop collaborative filtering over the like graph.
//!
//! A user's candidates are the objects liked by their co-likers, each
//! co-liker weighted by `ln(1 + shared likes)`, minus what the user already
//! likes. The unfiltered result is materialized into the user's recommended
//! range. Reads subtract live likes and filters from it into a scratch range
//! and scan that mirror from the heaviest weight down.

use commendable_core::codec::decode_f64;
use commendable_core::{
    evaluate, evaluate_op, CoreError, FilterMode, Item, Merge, Message, OrderedStore, RangeKey,
    RecommendationsRequest, ScanRange, SetExpression, SetOp, SetOpKind, SetOpSource, SetResult,
};

use crate::keys;

/// Weight of a co-liker sharing `shared` liked objects with the target user.
#[must_use]
pub fn similarity_weight(shared: usize) -> f64 {
    f64::from(u32::try_from(shared).unwrap_or(u32::MAX)).ln_1p()
}

/// Build the candidate expression for `user`, or `None` when the user has no
/// co-likers.
pub(crate) fn candidate_expression(
    store: &dyn OrderedStore,
    user: &str,
) -> Result<Option<SetOp>, CoreError> {
    let own_likes = keys::user_likes(user);
    let liked = store.slice(&own_likes, &ScanRange::all())?;

    let mut likers = SetOp::new(SetOpKind::Union, Merge::First);
    for item in &liked {
        likers.push(SetOpSource::range(keys::object_likes(&String::from_utf8_lossy(&item.key))));
    }
    let co_likers = evaluate_op(store, &likers)?;

    let mut weighted = SetOp::new(SetOpKind::Union, Merge::FloatSum);
    for co_liker in &co_likers {
        if co_liker.key == user.as_bytes() {
            continue;
        }
        let their_likes = keys::user_likes(&String::from_utf8_lossy(&co_liker.key));
        let shared = SetOp::new(SetOpKind::Intersection, Merge::First)
            .with_source(SetOpSource::range(their_likes.clone()))
            .with_source(SetOpSource::range(own_likes.clone()));
        let shared = evaluate_op(store, &shared)?.len();
        if shared == 0 {
            continue;
        }
        weighted.push(SetOpSource::range(their_likes).weighted(similarity_weight(shared)));
    }

    if weighted.sources.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        SetOp::new(SetOpKind::Difference, Merge::First)
            .with_source(SetOpSource::op(weighted))
            .with_source(SetOpSource::range(own_likes)),
    ))
}

/// Recompute and materialize `user`'s recommended range. Returns the number
/// of candidates written.
pub(crate) fn refresh(store: &dyn OrderedStore, user: &str) -> Result<usize, CoreError> {
    let dest = keys::user_recommended(user);
    store.clear(&dest)?;
    let Some(op) = candidate_expression(store, user)? else {
        return Ok(0);
    };
    match evaluate(store, &SetExpression::new(op).into_dest(dest))? {
        SetResult::Materialized { written, .. } => Ok(written),
        SetResult::Items(items) => Ok(items.len()),
    }
}

/// Serve the top `request.num` recommendations, rebuilding the materialized
/// range inline when it is empty.
///
/// Every read subtracts the user's current likes, so objects liked since the
/// last refresh never come back, then applies the requested live filters.
pub(crate) fn read(
    store: &dyn OrderedStore,
    user: &str,
    request: &RecommendationsRequest,
) -> Result<Vec<Message>, CoreError> {
    let recommended = keys::user_recommended(user);
    if store.count(&recommended)? == 0 {
        let written = refresh(store, user)?;
        tracing::debug!(user, written, "rebuilt empty recommendations on read");
    }
    if request.num == 0 {
        return Ok(Vec::new());
    }

    let mut op = SetOp::new(SetOpKind::Difference, Merge::First)
        .with_source(SetOpSource::range(recommended))
        .with_source(SetOpSource::range(keys::user_likes(user)));
    for (mode, range) in
        [(request.actives, keys::active_objects()), (request.viewed, keys::user_views(user))]
    {
        op = apply_filter(op, mode, range);
    }

    let top = ScanRange::all().reversed().limit(request.num);
    let scratch = keys::scratch_recommended(user);
    let items = evaluate(store, &SetExpression::new(op).into_dest(scratch.clone()))
        .and_then(|_| store.mirror_slice(&scratch, &top));
    store.clear(&scratch)?;
    items?.into_iter().map(into_message).collect()
}

fn apply_filter(op: SetOp, mode: FilterMode, range: RangeKey) -> SetOp {
    match mode.op_kind() {
        Some(kind) => SetOp::new(kind, Merge::First)
            .with_source(SetOpSource::op(op))
            .with_source(SetOpSource::range(range)),
        None => op,
    }
}

fn into_message(item: Item) -> Result<Message, CoreError> {
    Ok(Message {
        object: String::from_utf8_lossy(&item.value).into_owned(),
        weight: Some(decode_f64(&item.key)?),
        ..Message::default()
    })
}
