//! Set algebra over store ranges.
//!
//! A [`SetExpression`] is an immutable tree whose leaves are ranges and whose
//! inner nodes combine their sources by union, intersection or difference.
//! Evaluation only reads sources; the only write is the optional destination.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use crate::codec::{decode_f64, encode_f64};
use crate::store::{Item, OrderedStore, RangeKey, ScanRange};
use crate::CoreError;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SetOpKind {
    Union,
    Intersection,
    Difference,
}

impl SetOpKind {
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Union => "U",
            Self::Intersection => "I",
            Self::Difference => "D",
        }
    }

    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "U" => Some(Self::Union),
            "I" => Some(Self::Intersection),
            "D" => Some(Self::Difference),
            _ => None,
        }
    }
}

/// How values of one key coming from several sources collapse into one.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Hash)]
pub enum Merge {
    /// The value of the first source, in source order, that has the key.
    #[default]
    First,
    /// Sum of every contributing value decoded as a float and scaled by its
    /// source weight.
    FloatSum,
}

impl Merge {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::First => "First",
            Self::FloatSum => "FloatSum",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "First" => Some(Self::First),
            "FloatSum" => Some(Self::FloatSum),
            _ => None,
        }
    }

    fn apply(self, contributions: &[(f64, Vec<u8>)]) -> Result<Vec<u8>, CoreError> {
        match self {
            Self::First => {
                Ok(contributions.first().map(|(_, value)| value.clone()).unwrap_or_default())
            }
            Self::FloatSum => {
                let mut sum = 0.0;
                for (weight, value) in contributions {
                    sum += decode_f64(value)? * weight;
                }
                Ok(encode_f64(sum).to_vec())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetNode {
    Range(RangeKey),
    Op(SetOp),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetOpSource {
    pub node: SetNode,
    pub weight: Option<f64>,
}

impl SetOpSource {
    #[must_use]
    pub fn range(key: RangeKey) -> Self {
        Self { node: SetNode::Range(key), weight: None }
    }

    #[must_use]
    pub fn op(op: SetOp) -> Self {
        Self { node: SetNode::Op(op), weight: None }
    }

    #[must_use]
    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }

    fn scale(&self) -> f64 {
        self.weight.unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetOp {
    pub kind: SetOpKind,
    pub merge: Merge,
    pub sources: Vec<SetOpSource>,
}

impl SetOp {
    #[must_use]
    pub fn new(kind: SetOpKind, merge: Merge) -> Self {
        Self { kind, merge, sources: Vec::new() }
    }

    #[must_use]
    pub fn with_source(mut self, source: SetOpSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn push(&mut self, source: SetOpSource) {
        self.sources.push(source);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetExpression {
    pub op: SetOp,
    pub dest: Option<RangeKey>,
}

impl SetExpression {
    #[must_use]
    pub fn new(op: SetOp) -> Self {
        Self { op, dest: None }
    }

    #[must_use]
    pub fn into_dest(mut self, dest: RangeKey) -> Self {
        self.dest = Some(dest);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SetResult {
    Items(Vec<Item>),
    Materialized { dest: RangeKey, written: usize },
}

/// Evaluate an expression, writing into its destination when one is set.
///
/// # Errors
/// Returns [`CoreError::Store`] when a source scan or destination write fails,
/// and [`CoreError::Decode`] when a `FloatSum` merge meets a non-numeric value.
pub fn evaluate<S>(store: &S, expression: &SetExpression) -> Result<SetResult, CoreError>
where
    S: OrderedStore + ?Sized,
{
    let items = evaluate_op(store, &expression.op)?;
    tracing::debug!(expression = %expression, items = items.len(), "evaluated set expression");

    let Some(dest) = &expression.dest else {
        return Ok(SetResult::Items(items));
    };
    for item in &items {
        store.put(dest, &item.key, &item.value)?;
    }
    Ok(SetResult::Materialized { dest: dest.clone(), written: items.len() })
}

/// Evaluate one operation node to an ordered sequence of merged entries.
///
/// # Errors
/// See [`evaluate`].
pub fn evaluate_op<S>(store: &S, op: &SetOp) -> Result<Vec<Item>, CoreError>
where
    S: OrderedStore + ?Sized,
{
    let mut inputs = Vec::with_capacity(op.sources.len());
    for source in &op.sources {
        let items = match &source.node {
            SetNode::Range(range) => store.slice(range, &ScanRange::all())?,
            SetNode::Op(nested) => evaluate_op(store, nested)?,
        };
        inputs.push((source.scale(), items));
    }

    match op.kind {
        SetOpKind::Union => union(op.merge, inputs),
        SetOpKind::Intersection => intersection(op.merge, inputs),
        SetOpKind::Difference => difference(op.merge, inputs),
    }
}

fn union(merge: Merge, inputs: Vec<(f64, Vec<Item>)>) -> Result<Vec<Item>, CoreError> {
    let mut grouped: BTreeMap<Vec<u8>, Vec<(f64, Vec<u8>)>> = BTreeMap::new();
    for (scale, items) in inputs {
        for item in items {
            grouped.entry(item.key).or_default().push((scale, item.value));
        }
    }

    grouped
        .into_iter()
        .map(|(key, contributions)| Ok(Item { key, value: merge.apply(&contributions)? }))
        .collect()
}

fn intersection(merge: Merge, inputs: Vec<(f64, Vec<Item>)>) -> Result<Vec<Item>, CoreError> {
    let Some(((first_scale, first), rest)) = inputs.split_first() else {
        return Ok(Vec::new());
    };

    let mut result = Vec::new();
    'candidates: for candidate in first {
        let mut contributions = vec![(*first_scale, candidate.value.clone())];
        for (scale, items) in rest {
            let Some(found) = find(items, &candidate.key) else {
                continue 'candidates;
            };
            contributions.push((*scale, found.value.clone()));
        }
        result.push(Item { key: candidate.key.clone(), value: merge.apply(&contributions)? });
    }
    Ok(result)
}

fn difference(merge: Merge, inputs: Vec<(f64, Vec<Item>)>) -> Result<Vec<Item>, CoreError> {
    let mut inputs = inputs.into_iter();
    let Some((first_scale, first)) = inputs.next() else {
        return Ok(Vec::new());
    };
    let rest = inputs.map(|(_, items)| items).collect::<Vec<_>>();

    let mut result = Vec::new();
    for candidate in first {
        if rest.iter().any(|items| find(items, &candidate.key).is_some()) {
            continue;
        }
        let value = merge.apply(&[(first_scale, candidate.value)])?;
        result.push(Item { key: candidate.key, value });
    }
    Ok(result)
}

fn find<'a>(items: &'a [Item], key: &[u8]) -> Option<&'a Item> {
    items
        .binary_search_by(|item| item.key.as_slice().cmp(key))
        .ok()
        .and_then(|index| items.get(index))
}

impl Display for SetOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}:{}", self.kind.code(), self.merge.as_str())?;
        for source in &self.sources {
            match &source.node {
                SetNode::Range(range) => write!(f, " {range}")?,
                SetNode::Op(nested) => write!(f, " {nested}")?,
            }
            if let Some(weight) = source.weight {
                write!(f, "*{weight}")?;
            }
        }
        f.write_str(")")
    }
}

impl Display for SetExpression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.op.fmt(f)
    }
}
