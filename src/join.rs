//! Entity correlation across backends.
//!
//! Pure functions only: every call takes concrete collections and returns a
//! new ordered `Vec`, so intermediate results can be asserted in tests. Any
//! lookup of a key that may be absent goes through an explicit
//! [`JoinPolicy`].

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::{JoinedRow, RawRecord};

// ----------------------------------------------------------------------------
// 1. Policies
// ----------------------------------------------------------------------------

/// What happens to a primary row whose key has no secondary match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinPolicy {
    /// Exclude the row from the output
    DropUnmatched,
    /// Keep the row and populate every projected field with this default
    DefaultUnmatched(String),
}

impl JoinPolicy {
    /// Shorthand for `DefaultUnmatched("")`, the usual label default.
    pub fn default_empty() -> Self {
        JoinPolicy::DefaultUnmatched(String::new())
    }
}

/// Copy `source` from the secondary record into `target` on the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMap<'a> {
    pub source: &'a str,
    pub target: &'a str,
}

impl<'a> FieldMap<'a> {
    pub const fn new(source: &'a str, target: &'a str) -> Self {
        Self { source, target }
    }

    /// Same field name on both sides.
    pub const fn same(name: &'a str) -> Self {
        Self {
            source: name,
            target: name,
        }
    }
}

// ----------------------------------------------------------------------------
// 2. Indexing & Two-way Join
// ----------------------------------------------------------------------------

/// Index records by a derived key, in record order.
///
/// Two records mapping to the same key are a correlation bug upstream; the
/// later record wins and a warning is logged.
pub fn index_by<'a, F>(context: &str, records: &'a [RawRecord], key_fn: F) -> HashMap<String, &'a RawRecord>
where
    F: Fn(&RawRecord) -> Option<String>,
{
    let mut index = HashMap::with_capacity(records.len());
    for record in records {
        let Some(key) = key_fn(record) else {
            debug!(target: "exporter::join", context, id = %record.id, "Record has no join key, skipped");
            continue;
        };
        if let Some(previous) = index.insert(key.clone(), record) {
            warn!(
                target: "exporter::join",
                context,
                key = %key,
                replaced = %previous.id,
                winner = %record.id,
                "Join key collision, last record wins"
            );
        }
    }
    index
}

/// Correlate `primary` rows with `secondary` records.
///
/// For each row, `key_fn` yields the correlation key; when the secondary
/// index has it, every [`FieldMap`] is copied from the record onto the row.
/// Unmatched rows (including rows without a key) follow `policy`. A matched
/// record missing one of the projected fields contributes the policy default
/// for that field (or leaves it unset under `DropUnmatched`).
pub fn join<F>(
    primary: Vec<JoinedRow>,
    secondary: &HashMap<String, &RawRecord>,
    key_fn: F,
    projection: &[FieldMap<'_>],
    policy: &JoinPolicy,
) -> Vec<JoinedRow>
where
    F: Fn(&JoinedRow) -> Option<String>,
{
    let mut joined = Vec::with_capacity(primary.len());
    let mut unmatched = 0usize;

    for mut row in primary {
        let matched = key_fn(&row).and_then(|key| secondary.get(&key).copied());
        match (matched, policy) {
            (Some(record), _) => {
                for map in projection {
                    match (record.str_field(map.source), policy) {
                        (Some(value), _) => row.set_field(map.target, value),
                        (None, JoinPolicy::DefaultUnmatched(default)) => {
                            row.set_field(map.target, default.clone())
                        }
                        (None, JoinPolicy::DropUnmatched) => {}
                    }
                }
                joined.push(row);
            }
            (None, JoinPolicy::DropUnmatched) => {
                unmatched += 1;
            }
            (None, JoinPolicy::DefaultUnmatched(default)) => {
                unmatched += 1;
                for map in projection {
                    row.set_field(map.target, default.clone());
                }
                joined.push(row);
            }
        }
    }

    if unmatched > 0 {
        debug!(target: "exporter::join", unmatched, policy = ?policy, "Rows without a secondary match");
    }
    joined
}

/// Turn records into rows keyed by `key_fn`, copying `fields` verbatim.
pub fn rows_from_records<F>(records: &[RawRecord], key_fn: F, fields: &[FieldMap<'_>]) -> Vec<JoinedRow>
where
    F: Fn(&RawRecord) -> Option<String>,
{
    records
        .iter()
        .filter_map(|record| {
            let key = key_fn(record)?;
            let mut row = JoinedRow::new(key);
            for map in fields {
                row.set_opt_field(map.target, record.str_field(map.source));
            }
            Some(row)
        })
        .collect()
}

/// Enforce row-key uniqueness. The last row with a key wins, but keeps the
/// position of the first occurrence so output order stays stable.
pub fn dedupe_rows(context: &str, rows: Vec<JoinedRow>) -> Vec<JoinedRow> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<JoinedRow> = Vec::with_capacity(rows.len());

    for row in rows {
        match positions.get(&row.key) {
            Some(&pos) => {
                warn!(target: "exporter::join", context, key = %row.key, "Duplicate row key, last row wins");
                unique[pos] = row;
            }
            None => {
                positions.insert(row.key.clone(), unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

/// Group items by key, keeping item order inside each group.
pub fn group_by<T, K, F>(items: impl IntoIterator<Item = T>, key_fn: F) -> BTreeMap<K, Vec<T>>
where
    K: Ord,
    F: Fn(&T) -> Option<K>,
{
    let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
    for item in items {
        if let Some(key) = key_fn(&item) {
            groups.entry(key).or_default().push(item);
        }
    }
    groups
}

// ----------------------------------------------------------------------------
// 3. Key Extraction Helpers
// ----------------------------------------------------------------------------

static FIRST_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").expect("static regex"));

/// Last whitespace-delimited token, e.g. the port of `"Ethernet 12"`.
pub fn last_token(descriptor: &str) -> Option<&str> {
    descriptor.split_whitespace().last()
}

/// First run of digits, e.g. the GPU index of `"gpu3.utilization"`.
pub fn first_number(name: &str) -> Option<&str> {
    FIRST_NUMBER.find(name).map(|m| m.as_str())
}

/// Last dot-separated segment, e.g. `"utilization"` of `"gpu3.utilization"`.
pub fn last_segment(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

// ----------------------------------------------------------------------------
// 4. Numeric Aggregation
// ----------------------------------------------------------------------------

/// Reduction applied over every value matched to one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Mean,
    Max,
    Min,
    Sum,
    Last,
}

impl Aggregation {
    /// Reduce `values`, ignoring NaN gaps. `None` when nothing is left.
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        let mut present = values.iter().copied().filter(|v| !v.is_nan()).peekable();
        present.peek()?;
        Some(match self {
            Aggregation::Mean => {
                let (sum, count) = present.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
                sum / count as f64
            }
            Aggregation::Max => present.fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Min => present.fold(f64::INFINITY, f64::min),
            Aggregation::Sum => present.sum(),
            Aggregation::Last => present.last()?,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Max => "max",
            Aggregation::Min => "min",
            Aggregation::Sum => "sum",
            Aggregation::Last => "last",
        }
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a numeric aggregation join, owned by collector config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    /// Reduction across matched metric identifiers
    pub method: Aggregation,
    /// Window granularity of the underlying series (seconds)
    pub granularity_secs: u64,
    /// Value substituted for gaps; `None` leaves gaps unfilled
    #[serde(default)]
    pub fill: Option<String>,
}

impl AggregationSpec {
    pub fn new(method: Aggregation, granularity_secs: u64) -> Self {
        Self {
            method,
            granularity_secs,
            fill: None,
        }
    }

    pub fn with_fill(mut self, fill: impl Into<String>) -> Self {
        self.fill = Some(fill.into());
        self
    }
}
