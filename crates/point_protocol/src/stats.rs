//! Per-field bucket histograms and the running pipeline aggregate.
//!
//! The loader buckets every field value at a fixed width; the cache merges
//! each incoming tile's histograms into one running total before brushes
//! prepare, so a brush always sees a range that includes the tile being
//! inserted.

use std::collections::BTreeMap;

/// Width of one histogram bucket in field units. A bucket keyed `k` covers
/// values in `[k, k + STATS_BUCKET_WIDTH)`.
pub const STATS_BUCKET_WIDTH: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldHistogram {
    buckets: BTreeMap<i64, u64>,
}

impl FieldHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_buckets<I: IntoIterator<Item = (i64, u64)>>(buckets: I) -> Self {
        let mut histogram = Self::new();
        for (key, count) in buckets {
            histogram.add_count(key, count);
        }
        histogram
    }

    pub fn add_count(&mut self, bucket_key: i64, count: u64) {
        if count == 0 {
            return;
        }
        *self.buckets.entry(bucket_key).or_insert(0) += count;
    }

    pub fn bucket_count(&self, bucket_key: i64) -> u64 {
        self.buckets.get(&bucket_key).copied().unwrap_or(0)
    }

    pub fn buckets(&self) -> impl Iterator<Item = (i64, u64)> + '_ {
        self.buckets.iter().map(|(&key, &count)| (key, count))
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn total_count(&self) -> u64 {
        self.buckets.values().sum()
    }

    /// Covered value range: lowest bucket key to one bucket width past the
    /// highest. `None` when no counts were recorded.
    pub fn value_range(&self) -> Option<(f64, f64)> {
        let (&min_key, _) = self.buckets.first_key_value()?;
        let (&max_key, _) = self.buckets.last_key_value()?;
        Some((min_key as f64, (max_key + STATS_BUCKET_WIDTH) as f64))
    }

    pub fn accumulate(&mut self, incoming: &FieldHistogram) {
        for (key, count) in incoming.buckets() {
            self.add_count(key, count);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BufferStats {
    fields: BTreeMap<String, FieldHistogram>,
}

impl BufferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fields<I: IntoIterator<Item = (String, FieldHistogram)>>(fields: I) -> Self {
        let mut stats = Self::new();
        for (name, histogram) in fields {
            stats.fields.entry(name).or_default().accumulate(&histogram);
        }
        stats
    }

    pub fn field(&self, name: &str) -> Option<&FieldHistogram> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldHistogram)> {
        self.fields
            .iter()
            .map(|(name, histogram)| (name.as_str(), histogram))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.values().all(FieldHistogram::is_empty)
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Field-wise, bucket-wise additive merge. Monotone: no bucket count
    /// ever decreases.
    pub fn accumulate(&mut self, incoming: &BufferStats) {
        for (name, histogram) in incoming.fields() {
            self.fields
                .entry(name.to_owned())
                .or_default()
                .accumulate(histogram);
        }
    }
}

/// Pure-function form of the merge: feeds `incoming` into `running` and
/// hands `running` back.
pub fn accumulate(mut running: BufferStats, incoming: &BufferStats) -> BufferStats {
    running.accumulate(incoming);
    running
}
