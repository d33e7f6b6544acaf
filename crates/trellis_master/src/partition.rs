//! Hash+range partitioning descriptors and partition construction.
//!
//! Partition keys are opaque byte strings. A table's partition schema is a
//! stack of hash-bucket levels over a range component; every tablet covers
//! one (bucket combination, range) pair. Encoded partition keys are the
//! concatenation of each bucket index as a 4-byte big-endian integer followed
//! by the range key. Empty keys mean unbounded.

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, MasterResult};
use crate::schema::Schema;

/// One hash-bucketing level of a partition schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSchema {
    pub columns: Vec<String>,
    pub num_buckets: u32,
    pub seed: u32,
}

/// Hash+range partitioning descriptor for a table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSchema {
    pub hash_schemas: Vec<HashSchema>,
    pub range_columns: Vec<String>,
}

impl PartitionSchema {
    /// Sanity-check the descriptor against the table schema: hash and range
    /// columns must name key columns, and bucket counts must be at least two.
    pub fn validate(&self, schema: &Schema) -> MasterResult<()> {
        for hash in &self.hash_schemas {
            if hash.num_buckets < 2 {
                return Err(MasterError::invalid_schema(format!(
                    "hash bucket schema must have at least two buckets, got {}",
                    hash.num_buckets
                )));
            }
            for column in &hash.columns {
                let found = schema.find_column(column).ok_or_else(|| {
                    MasterError::invalid_schema(format!("unknown hash column '{column}'"))
                })?;
                if !found.is_key {
                    return Err(MasterError::invalid_schema(format!(
                        "hash column '{column}' is not a key column"
                    )));
                }
            }
        }
        for column in &self.range_columns {
            let found = schema.find_column(column).ok_or_else(|| {
                MasterError::invalid_schema(format!("unknown range column '{column}'"))
            })?;
            if !found.is_key {
                return Err(MasterError::invalid_schema(format!(
                    "range column '{column}' is not a key column"
                )));
            }
        }
        Ok(())
    }

    /// Total bucket combinations across all hash levels.
    fn num_hash_combinations(&self) -> usize {
        self.hash_schemas
            .iter()
            .map(|h| h.num_buckets as usize)
            .product()
    }

    /// Build the full partition set from client-supplied split points and
    /// range bounds.
    ///
    /// With no bounds the table covers the whole range keyspace. Bounds must
    /// not overlap, and every split point must fall strictly inside one
    /// bound. The result is ordered by encoded begin key.
    pub fn create_partitions(
        &self,
        split_points: &[Vec<u8>],
        range_bounds: &[(Vec<u8>, Vec<u8>)],
    ) -> MasterResult<Vec<Partition>> {
        let ranges = build_ranges(split_points, range_bounds)?;

        let mut partitions = Vec::with_capacity(ranges.len() * self.num_hash_combinations());
        for combo in HashCombinations::new(&self.hash_schemas) {
            for (start, end) in &ranges {
                partitions.push(self.make_partition(&combo, start.clone(), end.clone()));
            }
        }
        partitions.sort_by(|a, b| a.begin.cmp(&b.begin));
        Ok(partitions)
    }

    /// Build the partitions covering one newly added range across every hash
    /// bucket combination.
    pub fn partitions_for_range(&self, start: Vec<u8>, end: Vec<u8>) -> Vec<Partition> {
        HashCombinations::new(&self.hash_schemas)
            .map(|combo| self.make_partition(&combo, start.clone(), end.clone()))
            .collect()
    }

    fn make_partition(&self, combo: &[u32], range_start: Vec<u8>, range_end: Vec<u8>) -> Partition {
        let prefix = bucket_prefix(combo);

        let mut begin = prefix.clone();
        begin.extend_from_slice(&range_start);

        let end = if !range_end.is_empty() {
            let mut end = prefix;
            end.extend_from_slice(&range_end);
            end
        } else if let Some(next) = next_combination(combo, &self.hash_schemas) {
            bucket_prefix(&next)
        } else {
            Vec::new()
        };

        Partition {
            hash_buckets: combo.to_vec(),
            range_start,
            range_end,
            begin,
            end,
        }
    }
}

/// One tablet's slice of the partition space.
///
/// `begin`/`end` are the encoded partition keys used for routing and for the
/// per-table ordered tablet map; `range_start`/`range_end` retain the range
/// component for range add/drop matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub hash_buckets: Vec<u32>,
    pub range_start: Vec<u8>,
    pub range_end: Vec<u8>,
    pub begin: Vec<u8>,
    pub end: Vec<u8>,
}

impl Partition {
    /// Whether the encoded key range [begin, end) intersects [start, end).
    pub fn overlaps_key_range(&self, start: &[u8], end: &[u8]) -> bool {
        (end.is_empty() || self.begin.as_slice() < end)
            && (self.end.is_empty() || start < self.end.as_slice())
    }
}

/// Whether two range intervals [a_start, a_end) and [b_start, b_end)
/// intersect, with empty keys unbounded.
pub fn ranges_overlap(a_start: &[u8], a_end: &[u8], b_start: &[u8], b_end: &[u8]) -> bool {
    (b_end.is_empty() || a_start < b_end) && (a_end.is_empty() || b_start < a_end)
}

fn bucket_prefix(combo: &[u32]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(combo.len() * 4);
    for bucket in combo {
        prefix.extend_from_slice(&bucket.to_be_bytes());
    }
    prefix
}

/// The lexicographically next bucket combination, or `None` past the last.
fn next_combination(combo: &[u32], schemas: &[HashSchema]) -> Option<Vec<u32>> {
    let mut next = combo.to_vec();
    for level in (0..next.len()).rev() {
        if next[level] + 1 < schemas[level].num_buckets {
            next[level] += 1;
            for later in next.iter_mut().skip(level + 1) {
                *later = 0;
            }
            return Some(next);
        }
    }
    None
}

struct HashCombinations {
    current: Option<Vec<u32>>,
    schemas: Vec<HashSchema>,
}

impl HashCombinations {
    fn new(schemas: &[HashSchema]) -> Self {
        Self {
            current: Some(vec![0; schemas.len()]),
            schemas: schemas.to_vec(),
        }
    }
}

impl Iterator for HashCombinations {
    type Item = Vec<u32>;

    fn next(&mut self) -> Option<Vec<u32>> {
        let current = self.current.take()?;
        self.current = next_combination(&current, &self.schemas);
        Some(current)
    }
}

/// Slice the validated bounds by the split points, producing the ordered
/// range list.
fn build_ranges(
    split_points: &[Vec<u8>],
    range_bounds: &[(Vec<u8>, Vec<u8>)],
) -> MasterResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut bounds: Vec<(Vec<u8>, Vec<u8>)> = if range_bounds.is_empty() {
        vec![(Vec::new(), Vec::new())]
    } else {
        range_bounds.to_vec()
    };

    for (start, end) in &bounds {
        if !start.is_empty() && !end.is_empty() && start >= end {
            return Err(MasterError::invalid_schema(
                "range partition lower bound must be less than the upper bound",
            ));
        }
    }
    bounds.sort_by(|a, b| a.0.cmp(&b.0));
    for pair in bounds.windows(2) {
        let (ref a_start, ref a_end) = pair[0];
        let (ref b_start, ref b_end) = pair[1];
        if ranges_overlap(a_start, a_end, b_start, b_end) {
            return Err(MasterError::invalid_schema("overlapping range partitions"));
        }
    }

    let mut splits = split_points.to_vec();
    splits.sort();
    splits.dedup();
    if splits.len() != split_points.len() {
        return Err(MasterError::invalid_schema("duplicate split point"));
    }

    let mut ranges = Vec::with_capacity(bounds.len() + splits.len());
    let mut consumed = 0usize;
    for (start, end) in bounds {
        for split in &splits {
            if *split == start || (!end.is_empty() && *split == end) {
                return Err(MasterError::invalid_schema(
                    "split point matches a range bound",
                ));
            }
        }
        let in_bound: Vec<Vec<u8>> = splits
            .iter()
            .filter(|s| (start.is_empty() || **s > start) && (end.is_empty() || **s < end))
            .cloned()
            .collect();
        consumed += in_bound.len();

        let mut lower = start;
        for split in in_bound {
            ranges.push((lower, split.clone()));
            lower = split;
        }
        ranges.push((lower, end));
    }

    if consumed != splits.len() {
        return Err(MasterError::invalid_schema(
            "split point does not fall within any range bound",
        ));
    }

    Ok(ranges)
}
