//! Temporal bucketing of an interaction log into training buckets and
//! paired holdouts.
//!
//! Every bucket from the `cold_start_buckets`-th on produces one holdout:
//! the last interaction in the bucket of every frequent user the partitioner
//! has already seen before. Holdout pairs that also occur in any training
//! bucket are moved back into the bucket that produced them, so no
//! `(user, item)` pair is ever both trained on and tested.
use std::collections::{HashMap, HashSet};

use chrono::{Datelike, NaiveDate};
use itertools::Itertools;

use crate::data::{InteractionLog, InteractionStore};
use crate::{DataError, ExternalId};

/// How the log is cut into buckets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum IntervalScheme {
    /// One bucket per ISO week.
    Week,
    /// One bucket per calendar month.
    Month,
    /// One bucket per inclusive date range, plus a trailing bucket with
    /// everything after the last range when that is non-empty.
    DateRanges(Vec<(NaiveDate, NaiveDate)>),
    /// One bucket per half-open range of log positions.
    FixedSize(Vec<(usize, usize)>),
}

fn invalid_interval(start: &str, end: &str, reason: &'static str) -> DataError {
    DataError::InvalidInterval {
        start: start.to_owned(),
        end: end.to_owned(),
        reason,
    }
}

impl IntervalScheme {
    /// Parse the short codes `W`, `M`, `QS` and `F`.
    ///
    /// `intervals` is ignored for `W` and `M`; it holds `YYYY-MM-DD` dates
    /// for `QS` and log positions for `F`.
    pub fn from_code(code: &str, intervals: &[(String, String)]) -> Result<Self, DataError> {
        let scheme = match code {
            "W" => IntervalScheme::Week,
            "M" => IntervalScheme::Month,
            "QS" => IntervalScheme::DateRanges(
                intervals
                    .iter()
                    .map(|(start, end)| -> Result<(NaiveDate, NaiveDate), DataError> {
                        let parse = |value: &str| {
                            NaiveDate::parse_from_str(value, "%Y-%m-%d")
                                .map_err(|_| invalid_interval(start, end, "expected YYYY-MM-DD dates"))
                        };
                        Ok((parse(start.as_str())?, parse(end.as_str())?))
                    })
                    .collect::<Result<_, DataError>>()?,
            ),
            "F" => IntervalScheme::FixedSize(
                intervals
                    .iter()
                    .map(|(start, end)| -> Result<(usize, usize), DataError> {
                        let parse = |value: &str| {
                            value
                                .parse::<usize>()
                                .map_err(|_| invalid_interval(start, end, "expected row positions"))
                        };
                        Ok((parse(start.as_str())?, parse(end.as_str())?))
                    })
                    .collect::<Result<_, DataError>>()?,
            ),
            other => return Err(DataError::InvalidIntervalType(other.to_owned())),
        };

        scheme.validate(None)?;

        Ok(scheme)
    }

    /// Check range ordering, and bounds against `len` for fixed ranges.
    fn validate(&self, len: Option<usize>) -> Result<(), DataError> {
        match self {
            IntervalScheme::Week | IntervalScheme::Month => Ok(()),
            IntervalScheme::DateRanges(ranges) => {
                if ranges.is_empty() {
                    return Err(DataError::InvalidConfig(
                        "date range scheme needs at least one range".to_owned(),
                    ));
                }

                let mut previous_end: Option<NaiveDate> = None;
                for &(start, end) in ranges {
                    let (s, e) = (start.to_string(), end.to_string());
                    if start > end {
                        return Err(invalid_interval(&s, &e, "start is after end"));
                    }
                    if previous_end.map_or(false, |previous| start <= previous) {
                        return Err(invalid_interval(&s, &e, "overlaps or precedes the previous range"));
                    }
                    previous_end = Some(end);
                }

                Ok(())
            }
            IntervalScheme::FixedSize(ranges) => {
                if ranges.is_empty() {
                    return Err(DataError::InvalidConfig(
                        "fixed size scheme needs at least one range".to_owned(),
                    ));
                }

                let mut previous_end = 0;
                for &(start, end) in ranges {
                    let (s, e) = (start.to_string(), end.to_string());
                    if start > end {
                        return Err(invalid_interval(&s, &e, "start is after end"));
                    }
                    if start < previous_end {
                        return Err(invalid_interval(&s, &e, "overlaps the previous range"));
                    }
                    if len.map_or(false, |len| end > len) {
                        return Err(invalid_interval(&s, &e, "range ends past the end of the log"));
                    }
                    previous_end = end;
                }

                Ok(())
            }
        }
    }

    /// Cut `log` into buckets of log positions, in chronological order.
    pub fn split<U: ExternalId, I: ExternalId>(
        &self,
        log: &InteractionLog<U, I>,
    ) -> Result<Vec<Vec<usize>>, DataError> {
        self.validate(Some(log.len()))?;

        let rows = log.data();

        let buckets = match self {
            IntervalScheme::Week => group_consecutive(rows.len(), |position| {
                let week = rows[position].timestamp().iso_week();
                (week.year(), week.week())
            }),
            IntervalScheme::Month => group_consecutive(rows.len(), |position| {
                let timestamp = rows[position].timestamp();
                (timestamp.year(), timestamp.month())
            }),
            IntervalScheme::DateRanges(ranges) => {
                let mut buckets: Vec<Vec<usize>> = ranges
                    .iter()
                    .map(|&(start, end)| {
                        (0..rows.len())
                            .filter(|&position| {
                                let date = rows[position].timestamp().date();
                                date >= start && date <= end
                            })
                            .collect()
                    })
                    .collect();

                if let Some(&(_, last_end)) = ranges.last() {
                    let trailing: Vec<usize> = (0..rows.len())
                        .filter(|&position| rows[position].timestamp().date() > last_end)
                        .collect();
                    if !trailing.is_empty() {
                        buckets.push(trailing);
                    }
                }

                buckets
            }
            IntervalScheme::FixedSize(ranges) => ranges
                .iter()
                .map(|&(start, end)| (start..end).collect())
                .collect(),
        };

        Ok(buckets)
    }
}

/// Group positions `0..len` into runs with the same key.
fn group_consecutive<K, F>(len: usize, mut key: F) -> Vec<Vec<usize>>
where
    K: PartialEq,
    F: FnMut(usize) -> K,
{
    let groups = (0..len).group_by(|&position| key(position));
    let buckets = groups.into_iter().map(|(_, group)| group.collect()).collect();

    buckets
}

/// Users present in at least `threshold` (a fraction in `[0, 1]`) of the
/// buckets produced by `scheme`, in ascending order.
pub fn frequent_users<U: ExternalId, I: ExternalId>(
    log: &InteractionLog<U, I>,
    scheme: &IntervalScheme,
    threshold: f32,
) -> Result<Vec<U>, DataError> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(DataError::InvalidConfig(format!(
            "frequent user threshold {} is outside [0, 1]",
            threshold
        )));
    }

    let buckets = scheme.split(log)?;
    if buckets.is_empty() {
        return Ok(Vec::new());
    }

    let mut presence: HashMap<&U, usize> = HashMap::new();
    for bucket in &buckets {
        let users: HashSet<&U> = bucket
            .iter()
            .map(|&position| log.data()[position].user_id())
            .collect();
        for user in users {
            *presence.entry(user).or_insert(0) += 1;
        }
    }

    let num_buckets = buckets.len() as f32;
    let mut users: Vec<U> = presence
        .into_iter()
        .filter(|&(_, count)| count as f32 / num_buckets >= threshold)
        .map(|(user, _)| user.clone())
        .collect();
    users.sort();

    debug!(
        frequent = users.len(),
        buckets = buckets.len(),
        threshold,
        "selected frequent users"
    );

    Ok(users)
}

/// The result of partitioning a log.
#[derive(Clone, Debug)]
pub struct Partition<U, I> {
    /// Training buckets, in order.
    pub buckets: Vec<InteractionStore<U, I>>,
    /// Holdouts; holdout `k` pairs with bucket `k + cold_start_buckets`.
    pub holdouts: Vec<InteractionStore<U, I>>,
    /// Log positions of each bucket, ascending.
    pub bucket_positions: Vec<Vec<usize>>,
    /// Log positions of each holdout, ascending.
    pub holdout_positions: Vec<Vec<usize>>,
    /// Number of leading training-only buckets.
    pub cold_start_buckets: usize,
}

fn to_store<U: ExternalId, I: ExternalId>(
    log: &InteractionLog<U, I>,
    positions: &[usize],
) -> Result<InteractionStore<U, I>, DataError> {
    let (users, items): (Vec<U>, Vec<I>) = positions
        .iter()
        .map(|&position| {
            let row = &log.data()[position];
            (row.user_id().clone(), row.item_id().clone())
        })
        .unzip();

    InteractionStore::new(users, items)
}

/// Builds buckets and holdouts out of an interaction log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Partitioner {
    scheme: IntervalScheme,
    cold_start_buckets: usize,
}

impl Partitioner {
    /// A partitioner with one cold-start bucket.
    pub fn new(scheme: IntervalScheme) -> Self {
        Partitioner {
            scheme,
            cold_start_buckets: 1,
        }
    }

    /// Set the number of leading training-only buckets.
    pub fn cold_start_buckets(mut self, cold_start_buckets: usize) -> Self {
        self.cold_start_buckets = cold_start_buckets;
        self
    }

    /// The interval scheme.
    pub fn scheme(&self) -> &IntervalScheme {
        &self.scheme
    }

    /// Partition `log`. Only `frequent_users` ever contribute holdout rows.
    pub fn partition<U: ExternalId, I: ExternalId>(
        &self,
        log: &InteractionLog<U, I>,
        frequent_users: &[U],
    ) -> Result<Partition<U, I>, DataError> {
        let mut buckets = self.scheme.split(log)?;

        if self.cold_start_buckets > buckets.len() {
            return Err(DataError::InvalidConfig(format!(
                "{} cold start buckets requested but the log only yields {} buckets",
                self.cold_start_buckets,
                buckets.len()
            )));
        }

        let rows = log.data();
        let frequent: HashSet<&U> = frequent_users.iter().collect();
        let mut seen: HashSet<&U> = HashSet::new();
        let mut holdouts: Vec<Vec<usize>> = Vec::with_capacity(buckets.len() - self.cold_start_buckets);

        for (index, bucket) in buckets.iter_mut().enumerate() {
            // Occurrence count and last position per frequent user.
            let mut occurrences: HashMap<&U, (usize, usize)> = HashMap::new();
            for &position in bucket.iter() {
                let user = rows[position].user_id();
                if frequent.contains(user) {
                    let entry = occurrences.entry(user).or_insert((0, position));
                    entry.0 += 1;
                    entry.1 = position;
                }
            }

            if index < self.cold_start_buckets {
                seen.extend(occurrences.keys());
                debug!(bucket = index, size = bucket.len(), "cold start bucket");
                continue;
            }

            let mut holdout = Vec::new();
            for (user, (count, last)) in occurrences {
                if count == 1 && !seen.contains(user) {
                    seen.insert(user);
                } else {
                    holdout.push(last);
                    seen.insert(user);
                }
            }
            holdout.sort_unstable();

            let moved: HashSet<usize> = holdout.iter().cloned().collect();
            bucket.retain(|position| !moved.contains(position));

            debug!(
                bucket = index,
                size = bucket.len(),
                holdout = holdout.len(),
                "split bucket"
            );
            holdouts.push(holdout);
        }

        let trained: HashSet<(&U, &I)> = buckets
            .iter()
            .flatten()
            .map(|&position| (rows[position].user_id(), rows[position].item_id()))
            .collect();

        for (index, holdout) in holdouts.iter_mut().enumerate() {
            let (leaked, kept): (Vec<usize>, Vec<usize>) = holdout.iter().partition(|&&position| {
                trained.contains(&(rows[position].user_id(), rows[position].item_id()))
            });

            if !leaked.is_empty() {
                debug!(holdout = index, leaked = leaked.len(), "moving leaked pairs to training");

                let bucket = &mut buckets[index + self.cold_start_buckets];
                bucket.extend(leaked);
                bucket.sort_unstable();
            }

            *holdout = kept;
        }

        let partition = Partition {
            buckets: buckets
                .iter()
                .map(|positions| to_store(log, positions))
                .collect::<Result<_, _>>()?,
            holdouts: holdouts
                .iter()
                .map(|positions| to_store(log, positions))
                .collect::<Result<_, _>>()?,
            bucket_positions: buckets,
            holdout_positions: holdouts,
            cold_start_buckets: self.cold_start_buckets,
        };

        info!(
            buckets = partition.buckets.len(),
            holdouts = partition.holdouts.len(),
            holdout_rows = partition.holdouts.iter().map(|h| h.len()).sum::<usize>(),
            "partitioned interaction log"
        );

        Ok(partition)
    }
}
