use chrono::{Duration, NaiveDate};
use txcache_core::{CacheSegment, DateRange, TransactionSource};

/// How much of a requested range the complete segments of a source cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage {
    Full,
    Partial { covered_days: i64 },
    None,
}

/// Classifies `range` against `segments`.
///
/// Only `complete` segments of `source` count. Overlapping or adjacent
/// segments are merged, so two segments `[1,10]` and `[11,20]` fully cover
/// `[5,15]`.
pub fn classify(source: TransactionSource, range: DateRange, segments: &[CacheSegment]) -> Coverage {
    let mut spans: Vec<(NaiveDate, NaiveDate)> = segments
        .iter()
        .filter(|s| s.source == source && s.is_complete() && s.range().overlaps(&range))
        .map(|s| (s.start_date.max(range.start), s.end_date.min(range.end)))
        .collect();
    if spans.is_empty() {
        return Coverage::None;
    }
    spans.sort();

    let mut covered_days = 0i64;
    let mut current = spans[0];
    for &(start, end) in &spans[1..] {
        if start <= current.1 + Duration::days(1) {
            current.1 = current.1.max(end);
        } else {
            covered_days += (current.1 - current.0).num_days() + 1;
            current = (start, end);
        }
    }
    covered_days += (current.1 - current.0).num_days() + 1;

    if covered_days >= range.days() {
        Coverage::Full
    } else {
        Coverage::Partial { covered_days }
    }
}
