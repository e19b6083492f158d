//! Batch planning.
//!
//! The key span is cut into contiguous, disjoint, increasing ranges up
//! front; waves are consecutive chunks of that list.

use plot_finder_config::CeilingStrategy;
use plot_finder_database::{DbError, ParcelStore};
use plot_finder_parcel_models::KeyRange;

/// Splits `span` into consecutive ranges of at most `batch_size` keys.
///
/// The ranges tile `span` exactly. An empty span yields no batches.
#[must_use]
pub fn plan_batches(span: KeyRange, batch_size: u64) -> Vec<KeyRange> {
    let step = i64::try_from(batch_size.max(1)).unwrap_or(i64::MAX);
    let mut batches = Vec::new();
    let mut start = span.start;

    while start < span.end {
        let end = start.saturating_add(step).min(span.end);
        batches.push(KeyRange::new(start, end));
        start = end;
    }

    batches
}

/// Determines the key span to cover.
///
/// [`CeilingStrategy::KeyRange`] asks the store for `[min, max + 1)`.
/// [`CeilingStrategy::RowCount`] assumes dense keys starting at zero and
/// uses `[0, source_rows)`.
///
/// # Errors
///
/// Returns [`DbError`] if the store cannot report the span.
pub async fn key_span(
    store: &dyn ParcelStore,
    ceiling: CeilingStrategy,
    source_rows: u64,
) -> Result<Option<KeyRange>, DbError> {
    match ceiling {
        CeilingStrategy::KeyRange => store.source_key_span().await,
        CeilingStrategy::RowCount => {
            if source_rows == 0 {
                return Ok(None);
            }
            let end = i64::try_from(source_rows).map_err(|_| DbError::Conversion {
                message: format!("Row count {source_rows} exceeds the key range"),
            })?;
            Ok(Some(KeyRange::new(0, end)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_is_tiled_by_batch_size() {
        let batches = plan_batches(KeyRange::new(0, 25_000), 10_000);
        assert_eq!(
            batches,
            vec![
                KeyRange::new(0, 10_000),
                KeyRange::new(10_000, 20_000),
                KeyRange::new(20_000, 25_000),
            ]
        );
    }

    #[test]
    fn offset_span_starts_at_min_key() {
        let batches = plan_batches(KeyRange::new(5, 100_000), 50_000);
        assert_eq!(batches.first(), Some(&KeyRange::new(5, 50_005)));
        assert_eq!(batches.last(), Some(&KeyRange::new(50_005, 100_000)));
        assert_eq!(batches.iter().map(KeyRange::len).sum::<u64>(), 99_995);
    }

    #[test]
    fn empty_span_has_no_batches() {
        assert!(plan_batches(KeyRange::new(10, 10), 10_000).is_empty());
    }

    #[test]
    fn huge_batch_size_does_not_overflow() {
        let batches = plan_batches(KeyRange::new(i64::MAX - 10, i64::MAX), u64::MAX);
        assert_eq!(batches, vec![KeyRange::new(i64::MAX - 10, i64::MAX)]);
    }
}
