//! Series search - replays a condition tree into a series id bitmap
//!
//! Positive leaves come from the precomputed tag search results; `not`
//! needs the full series set of its tag key, which only the shard's series
//! filter can answer.

use crate::error::{IndexError, Result};
use crate::expr::{BinaryOp, TagFilter};
use crate::metadata::SeriesFilter;
use crate::tag_search::{TagFilterResult, TagFilterResults};
use roaring::RoaringBitmap;
use rusts_core::MetricId;

/// Composes series ids for a condition: AND intersects, OR unions,
/// NOT takes the complement within the tag key (or the metric).
pub struct SeriesSearch<'a> {
    filter: &'a dyn SeriesFilter,
    metric_id: MetricId,
    condition: Option<&'a TagFilter>,
    results: Option<&'a TagFilterResults>,
}

impl<'a> SeriesSearch<'a> {
    pub fn new(
        filter: &'a dyn SeriesFilter,
        metric_id: MetricId,
        condition: Option<&'a TagFilter>,
        results: Option<&'a TagFilterResults>,
    ) -> Self {
        Self {
            filter,
            metric_id,
            condition,
            results,
        }
    }

    /// Series ids matching the condition
    pub fn search(&self) -> Result<RoaringBitmap> {
        let Some(condition) = self.condition else {
            return Ok(RoaringBitmap::new());
        };
        let Some(results) = self.results else {
            return Err(IndexError::FilterResultMissing(condition.rewrite()));
        };
        self.find(condition, results)
    }

    fn find(&self, expr: &TagFilter, results: &TagFilterResults) -> Result<RoaringBitmap> {
        match expr {
            TagFilter::Equals { .. }
            | TagFilter::In { .. }
            | TagFilter::Like { .. }
            | TagFilter::Regex { .. } => match results.get(&expr.rewrite()) {
                Some(result) => self.matched(result),
                None => Ok(RoaringBitmap::new()),
            },
            TagFilter::Paren(inner) => self.find(inner, results),
            TagFilter::Not(inner) => match inner.leaf() {
                Some(leaf) => match results.get(&leaf.rewrite()) {
                    Some(result) => {
                        let mut all =
                            not_found_as_empty(self.filter.series_ids_for_tag(result.tag_key_id))?;
                        all -= &self.matched(result)?;
                        Ok(all)
                    }
                    // unknown tag key, no series carries it
                    None => Ok(RoaringBitmap::new()),
                },
                None => {
                    let mut all =
                        not_found_as_empty(self.filter.series_ids_for_metric(self.metric_id))?;
                    all -= &self.find(inner, results)?;
                    Ok(all)
                }
            },
            TagFilter::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let mut left = self.find(left, results)?;
                    if left.is_empty() {
                        return Ok(left);
                    }
                    left &= &self.find(right, results)?;
                    Ok(left)
                }
                BinaryOp::Or => {
                    let mut left = self.find(left, results)?;
                    left |= &self.find(right, results)?;
                    Ok(left)
                }
                // rejected earlier by the tag search; kept lenient here
                _ => Ok(RoaringBitmap::new()),
            },
        }
    }

    fn matched(&self, result: &TagFilterResult) -> Result<RoaringBitmap> {
        if result.tag_value_ids.is_empty() {
            return Ok(RoaringBitmap::new());
        }
        not_found_as_empty(
            self.filter
                .series_ids_by_tag_value_ids(result.tag_key_id, &result.tag_value_ids),
        )
    }
}

fn not_found_as_empty(result: Result<RoaringBitmap>) -> Result<RoaringBitmap> {
    match result {
        Err(err) if err.is_not_found() => Ok(RoaringBitmap::new()),
        other => other,
    }
}
