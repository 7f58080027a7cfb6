//! Tag search - resolves a condition tree into per-predicate tag value ids
//!
//! Each leaf predicate is resolved against the metadata store once. The
//! result map is keyed by the predicate's canonical string so the series
//! search can replay the tree without touching the tag index again.

use crate::error::{IndexError, Result};
use crate::expr::{BinaryOp, TagFilter};
use crate::metadata::MetadataStore;
use roaring::RoaringBitmap;
use rusts_core::TagKeyId;
use std::collections::HashMap;
use tracing::debug;

/// Tag value ids matched by one leaf predicate
#[derive(Debug, Clone, PartialEq)]
pub struct TagFilterResult {
    pub tag_key_id: TagKeyId,
    pub tag_value_ids: RoaringBitmap,
}

/// Results keyed by [`TagFilter::rewrite`] of the originating predicate
pub type TagFilterResults = HashMap<String, TagFilterResult>;

/// Resolves every leaf predicate of a condition.
///
/// A predicate matching nothing is left out of the result, except directly
/// under `not`, where the empty match is kept so the complement can be
/// taken against every series of the tag key. The first error stops the
/// walk.
pub struct TagSearch<'a> {
    namespace: &'a str,
    metric_name: &'a str,
    condition: Option<&'a TagFilter>,
    metadata: &'a dyn MetadataStore,
    /// `None` marks a tag key the metadata store does not know
    tag_key_ids: HashMap<String, Option<TagKeyId>>,
    results: TagFilterResults,
    err: Option<IndexError>,
}

impl<'a> TagSearch<'a> {
    pub fn new(
        namespace: &'a str,
        metric_name: &'a str,
        condition: Option<&'a TagFilter>,
        metadata: &'a dyn MetadataStore,
    ) -> Self {
        Self {
            namespace,
            metric_name,
            condition,
            metadata,
            tag_key_ids: HashMap::new(),
            results: HashMap::new(),
            err: None,
        }
    }

    /// Walk the condition and return the per-predicate results
    pub fn filter(mut self) -> Result<TagFilterResults> {
        if let Some(condition) = self.condition {
            self.find(condition, false);
        }
        match self.err.take() {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }

    fn find(&mut self, expr: &TagFilter, under_not: bool) {
        if self.err.is_some() {
            return;
        }
        match expr {
            TagFilter::Equals { .. }
            | TagFilter::In { .. }
            | TagFilter::Like { .. }
            | TagFilter::Regex { .. } => self.find_leaf(expr, under_not),
            // inversion happens in the series search
            TagFilter::Not(inner) => self.find(inner, true),
            TagFilter::Paren(inner) => self.find(inner, under_not),
            TagFilter::Binary { op, left, right } => match op {
                BinaryOp::And | BinaryOp::Or => {
                    self.find(left, false);
                    self.find(right, false);
                }
                other => {
                    self.err = Some(IndexError::InvalidFilter(format!(
                        "operator '{}' not allowed between tag filters",
                        other.as_str()
                    )));
                }
            },
        }
    }

    fn find_leaf(&mut self, expr: &TagFilter, under_not: bool) {
        let Some(tag_key) = expr.tag_key() else {
            return;
        };
        let tag_key_id = match self.resolve_tag_key(tag_key) {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(err) => {
                self.err = Some(err);
                return;
            }
        };

        let tag_value_ids = match self.metadata.find_tag_value_ids(tag_key_id, expr) {
            Ok(ids) => ids,
            Err(err) if err.is_not_found() => RoaringBitmap::new(),
            Err(err) => {
                self.err = Some(err);
                return;
            }
        };

        if tag_value_ids.is_empty() && !under_not {
            debug!("Tag filter {} matched no tag values", expr);
            return;
        }
        self.results.insert(
            expr.rewrite(),
            TagFilterResult {
                tag_key_id,
                tag_value_ids,
            },
        );
    }

    fn resolve_tag_key(&mut self, tag_key: &str) -> Result<Option<TagKeyId>> {
        if let Some(cached) = self.tag_key_ids.get(tag_key) {
            return Ok(*cached);
        }
        let resolved = match self
            .metadata
            .tag_key_id(self.namespace, self.metric_name, tag_key)
        {
            Ok(id) => Some(id),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err),
        };
        self.tag_key_ids.insert(tag_key.to_string(), resolved);
        Ok(resolved)
    }
}
