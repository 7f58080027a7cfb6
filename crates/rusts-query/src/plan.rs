//! Query planning
//!
//! Resolves the metric, the group-by tag keys and the selected fields of a
//! query, and derives the per-field down-sampling and aggregation specs.

use crate::context::ExecuteContext;
use crate::error::{QueryError, Result};
use crate::stmt::Expr;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use rusts_aggregation::AggregatorSpec;
use rusts_core::{FieldId, FieldMeta, FunctionType, TagKeyMeta};
use rusts_index::MetadataStore;
use std::collections::BTreeMap;

/// Fills the planning part of an [`ExecuteContext`]
pub struct QueryPlan<'a> {
    ctx: &'a mut ExecuteContext,
    metadata: &'a dyn MetadataStore,
    fields: BTreeMap<FieldId, FieldMeta>,
    specs: BTreeMap<FieldId, AggregatorSpec>,
}

impl<'a> QueryPlan<'a> {
    pub fn new(ctx: &'a mut ExecuteContext, metadata: &'a dyn MetadataStore) -> Self {
        Self {
            ctx,
            metadata,
            fields: BTreeMap::new(),
            specs: BTreeMap::new(),
        }
    }

    pub fn plan(mut self) -> Result<()> {
        let namespace = self.ctx.query.namespace.clone();
        let metric_name = self.ctx.query.metric_name.clone();

        self.ctx.metric_id = self.metadata.metric_id(&namespace, &metric_name)?;
        self.plan_group_by(&namespace, &metric_name)?;

        let select = self.ctx.query.select.clone();
        if select.is_empty() {
            return Err(QueryError::InvalidQuery("Empty select list".to_string()));
        }
        for item in &select {
            self.plan_expr(&item.expr, None)?;
        }
        if self.specs.is_empty() {
            return Err(QueryError::InvalidQuery(format!(
                "No field selected from metric '{}'",
                metric_name
            )));
        }

        // BTreeMap iteration keeps both slices sorted by field id
        self.ctx.fields = self.fields.into_values().collect();
        let specs: Vec<AggregatorSpec> = self.specs.into_values().collect();
        self.ctx.down_sampling_specs = specs.clone();
        self.ctx.aggregator_specs = specs;
        Ok(())
    }

    fn plan_group_by(&mut self, namespace: &str, metric_name: &str) -> Result<()> {
        let mut group_by = Vec::with_capacity(self.ctx.query.group_by.len());
        for tag_key in &self.ctx.query.group_by {
            let id = self.metadata.tag_key_id(namespace, metric_name, tag_key)?;
            group_by.push(TagKeyMeta::new(id, tag_key.clone()));
        }
        self.ctx.group_by_tag_value_ids = group_by
            .iter()
            .map(|_| Mutex::new(RoaringBitmap::new()))
            .collect();
        self.ctx.group_by = group_by;
        Ok(())
    }

    fn plan_expr(&mut self, expr: &Expr, function: Option<FunctionType>) -> Result<()> {
        match expr {
            Expr::Field(name) => {
                let field = self.metadata.field(
                    &self.ctx.query.namespace,
                    &self.ctx.query.metric_name,
                    name,
                )?;
                let function = function.unwrap_or_else(|| field.field_type.default_function());
                if !field.field_type.supports(function) {
                    return Err(QueryError::InvalidQuery(format!(
                        "Function {} not supported by field '{}' of type {:?}",
                        function, field.name, field.field_type
                    )));
                }
                self.add_field(field, function)
            }
            Expr::Call {
                function: FunctionType::Quantile,
                args,
            } => self.plan_quantile(args),
            Expr::Call { function, args } => {
                for arg in args {
                    self.plan_expr(arg, Some(*function))?;
                }
                Ok(())
            }
            Expr::Number(_) => Ok(()),
            Expr::Paren(inner) => self.plan_expr(inner, function),
            Expr::Binary { left, right, .. } => {
                self.plan_expr(left, function)?;
                self.plan_expr(right, function)
            }
        }
    }

    /// `quantile(p)` reads every histogram bucket field with `sum`
    fn plan_quantile(&mut self, args: &[Expr]) -> Result<()> {
        let p = match args {
            [Expr::Number(p)] => *p,
            [_] => {
                return Err(QueryError::InvalidQuery(
                    "quantile parameter must be a number".to_string(),
                ))
            }
            _ => {
                return Err(QueryError::InvalidQuery(format!(
                    "quantile takes exactly one parameter, got {}",
                    args.len()
                )))
            }
        };
        if !(p > 0.0 && p < 1.0) {
            return Err(QueryError::InvalidQuery(format!(
                "quantile parameter {} out of range (0, 1)",
                p
            )));
        }

        let buckets: Vec<FieldMeta> = self
            .metadata
            .fields(&self.ctx.query.namespace, &self.ctx.query.metric_name)?
            .into_iter()
            .filter(FieldMeta::is_histogram_bucket)
            .collect();
        if buckets.is_empty() {
            return Err(QueryError::InvalidQuery(format!(
                "Metric '{}' has no histogram bucket field",
                self.ctx.query.metric_name
            )));
        }
        for bucket in buckets {
            self.add_field(bucket, FunctionType::Sum)?;
        }
        Ok(())
    }

    fn add_field(&mut self, field: FieldMeta, function: FunctionType) -> Result<()> {
        self.specs
            .entry(field.id)
            .or_insert_with(|| AggregatorSpec::new(&field))
            .add_function(function)?;
        self.fields.entry(field.id).or_insert(field);
        Ok(())
    }
}
