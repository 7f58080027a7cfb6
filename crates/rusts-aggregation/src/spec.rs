//! Per-field aggregation specs

use crate::error::{AggregationError, Result};
use rusts_core::{FieldId, FieldMeta, FieldType, FunctionType};
use serde::{Deserialize, Serialize};

/// Functions applied to one field.
///
/// The same list drives down-sampling within a series and aggregation
/// across the series of a group. Functions are kept sorted and unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatorSpec {
    pub field_id: FieldId,
    pub field_name: String,
    pub field_type: FieldType,
    functions: Vec<FunctionType>,
}

impl AggregatorSpec {
    pub fn new(field: &FieldMeta) -> Self {
        Self {
            field_id: field.id,
            field_name: field.name.clone(),
            field_type: field.field_type,
            functions: Vec::new(),
        }
    }

    /// Add a function; adding a known function is a no-op
    pub fn add_function(&mut self, function: FunctionType) -> Result<()> {
        if function == FunctionType::Quantile {
            return Err(AggregationError::InvalidDefinition(format!(
                "quantile cannot be applied to field '{}' directly",
                self.field_name
            )));
        }
        if let Err(pos) = self.functions.binary_search(&function) {
            self.functions.insert(pos, function);
        }
        Ok(())
    }

    pub fn functions(&self) -> &[FunctionType] {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_functions_sorted_and_unique() {
        let mut spec = AggregatorSpec::new(&FieldMeta::new(3, "usage", FieldType::Sum));
        spec.add_function(FunctionType::Max).unwrap();
        spec.add_function(FunctionType::Sum).unwrap();
        spec.add_function(FunctionType::Max).unwrap();
        assert_eq!(spec.functions(), &[FunctionType::Sum, FunctionType::Max]);
        assert!(spec.add_function(FunctionType::Quantile).is_err());
    }
}
