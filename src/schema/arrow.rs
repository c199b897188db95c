// src/schema/arrow.rs

use arrow::datatypes::{DataType, Field as ArrowField, Schema as ArrowSchema};
use std::sync::Arc;

use super::types::{FieldMode, FieldType, TargetSchema};

/// Map a warehouse field type onto the Arrow type the local warehouse stores it as.
///
/// - string  → Utf8
/// - integer → Int64
/// - float   → Float64
/// - boolean → Boolean
pub fn map_to_arrow_type(ty: FieldType) -> DataType {
    match ty {
        FieldType::String => DataType::Utf8,
        FieldType::Integer => DataType::Int64,
        FieldType::Float => DataType::Float64,
        FieldType::Boolean => DataType::Boolean,
    }
}

/// Build an ArrowSchema (inside an Arc) from the target schema. Field order is kept.
pub fn build_arrow_schema(schema: &TargetSchema) -> Arc<ArrowSchema> {
    let fields: Vec<ArrowField> = schema
        .fields()
        .iter()
        .map(|field| {
            let nullable = field.mode == FieldMode::Nullable;
            ArrowField::new(&field.name, map_to_arrow_type(field.ty), nullable)
        })
        .collect();

    Arc::new(ArrowSchema::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{series_summary, Field};

    #[test]
    fn series_summary_is_all_nullable_utf8() {
        let arrow = build_arrow_schema(series_summary::schema());
        assert_eq!(arrow.fields().len(), 20);
        assert_eq!(arrow.field(0).name(), "series_code");
        assert!(arrow
            .fields()
            .iter()
            .all(|f| f.data_type() == &DataType::Utf8 && f.is_nullable()));
    }

    #[test]
    fn required_fields_are_not_nullable() {
        let schema = TargetSchema::new(vec![Field {
            name: "n".into(),
            ty: FieldType::Integer,
            description: String::new(),
            mode: FieldMode::Required,
        }])
        .unwrap();
        let arrow = build_arrow_schema(&schema);
        assert_eq!(arrow.field(0).data_type(), &DataType::Int64);
        assert!(!arrow.field(0).is_nullable());
    }
}
