pub mod arrow;
pub mod series_summary;
pub mod types;

pub use arrow::{build_arrow_schema, map_to_arrow_type};
pub use types::{check_contract, Field, FieldMode, FieldType, RenameMap, TargetSchema};
