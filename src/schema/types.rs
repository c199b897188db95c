// src/schema/types.rs

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{
    de::{MapAccess, Visitor},
    ser::SerializeMap,
    Deserialize, Deserializer, Serialize, Serializer,
};
use std::{collections::HashSet, fmt};

use crate::error::ConfigError;

static FIELD_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("field name pattern should compile"));

/// Warehouse column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Integer,
    Float,
    Boolean,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Float => "float",
            FieldType::Boolean => "boolean",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldMode {
    Nullable,
    Required,
}

/// A single column of the destination table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    pub description: String,
    pub mode: FieldMode,
}

impl Field {
    pub fn nullable_string(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            ty: FieldType::String,
            description: description.to_string(),
            mode: FieldMode::Nullable,
        }
    }
}

/// Ordered field list. Order is the CSV column order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TargetSchema {
    fields: Vec<Field>,
}

impl TargetSchema {
    /// Validates that the schema is non-empty and names are unique snake_case identifiers.
    pub fn new(fields: Vec<Field>) -> Result<Self, ConfigError> {
        if fields.is_empty() {
            return Err(ConfigError::InvalidSchema("schema has no fields".into()));
        }
        let mut seen = HashSet::new();
        for field in &fields {
            if !FIELD_NAME.is_match(&field.name) {
                return Err(ConfigError::InvalidSchema(format!(
                    "field name `{}` is not snake_case",
                    field.name
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ConfigError::InvalidSchema(format!(
                    "field `{}` declared twice",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<'de> Deserialize<'de> for TargetSchema {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let fields = Vec::<Field>::deserialize(deserializer)?;
        TargetSchema::new(fields).map_err(serde::de::Error::custom)
    }
}

/// Source header → canonical field name, in output order.
///
/// Serializes as a JSON object whose key order is the insertion order, which
/// is what the `RENAME_MAPPINGS` variable carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameMap {
    entries: Vec<(String, String)>,
}

impl RenameMap {
    /// Rejects repeated source names and repeated targets.
    pub fn new(entries: Vec<(String, String)>) -> Result<Self, ConfigError> {
        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for (from, to) in &entries {
            if !sources.insert(from.as_str()) {
                return Err(ConfigError::HeaderMismatch(format!(
                    "source column `{}` mapped twice",
                    from
                )));
            }
            if !targets.insert(to.as_str()) {
                return Err(ConfigError::HeaderMismatch(format!(
                    "target `{}` is the rename of more than one column",
                    to
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, source: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(from, _)| from == source)
            .map(|(_, to)| to.as_str())
    }

    /// Reverse lookup: which source column is renamed to `target`.
    pub fn source_for(&self, target: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, to)| to == target)
            .map(|(from, _)| from.as_str())
    }

    pub fn contains_source(&self, source: &str) -> bool {
        self.get(source).is_some()
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(from, _)| from.as_str())
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, to)| to.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for RenameMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (from, to) in &self.entries {
            map.serialize_entry(from, to)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for RenameMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct OrderedPairs;

        impl<'de> Visitor<'de> for OrderedPairs {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of source column to field name")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((from, to)) = access.next_entry::<String, String>()? {
                    entries.push((from, to));
                }
                Ok(entries)
            }
        }

        let entries = deserializer.deserialize_map(OrderedPairs)?;
        RenameMap::new(entries).map_err(serde::de::Error::custom)
    }
}

/// Checks the three-way contract: rename targets, in order, equal `headers`,
/// which equal the schema's field names.
pub fn check_contract(
    rename: &RenameMap,
    headers: &[String],
    schema: &TargetSchema,
) -> Result<(), ConfigError> {
    let targets: Vec<&str> = rename.targets().collect();
    if targets.len() != headers.len() || targets.iter().zip(headers).any(|(t, h)| t != h) {
        return Err(ConfigError::HeaderMismatch(format!(
            "rename targets {:?} differ from CSV headers {:?}",
            targets, headers
        )));
    }
    let names = schema.names();
    if names != headers {
        return Err(ConfigError::HeaderMismatch(format!(
            "CSV headers {:?} differ from schema fields {:?}",
            headers, names
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn rename_map_json_keeps_insertion_order() {
        let map = RenameMap::new(pairs(&[("Zeta", "zeta"), ("Alpha", "alpha")])).unwrap();
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"Zeta":"zeta","Alpha":"alpha"}"#);

        let back: RenameMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back.targets().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn rename_map_rejects_duplicate_targets() {
        let err = RenameMap::new(pairs(&[("A", "a"), ("B", "a")])).unwrap_err();
        assert!(matches!(err, ConfigError::HeaderMismatch(_)));
    }

    #[test]
    fn schema_rejects_non_snake_case_and_duplicates() {
        assert!(TargetSchema::new(vec![Field::nullable_string("Series Code", "")]).is_err());
        assert!(TargetSchema::new(vec![
            Field::nullable_string("a", ""),
            Field::nullable_string("a", ""),
        ])
        .is_err());
        assert!(TargetSchema::new(Vec::new()).is_err());
    }

    #[test]
    fn contract_detects_reordered_headers() {
        let rename = RenameMap::new(pairs(&[("A", "a"), ("B", "b")])).unwrap();
        let schema = TargetSchema::new(vec![
            Field::nullable_string("a", ""),
            Field::nullable_string("b", ""),
        ])
        .unwrap();

        let ok = vec!["a".to_string(), "b".to_string()];
        assert!(check_contract(&rename, &ok, &schema).is_ok());

        let swapped = vec!["b".to_string(), "a".to_string()];
        assert!(check_contract(&rename, &swapped, &schema).is_err());
    }

    #[test]
    fn field_serializes_like_warehouse_schema_json() {
        let field = Field::nullable_string("topic", "Subject.");
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["type"], "string");
        assert_eq!(json["mode"], "nullable");
    }
}
