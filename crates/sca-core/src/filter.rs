//! # Filter Descriptors
//!
//! A filter is `(field, data type, operator, value)` plus a scope. Fields are
//! dot-paths resolved against a fixed catalogue: `fault.*` and `summary.*`
//! address the fault record itself, `feeders.*` address its feeder children.
//!
//! [`FilterDescriptor::validate`] is the classification step. It rejects an
//! unknown field, a declared data type that disagrees with the catalogue, an
//! operator that is not defined for the data type, or a malformed value. It
//! never touches storage, so a bad filter fails before any query runs.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Text,
    Number,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "TEXT"),
            Self::Number => write!(f, "NUMBER"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterOperator {
    Equals,
    Contains,
    StartsWith,
    NotEqual,
    LessThanOrEqual,
    GreaterThanOrEqual,
}

impl FilterOperator {
    /// Operator/data-type pairing table.
    pub const fn supports(self, data_type: DataType) -> bool {
        match data_type {
            DataType::Text => matches!(
                self,
                Self::Equals | Self::Contains | Self::StartsWith | Self::NotEqual
            ),
            DataType::Number => matches!(
                self,
                Self::NotEqual | Self::LessThanOrEqual | Self::GreaterThanOrEqual
            ),
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Equals => "EQUALS",
            Self::Contains => "CONTAINS",
            Self::StartsWith => "STARTS_WITH",
            Self::NotEqual => "NOT_EQUAL",
            Self::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Self::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
        };
        f.write_str(name)
    }
}

/// What a filter on a feeder field does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FilterScope {
    /// Restricts which fault records are returned. On a feeder field a fault
    /// qualifies when at least one of its feeders matches; the feeder list
    /// itself is left untouched.
    #[default]
    Parent,
    /// Prunes the feeders displayed inside each returned fault record without
    /// restricting the fault records themselves. Feeder fields only.
    ChildDisplay,
}

/// A filter as received from a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub field: String,
    pub data_type: DataType,
    pub operator: FilterOperator,
    /// String, number, array of strings (TEXT `EQUALS` only) or null.
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub scope: FilterScope,
}

impl FilterDescriptor {
    pub fn text(field: impl Into<String>, operator: FilterOperator, value: &str) -> Self {
        Self {
            field: field.into(),
            data_type: DataType::Text,
            operator,
            value: serde_json::Value::String(value.to_string()),
            scope: FilterScope::Parent,
        }
    }

    pub fn number(field: impl Into<String>, operator: FilterOperator, value: f64) -> Self {
        Self {
            field: field.into(),
            data_type: DataType::Number,
            operator,
            value: serde_json::json!(value),
            scope: FilterScope::Parent,
        }
    }

    pub fn with_scope(mut self, scope: FilterScope) -> Self {
        self.scope = scope;
        self
    }

    /// Classify the filter against the field catalogue.
    pub fn validate(&self) -> Result<ValidatedFilter, FilterError> {
        let field = lookup_field(&self.field)
            .ok_or_else(|| FilterError::UnknownField(self.field.clone()))?;

        if field.data_type != self.data_type {
            return Err(FilterError::DataTypeMismatch {
                field: self.field.clone(),
                declared: self.data_type,
                actual: field.data_type,
            });
        }
        if !self.operator.supports(self.data_type) {
            return Err(FilterError::UnsupportedOperator {
                field: self.field.clone(),
                operator: self.operator,
                data_type: self.data_type,
            });
        }
        if self.scope == FilterScope::ChildDisplay && field.entity != Entity::Feeder {
            return Err(FilterError::ChildScopeOnParent(self.field.clone()));
        }

        let operand = self.operand()?;
        Ok(ValidatedFilter {
            field,
            operator: self.operator,
            operand,
            scope: self.scope,
        })
    }

    fn operand(&self) -> Result<Operand, FilterError> {
        use serde_json::Value;

        let invalid = |reason: &str| FilterError::InvalidValue {
            field: self.field.clone(),
            reason: reason.to_string(),
        };

        match (self.data_type, self.operator, &self.value) {
            // Kept quirk: a null EQUALS matches nothing.
            (DataType::Text, FilterOperator::Equals, Value::Null) => Ok(Operand::Null),
            (DataType::Text, FilterOperator::Equals, Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    _ => Err(invalid("EQUALS list entries must be strings")),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Operand::TextList),
            (DataType::Text, _, Value::String(s)) => Ok(Operand::Text(s.clone())),
            (DataType::Text, _, _) => Err(invalid("expected a string")),
            (DataType::Number, _, Value::Number(n)) => n
                .as_f64()
                .map(Operand::Number)
                .ok_or_else(|| invalid("number out of range")),
            (DataType::Number, _, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(Operand::Number)
                .ok_or_else(|| invalid("expected a number")),
            (DataType::Number, _, _) => Err(invalid("expected a number")),
        }
    }
}

/// A filter that passed classification.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedFilter {
    pub field: &'static FieldSpec,
    pub operator: FilterOperator,
    pub operand: Operand,
    pub scope: FilterScope,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Null,
    Text(String),
    TextList(Vec<String>),
    Number(f64),
}

// =============================================================================
// Field catalogue
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Fault,
    Feeder,
}

/// One addressable field: where it lives and how it compares.
#[derive(Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub path: &'static str,
    pub entity: Entity,
    pub column: &'static str,
    pub data_type: DataType,
}

/// The fault record's stable identity, used as the pagination tie-breaker.
pub const FAULT_IDENTITY: &FieldSpec = &FIELDS[0];

/// Default feeder display order: `feeders.current` descending.
pub const DEFAULT_FEEDER_SORT: &FieldSpec = &FIELDS[6];

pub const FIELDS: &[FieldSpec] = &[
    FieldSpec {
        path: "id",
        entity: Entity::Fault,
        column: "id",
        data_type: DataType::Number,
    },
    FieldSpec {
        path: "fault.id",
        entity: Entity::Fault,
        column: "fault_id",
        data_type: DataType::Text,
    },
    FieldSpec {
        path: "fault.type",
        entity: Entity::Fault,
        column: "fault_type",
        data_type: DataType::Text,
    },
    FieldSpec {
        path: "summary.current",
        entity: Entity::Fault,
        column: "current",
        data_type: DataType::Number,
    },
    FieldSpec {
        path: "summary.power",
        entity: Entity::Fault,
        column: "power",
        data_type: DataType::Number,
    },
    FieldSpec {
        path: "feeders.id",
        entity: Entity::Feeder,
        column: "connectable_id",
        data_type: DataType::Text,
    },
    FieldSpec {
        path: "feeders.current",
        entity: Entity::Feeder,
        column: "current",
        data_type: DataType::Number,
    },
    FieldSpec {
        path: "feeders.voltage",
        entity: Entity::Feeder,
        column: "voltage",
        data_type: DataType::Number,
    },
];

pub fn lookup_field(path: &str) -> Option<&'static FieldSpec> {
    let path = path.trim();
    FIELDS.iter().find(|f| f.path == path)
}

// =============================================================================
// Errors
// =============================================================================

/// Classification errors. Raised before any storage access.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("unknown field '{0}'")]
    UnknownField(String),
    #[error("field '{field}' is {actual}, filter declares {declared}")]
    DataTypeMismatch {
        field: String,
        declared: DataType,
        actual: DataType,
    },
    #[error("operator {operator} is not valid for {data_type} field '{field}'")]
    UnsupportedOperator {
        field: String,
        operator: FilterOperator,
        data_type: DataType,
    },
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("child display scope needs a feeder field, got '{0}'")]
    ChildScopeOnParent(String),
    #[error("at most one feeder sort key is supported")]
    MultipleChildSorts,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_table() {
        assert!(FilterOperator::StartsWith.supports(DataType::Text));
        assert!(!FilterOperator::StartsWith.supports(DataType::Number));
        assert!(!FilterOperator::Equals.supports(DataType::Number));
        assert!(!FilterOperator::LessThanOrEqual.supports(DataType::Text));
        assert!(FilterOperator::NotEqual.supports(DataType::Text));
        assert!(FilterOperator::NotEqual.supports(DataType::Number));
    }

    #[test]
    fn test_catalogue_anchors() {
        assert_eq!(FAULT_IDENTITY.path, "id");
        assert_eq!(DEFAULT_FEEDER_SORT.path, "feeders.current");
        assert_eq!(DEFAULT_FEEDER_SORT.entity, Entity::Feeder);
    }

    #[test]
    fn test_starts_with_on_number_is_rejected() {
        let filter = FilterDescriptor {
            field: "summary.current".into(),
            data_type: DataType::Number,
            operator: FilterOperator::StartsWith,
            value: json!("1"),
            scope: FilterScope::Parent,
        };
        assert!(matches!(
            filter.validate(),
            Err(FilterError::UnsupportedOperator { .. })
        ));
    }

    #[test]
    fn test_declared_type_must_match_catalogue() {
        let filter = FilterDescriptor::text("summary.power", FilterOperator::Equals, "x");
        assert!(matches!(
            filter.validate(),
            Err(FilterError::DataTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_field() {
        let filter = FilterDescriptor::text("feeders.name", FilterOperator::Equals, "x");
        assert_eq!(
            filter.validate(),
            Err(FilterError::UnknownField("feeders.name".into()))
        );
    }

    #[test]
    fn test_null_equals_is_kept_as_null_operand() {
        let filter = FilterDescriptor {
            field: "fault.id".into(),
            data_type: DataType::Text,
            operator: FilterOperator::Equals,
            value: serde_json::Value::Null,
            scope: FilterScope::Parent,
        };
        assert_eq!(filter.validate().unwrap().operand, Operand::Null);
    }

    #[test]
    fn test_equals_list() {
        let mut filter = FilterDescriptor::text("fault.id", FilterOperator::Equals, "");
        filter.value = json!(["BUS_1", "BUS_2"]);
        assert_eq!(
            filter.validate().unwrap().operand,
            Operand::TextList(vec!["BUS_1".into(), "BUS_2".into()])
        );

        filter.value = json!(["BUS_1", 2]);
        assert!(matches!(
            filter.validate(),
            Err(FilterError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_list_only_for_equals() {
        let mut filter = FilterDescriptor::text("fault.id", FilterOperator::Contains, "");
        filter.value = json!(["BUS"]);
        assert!(matches!(
            filter.validate(),
            Err(FilterError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_numeric_string_is_accepted() {
        let mut filter =
            FilterDescriptor::number("feeders.current", FilterOperator::GreaterThanOrEqual, 0.0);
        filter.value = json!(" 12.5 ");
        assert_eq!(filter.validate().unwrap().operand, Operand::Number(12.5));

        filter.value = json!("lots");
        assert!(filter.validate().is_err());
    }

    #[test]
    fn test_child_display_scope_needs_feeder_field() {
        let filter = FilterDescriptor::text("fault.id", FilterOperator::Contains, "BUS")
            .with_scope(FilterScope::ChildDisplay);
        assert_eq!(
            filter.validate(),
            Err(FilterError::ChildScopeOnParent("fault.id".into()))
        );

        let filter = FilterDescriptor::text("feeders.id", FilterOperator::Contains, "LINE")
            .with_scope(FilterScope::ChildDisplay);
        assert_eq!(filter.validate().unwrap().field.entity, Entity::Feeder);
    }

    #[test]
    fn test_descriptor_wire_shape() {
        let filter: FilterDescriptor = serde_json::from_value(json!({
            "field": "feeders.id",
            "data_type": "TEXT",
            "operator": "STARTS_WITH",
            "value": "LINE"
        }))
        .unwrap();
        assert_eq!(filter.scope, FilterScope::Parent);
        assert_eq!(filter.operator, FilterOperator::StartsWith);
    }
}
