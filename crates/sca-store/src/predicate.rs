//! Filter compilation.
//!
//! [`ResultSpecification::compile`] classifies every descriptor first and only
//! then renders SQL, so a bad filter never reaches a prepared statement.
//! Fault predicates apply to the `f` (fault_results) alias. Feeder predicates
//! in parent scope apply to the joined `fr` row and are AND-combined on that
//! one row. Child-display predicates are kept apart and applied to the `d`
//! alias of the display query.

use rusqlite::types::Value;

use sca_core::filter::{Entity, Operand, ValidatedFilter};
use sca_core::{FilterDescriptor, FilterError, FilterOperator, FilterScope};

pub(crate) const FAULT_ALIAS: &str = "f";
pub(crate) const JOINED_FEEDER_ALIAS: &str = "fr";
pub(crate) const DISPLAY_FEEDER_ALIAS: &str = "d";

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlFragment {
    fn and(&mut self, clause: &str) {
        if !self.sql.is_empty() {
            self.sql.push_str(" AND ");
        }
        self.sql.push_str(clause);
    }
}

/// Compiled filters for one result-tree query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSpecification {
    fault: Vec<ValidatedFilter>,
    joined_feeder: Vec<ValidatedFilter>,
    display: Vec<ValidatedFilter>,
}

impl ResultSpecification {
    pub fn compile(filters: &[FilterDescriptor]) -> Result<Self, FilterError> {
        let mut spec = Self::default();
        for descriptor in filters {
            let filter = descriptor.validate()?;
            match (filter.field.entity, filter.scope) {
                (Entity::Fault, _) => spec.fault.push(filter),
                (Entity::Feeder, FilterScope::Parent) => spec.joined_feeder.push(filter),
                (Entity::Feeder, FilterScope::ChildDisplay) => spec.display.push(filter),
            }
        }
        // Render once up front so operator/operand mismatches surface here.
        spec.where_clause(0)?;
        spec.display_clause()?;
        Ok(spec)
    }

    /// The identity query needs the feeder join.
    pub fn joins_feeders(&self) -> bool {
        !self.joined_feeder.is_empty()
    }

    pub fn has_display_filters(&self) -> bool {
        !self.display.is_empty()
    }

    /// Restriction on parents: the result id constraint AND every fault and
    /// parent-scope feeder predicate.
    pub fn where_clause(&self, result_id: i64) -> Result<SqlFragment, FilterError> {
        let mut out = SqlFragment::default();
        out.and(&format!("{FAULT_ALIAS}.result_id = ?"));
        out.params.push(Value::Integer(result_id));
        for filter in &self.fault {
            render(FAULT_ALIAS, filter, &mut out)?;
        }
        for filter in &self.joined_feeder {
            render(JOINED_FEEDER_ALIAS, filter, &mut out)?;
        }
        Ok(out)
    }

    /// Predicates a displayed feeder must satisfy, or `None` when every
    /// feeder is displayed.
    pub fn display_clause(&self) -> Result<Option<SqlFragment>, FilterError> {
        if self.display.is_empty() {
            return Ok(None);
        }
        let mut out = SqlFragment::default();
        for filter in &self.display {
            render(DISPLAY_FEEDER_ALIAS, filter, &mut out)?;
        }
        Ok(Some(out))
    }
}

fn render(alias: &str, filter: &ValidatedFilter, out: &mut SqlFragment) -> Result<(), FilterError> {
    let column = format!("{alias}.{}", filter.field.column);
    match (filter.operator, &filter.operand) {
        (FilterOperator::Equals, Operand::Null) => out.and("0 = 1"),
        (FilterOperator::Equals, Operand::Text(value)) => {
            out.and(&format!("{column} = ?"));
            out.params.push(Value::Text(value.clone()));
        }
        (FilterOperator::Equals, Operand::TextList(values)) if values.is_empty() => out.and("0 = 1"),
        (FilterOperator::Equals, Operand::TextList(values)) => {
            let alternatives = vec![format!("{column} = ?"); values.len()].join(" OR ");
            out.and(&format!("({alternatives})"));
            out.params
                .extend(values.iter().map(|value| Value::Text(value.clone())));
        }
        (FilterOperator::Contains, Operand::Text(value)) => {
            out.and(&format!("instr({column}, ?) > 0"));
            out.params.push(Value::Text(value.clone()));
        }
        (FilterOperator::StartsWith, Operand::Text(value)) => {
            out.and(&format!("substr({column}, 1, length(?)) = ?"));
            out.params.push(Value::Text(value.clone()));
            out.params.push(Value::Text(value.clone()));
        }
        (FilterOperator::NotEqual, Operand::Text(value)) => {
            out.and(&format!("{column} <> ?"));
            out.params.push(Value::Text(value.clone()));
        }
        (FilterOperator::NotEqual, Operand::Number(value)) => {
            out.and(&format!("{column} <> ?"));
            out.params.push(Value::Real(*value));
        }
        (FilterOperator::LessThanOrEqual, Operand::Number(value)) => {
            out.and(&format!("{column} <= ?"));
            out.params.push(Value::Real(*value));
        }
        (FilterOperator::GreaterThanOrEqual, Operand::Number(value)) => {
            out.and(&format!("{column} >= ?"));
            out.params.push(Value::Real(*value));
        }
        (operator, _) => {
            return Err(FilterError::InvalidValue {
                field: filter.field.path.to_string(),
                reason: format!("value does not fit operator {operator}"),
            })
        }
    }
    Ok(())
}
