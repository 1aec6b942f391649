//! Boundary contract with the calculation/expression layer.
//!
//! The expression parser and optimizer live outside this crate. They hand the
//! engine `CalculationRule` values: a list of argument paths plus an
//! evaluation that yields the item's shape and a reusable compute function.
//!
//! # Invariants
//! - The engine resolves every argument before calling into a rule, and holds
//!   no registry lock or item state lock while the rule runs.
//! - A rule never receives engine handles; it sees argument metadata and
//!   argument values only.

use crate::model::item::{ItemId, ItemKind, MetaDescriptor, ValueType, Values};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Rule evaluation failure reported by the calculation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleError {
    pub message: String,
}

impl RuleError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Display for RuleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl Error for RuleError {}

/// Item being evaluated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleTarget {
    pub id: ItemId,
    pub path: String,
    pub kind: ItemKind,
    /// Declared value type for attributes.
    pub value_type: Option<ValueType>,
}

/// Structural metadata of one resolved argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentMeta {
    pub id: ItemId,
    pub path: String,
    pub meta: MetaDescriptor,
}

/// Shape produced by a rule at meta time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleShape {
    Domain { count: u32 },
    Attribute { value_type: ValueType },
}

/// Compute function produced at meta time and run at data time.
///
/// Receives one value array per argument in declaration order; domain-unit
/// arguments arrive as their index sequence.
pub type ComputeFn = Arc<dyn Fn(&[Arc<Values>]) -> Result<Values, RuleError> + Send + Sync>;

/// Outcome of evaluating a rule against its arguments' metadata.
#[derive(Clone)]
pub struct Evaluation {
    pub shape: RuleShape,
    pub compute: Option<ComputeFn>,
}

impl std::fmt::Debug for Evaluation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluation")
            .field("shape", &self.shape)
            .field("compute", &self.compute.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Calculation rule attached to one item.
pub trait CalculationRule: Send + Sync {
    /// Argument item paths, absolute or relative to the item's parent.
    fn arguments(&self) -> Vec<String>;

    /// Establishes the item's shape from its arguments' structure.
    fn evaluate(
        &self,
        target: &RuleTarget,
        arguments: &[ArgumentMeta],
    ) -> Result<Evaluation, RuleError>;
}

/// Resolves expression text from a configuration into a rule.
pub trait RuleResolver {
    fn resolve(&self, item_path: &str, expr: &str) -> Result<Arc<dyn CalculationRule>, RuleError>;
}

/// Resolver for configurations without expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRules;

impl RuleResolver for NoRules {
    fn resolve(&self, item_path: &str, expr: &str) -> Result<Arc<dyn CalculationRule>, RuleError> {
        Err(RuleError::new(format!(
            "no rule resolver configured for `{item_path}` (expr `{expr}`)"
        )))
    }
}

/// Closure-backed rule for attributes computed element-wise from arguments.
pub struct FnRule {
    arguments: Vec<String>,
    value_type: ValueType,
    compute: ComputeFn,
}

impl FnRule {
    pub fn new(
        arguments: Vec<String>,
        value_type: ValueType,
        compute: impl Fn(&[Arc<Values>]) -> Result<Values, RuleError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            arguments,
            value_type,
            compute: Arc::new(compute),
        }
    }
}

impl CalculationRule for FnRule {
    fn arguments(&self) -> Vec<String> {
        self.arguments.clone()
    }

    fn evaluate(
        &self,
        _target: &RuleTarget,
        _arguments: &[ArgumentMeta],
    ) -> Result<Evaluation, RuleError> {
        Ok(Evaluation {
            shape: RuleShape::Attribute {
                value_type: self.value_type,
            },
            compute: Some(Arc::clone(&self.compute)),
        })
    }
}

/// Rule producing a domain unit whose count is derived from its arguments'
/// structure.
pub struct DomainCountRule {
    arguments: Vec<String>,
    count: Arc<dyn Fn(&[ArgumentMeta]) -> Result<u32, RuleError> + Send + Sync>,
}

impl DomainCountRule {
    pub fn new(
        arguments: Vec<String>,
        count: impl Fn(&[ArgumentMeta]) -> Result<u32, RuleError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            arguments,
            count: Arc::new(count),
        }
    }
}

impl CalculationRule for DomainCountRule {
    fn arguments(&self) -> Vec<String> {
        self.arguments.clone()
    }

    fn evaluate(
        &self,
        _target: &RuleTarget,
        arguments: &[ArgumentMeta],
    ) -> Result<Evaluation, RuleError> {
        Ok(Evaluation {
            shape: RuleShape::Domain {
                count: (self.count)(arguments)?,
            },
            compute: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ArgumentMeta, CalculationRule, DomainCountRule, FnRule, NoRules, RuleError,
        RuleResolver, RuleShape, RuleTarget,
    };
    use crate::model::item::{DomainRange, ItemKind, MetaDescriptor, ValueType, Values};
    use std::sync::Arc;
    use uuid::Uuid;

    fn target() -> RuleTarget {
        RuleTarget {
            id: Uuid::new_v4(),
            path: "/a".to_string(),
            kind: ItemKind::Attribute,
            value_type: Some(ValueType::Int32),
        }
    }

    #[test]
    fn fn_rule_exposes_shape_and_compute() {
        let rule = FnRule::new(vec!["b".to_string()], ValueType::Int32, |args| {
            match args[0].as_ref() {
                Values::Int32(values) => Ok(Values::Int32(values.iter().map(|v| v * 2).collect())),
                other => Err(RuleError::new(format!("unexpected {}", other.value_type()))),
            }
        });
        let evaluation = rule.evaluate(&target(), &[]).expect("evaluate");
        assert_eq!(
            evaluation.shape,
            RuleShape::Attribute {
                value_type: ValueType::Int32
            }
        );
        let compute = evaluation.compute.expect("compute fn");
        let out = compute(&[Arc::new(Values::Int32(vec![1, 2]))]).expect("compute");
        assert_eq!(out, Values::Int32(vec![2, 4]));
    }

    #[test]
    fn domain_count_rule_reads_argument_structure() {
        let rule = DomainCountRule::new(vec!["/u".to_string()], |args| {
            args.first()
                .and_then(|arg| arg.meta.element_count())
                .map(|count| count * 2)
                .ok_or_else(|| RuleError::new("missing argument"))
        });
        let arg = ArgumentMeta {
            id: Uuid::new_v4(),
            path: "/u".to_string(),
            meta: MetaDescriptor::Domain {
                range: DomainRange::new(4),
                element_type: ValueType::UInt32,
            },
        };
        let evaluation = rule.evaluate(&target(), &[arg]).expect("evaluate");
        assert_eq!(evaluation.shape, RuleShape::Domain { count: 8 });
        assert!(evaluation.compute.is_none());
    }

    #[test]
    fn no_rules_resolver_rejects_expressions() {
        let err = NoRules.resolve("/a", "b * 2").err().expect("must fail");
        assert!(err.message.contains("/a"));
    }
}
