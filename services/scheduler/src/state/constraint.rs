//! Placement constraints.
//!
//! The scheduler treats constraints as an opaque predicate over a slot and
//! an offer. [`SimpleConstraints`] understands conjunctions of equality
//! tests, which covers pinning to hosts and attributes:
//!
//! ```text
//! hostname == agent-3 and rack != r2 and zone == eu-1
//! ```
//!
//! Expressions and attribute values are compared lower-cased.

use berth_id::SlotId;
use thiserror::Error;

use super::offer::Offer;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    #[error("empty constraint expression")]
    Empty,

    #[error("malformed clause '{0}': expected '<field> <op> <value>'")]
    MalformedClause(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
}

/// Decides whether a slot may run on an offer.
pub trait ConstraintEvaluator: Send + Sync {
    /// Checks an expression without evaluating it.
    fn validate(&self, expr: &str) -> Result<(), ConstraintError>;

    /// Evaluates `expr` for `slot` against `offer`.
    fn matches(&self, expr: &str, slot: &SlotId, offer: &Offer) -> Result<bool, ConstraintError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Clause {
    field: String,
    op: Op,
    value: String,
}

/// Conjunctions of `==` / `!=` clauses over `hostname`, `agent_id` and
/// offer attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleConstraints;

impl SimpleConstraints {
    fn parse(expr: &str) -> Result<Vec<Clause>, ConstraintError> {
        let lowered = expr.to_lowercase();
        let tokens: Vec<&str> = lowered.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(ConstraintError::Empty);
        }

        tokens
            .split(|token| *token == "and")
            .map(|clause| match clause {
                [field, op, value] => {
                    let op = match *op {
                        "==" => Op::Eq,
                        "!=" => Op::Ne,
                        other => return Err(ConstraintError::UnknownOperator(other.to_string())),
                    };
                    Ok(Clause {
                        field: (*field).to_string(),
                        op,
                        value: (*value).to_string(),
                    })
                }
                other => Err(ConstraintError::MalformedClause(other.join(" "))),
            })
            .collect()
    }

    fn field_value(field: &str, offer: &Offer) -> Option<String> {
        match field {
            "hostname" => Some(offer.hostname.to_lowercase()),
            "agent_id" => Some(offer.agent_id.as_str().to_lowercase()),
            attr => offer
                .attributes
                .iter()
                .find(|(key, _)| key.to_lowercase() == attr)
                .map(|(_, value)| value.to_lowercase()),
        }
    }
}

impl ConstraintEvaluator for SimpleConstraints {
    fn validate(&self, expr: &str) -> Result<(), ConstraintError> {
        Self::parse(expr).map(|_| ())
    }

    fn matches(&self, expr: &str, _slot: &SlotId, offer: &Offer) -> Result<bool, ConstraintError> {
        let clauses = Self::parse(expr)?;
        Ok(clauses.iter().all(|clause| {
            let actual = Self::field_value(&clause.field, offer);
            match clause.op {
                Op::Eq => actual.as_deref() == Some(clause.value.as_str()),
                Op::Ne => actual.as_deref() != Some(clause.value.as_str()),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_id::{AgentId, AppId, OfferId};
    use rstest::rstest;
    use std::collections::BTreeMap;

    fn offer() -> Offer {
        Offer {
            id: OfferId::parse("o-1").unwrap(),
            agent_id: AgentId::parse("agent-7").unwrap(),
            hostname: "Node-A".to_string(),
            cpus: 1.0,
            mem: 1.0,
            disk: 0.0,
            ports: vec![],
            attributes: BTreeMap::from([("Rack".to_string(), "R1".to_string())]),
        }
    }

    fn slot() -> SlotId {
        SlotId::new(AppId::parse("web").unwrap(), 0)
    }

    #[rstest]
    #[case("hostname == node-a", true)]
    #[case("HOSTNAME == NODE-A", true)]
    #[case("hostname != node-a", false)]
    #[case("rack == r1 and agent_id == agent-7", true)]
    #[case("rack == r1 and hostname == node-b", false)]
    #[case("zone != eu-1", true)]
    #[case("zone == eu-1", false)]
    fn test_simple_constraints(#[case] expr: &str, #[case] expected: bool) {
        assert_eq!(
            SimpleConstraints.matches(expr, &slot(), &offer()).unwrap(),
            expected
        );
    }

    #[rstest]
    #[case("", ConstraintError::Empty)]
    #[case("hostname node-a", ConstraintError::MalformedClause("hostname node-a".to_string()))]
    #[case("hostname ~= node", ConstraintError::UnknownOperator("~=".to_string()))]
    #[case("rack == r1 and", ConstraintError::MalformedClause(String::new()))]
    fn test_malformed_constraints(#[case] expr: &str, #[case] expected: ConstraintError) {
        assert_eq!(SimpleConstraints.validate(expr), Err(expected));
    }
}
