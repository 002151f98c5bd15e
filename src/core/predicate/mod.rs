//! Predicate engine: boolean expression trees evaluated against an exchange.
//!
//! Leaves are [`RoutePredicate`] trait objects, so predicates supplied by
//! embedders are indistinguishable from the built-in atoms in [`atoms`].
//! `And` and `Or` evaluate their left operand first and skip the right one
//! when it cannot change the result.
pub mod atoms;
pub mod pattern;
pub mod weight;

use std::{collections::HashMap, fmt, sync::Arc};

use crate::core::exchange::Exchange;

/// A single match condition.
pub trait RoutePredicate: Send + Sync {
    /// Evaluate against the exchange. Atoms that bind template variables
    /// write them into `variables` when they return `true`.
    fn test(&self, exchange: &Exchange, variables: &mut HashMap<String, String>) -> bool;

    fn describe(&self) -> String;
}

#[derive(Clone)]
pub enum PredicateNode {
    Atom(Arc<dyn RoutePredicate>),
    And(Box<PredicateNode>, Box<PredicateNode>),
    Or(Box<PredicateNode>, Box<PredicateNode>),
    Negate(Box<PredicateNode>),
}

impl PredicateNode {
    pub fn atom(predicate: impl RoutePredicate + 'static) -> Self {
        PredicateNode::Atom(Arc::new(predicate))
    }

    /// Matches every exchange.
    pub fn always() -> Self {
        PredicateNode::atom(Always)
    }

    pub fn and(self, other: PredicateNode) -> Self {
        PredicateNode::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: PredicateNode) -> Self {
        PredicateNode::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        PredicateNode::Negate(Box::new(self))
    }

    /// Variables from a branch are only kept if that branch decides the
    /// overall result as a match.
    pub fn evaluate(&self, exchange: &Exchange, variables: &mut HashMap<String, String>) -> bool {
        match self {
            PredicateNode::Atom(predicate) => predicate.test(exchange, variables),
            PredicateNode::And(left, right) => {
                let mut scratch = HashMap::new();
                if left.evaluate(exchange, &mut scratch) && right.evaluate(exchange, &mut scratch) {
                    variables.extend(scratch);
                    true
                } else {
                    false
                }
            }
            PredicateNode::Or(left, right) => {
                let mut scratch = HashMap::new();
                if left.evaluate(exchange, &mut scratch) {
                    variables.extend(scratch);
                    return true;
                }
                scratch.clear();
                if right.evaluate(exchange, &mut scratch) {
                    variables.extend(scratch);
                    return true;
                }
                false
            }
            PredicateNode::Negate(inner) => !inner.evaluate(exchange, &mut HashMap::new()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            PredicateNode::Atom(predicate) => predicate.describe(),
            PredicateNode::And(left, right) => {
                format!("({} && {})", left.describe(), right.describe())
            }
            PredicateNode::Or(left, right) => {
                format!("({} || {})", left.describe(), right.describe())
            }
            PredicateNode::Negate(inner) => format!("!{}", inner.describe()),
        }
    }
}

impl fmt::Debug for PredicateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

struct Always;

impl RoutePredicate for Always {
    fn test(&self, _exchange: &Exchange, _variables: &mut HashMap<String, String>) -> bool {
        true
    }

    fn describe(&self) -> String {
        "Always".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Body;
    use http::{Method, Uri};

    use super::*;
    use crate::core::exchange::GatewayRequest;

    struct Fixed {
        result: bool,
        calls: Arc<AtomicUsize>,
        binds: Option<(&'static str, &'static str)>,
    }

    impl RoutePredicate for Fixed {
        fn test(&self, _exchange: &Exchange, variables: &mut HashMap<String, String>) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some((name, value)) = self.binds {
                variables.insert(name.to_string(), value.to_string());
            }
            self.result
        }

        fn describe(&self) -> String {
            format!("Fixed: {}", self.result)
        }
    }

    fn fixed(result: bool, calls: &Arc<AtomicUsize>) -> PredicateNode {
        PredicateNode::atom(Fixed {
            result,
            calls: calls.clone(),
            binds: None,
        })
    }

    fn exchange() -> Exchange {
        Exchange::new(
            GatewayRequest::new(Method::GET, Uri::from_static("/")),
            Body::empty(),
        )
    }

    #[test]
    fn test_and_short_circuits() {
        let left = Arc::new(AtomicUsize::new(0));
        let right = Arc::new(AtomicUsize::new(0));
        let node = fixed(false, &left).and(fixed(true, &right));

        assert!(!node.evaluate(&exchange(), &mut HashMap::new()));
        assert_eq!(left.load(Ordering::SeqCst), 1);
        assert_eq!(right.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_or_short_circuits() {
        let left = Arc::new(AtomicUsize::new(0));
        let right = Arc::new(AtomicUsize::new(0));
        let node = fixed(true, &left).or(fixed(false, &right));

        assert!(node.evaluate(&exchange(), &mut HashMap::new()));
        assert_eq!(right.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_branch_does_not_leak_variables() {
        let calls = Arc::new(AtomicUsize::new(0));
        let binding = PredicateNode::atom(Fixed {
            result: true,
            calls: calls.clone(),
            binds: Some(("id", "1")),
        });
        let node = binding.and(fixed(false, &calls)).or(PredicateNode::always());

        let mut variables = HashMap::new();
        assert!(node.evaluate(&exchange(), &mut variables));
        assert!(variables.is_empty());
    }

    #[test]
    fn test_negate_and_describe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let node = fixed(true, &calls).and(fixed(false, &calls).negate());
        assert!(node.evaluate(&exchange(), &mut HashMap::new()));
        assert_eq!(node.describe(), "(Fixed: true && !Fixed: false)");
    }
}
