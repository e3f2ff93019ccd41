use std::time::{Duration, Instant};
use thiserror::Error;

use super::opcode::Opcode;
use super::value::{Constraint, Term, Word};

/// Extra assertion added on top of the path constraints of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposition {
    /// The two words differ.
    Distinct(Word, Word),
}

/// Conjunction of path constraints and propositions.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub constraints: Vec<Constraint>,
    pub propositions: Vec<Proposition>,
}

impl Query {
    pub fn new(constraints: &[Constraint]) -> Self {
        Query {
            constraints: constraints.to_vec(),
            propositions: Vec::new(),
        }
    }

    pub fn distinct(mut self, a: &Word, b: &Word) -> Self {
        self.propositions.push(Proposition::Distinct(a.clone(), b.clone()));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Satisfiability {
    Unsat,
    Sat,
    Unknown,
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("solver timed out after {0:?}")]
    Timeout(Duration),
    #[error("solver failure: {0}")]
    Solver(String),
}

/// Constraint-satisfiability oracle of the execution engine. Calls block.
pub trait ConstraintOracle {
    fn check(&self, query: &Query) -> Result<Satisfiability, OracleError>;

    /// Whether `query` was proven unsatisfiable. Timeouts, failures and unknown
    /// verdicts count as not proven.
    fn proves_unsat(&self, query: &Query) -> bool {
        match self.check(query) {
            Ok(Satisfiability::Unsat) => true,
            Ok(_) => false,
            Err(e) => {
                tracing::debug!("Constraint oracle gave up: {}", e);
                false
            }
        }
    }
}

/// Oracle reasoning on term identity only.
///
/// A query is unsat when it asserts two identical terms distinct, when a path
/// constraint `eq(a, b)` that holds contradicts `a != b`, or when the same
/// condition is asserted both ways. Everything else is `Unknown`.
#[derive(Debug, Clone)]
pub struct StructuralOracle {
    timeout: Duration,
}

impl StructuralOracle {
    pub fn new(timeout: Duration) -> Self {
        StructuralOracle { timeout }
    }

    fn asserted_equal(constraints: &[Constraint], a: &Word, b: &Word) -> bool {
        constraints.iter().any(|c| {
            let (cond, holds) = strip_iszero(&c.condition, c.holds);
            match (&**cond, holds) {
                (Term::Binary(Opcode::EQ, x, y), true) => (x == a && y == b) || (x == b && y == a),
                _ => false,
            }
        })
    }
}

/// Peels `iszero` wrappers, flipping the polarity for each one.
fn strip_iszero(word: &Word, holds: bool) -> (&Word, bool) {
    match &**word {
        Term::Unary(Opcode::ISZERO, inner) => {
            let (w, h) = strip_iszero(inner, !holds);
            (w, h)
        }
        _ => (word, holds),
    }
}

impl Default for StructuralOracle {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ConstraintOracle for StructuralOracle {
    fn check(&self, query: &Query) -> Result<Satisfiability, OracleError> {
        let started = Instant::now();

        for (i, c) in query.constraints.iter().enumerate() {
            if started.elapsed() >= self.timeout {
                return Err(OracleError::Timeout(self.timeout));
            }
            if let Some(v) = c.condition.as_const() {
                if v.is_zero() == c.holds {
                    return Ok(Satisfiability::Unsat);
                }
            }
            let (cond, holds) = strip_iszero(&c.condition, c.holds);
            let contradicted = query.constraints[i + 1..].iter().any(|other| {
                let (o_cond, o_holds) = strip_iszero(&other.condition, other.holds);
                o_cond == cond && o_holds != holds
            });
            if contradicted {
                return Ok(Satisfiability::Unsat);
            }
        }

        for proposition in &query.propositions {
            if started.elapsed() >= self.timeout {
                return Err(OracleError::Timeout(self.timeout));
            }
            match proposition {
                Proposition::Distinct(a, b) => {
                    if a == b || Self::asserted_equal(&query.constraints, a, b) {
                        return Ok(Satisfiability::Unsat);
                    }
                }
            }
        }

        Ok(Satisfiability::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn caller() -> Word {
        Rc::new(Term::Env(Opcode::CALLER))
    }

    fn slot(index: u64) -> Word {
        Rc::new(Term::Storage(Term::from_u64(index)))
    }

    #[test]
    fn test_identical_terms_cannot_differ() {
        let oracle = StructuralOracle::default();
        let query = Query::new(&[]).distinct(&caller(), &caller());
        assert_eq!(oracle.check(&query).unwrap(), Satisfiability::Unsat);
        assert!(oracle.proves_unsat(&query));
    }

    #[test]
    fn test_different_terms_are_not_proven() {
        let oracle = StructuralOracle::default();
        let query = Query::new(&[]).distinct(&caller(), &slot(0));
        assert_eq!(oracle.check(&query).unwrap(), Satisfiability::Unknown);
        assert!(!oracle.proves_unsat(&query));
    }

    #[test]
    fn test_path_equality_constraint_is_used() {
        let oracle = StructuralOracle::default();
        let eq = Term::binary(Opcode::EQ, &caller(), &slot(0));
        let guard = Constraint::new(Term::unary(Opcode::ISZERO, &Term::unary(Opcode::ISZERO, &eq)), true);
        let query = Query::new(&[guard]).distinct(&slot(0), &caller());
        assert!(oracle.proves_unsat(&query));
    }

    #[test]
    fn test_contradicting_constraints() {
        let oracle = StructuralOracle::default();
        let eq = Term::binary(Opcode::EQ, &caller(), &slot(1));
        let query = Query::new(&[Constraint::new(eq.clone(), true), Constraint::new(eq, false)]);
        assert!(oracle.proves_unsat(&query));
    }

    #[test]
    fn test_timeout_is_not_proof() {
        let oracle = StructuralOracle::new(Duration::ZERO);
        let query = Query::new(&[Constraint::new(caller(), true)]).distinct(&caller(), &caller());
        assert!(!oracle.proves_unsat(&query));
    }
}
