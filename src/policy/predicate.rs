//! Argument predicate validation, folding and reference evaluation
//!
//! At build time a predicate is checked against the target ABI (argument
//! slots 0-5, constants within the word width) and reduced: atoms that can
//! never or always hold are folded away before code generation. The
//! `evaluate` methods give the reference meaning of a predicate; the
//! kernel runs the compiled program, these only back verification.

use super::arch::TargetArch;
use super::ast::{Clause, CmpOp, Comparison, Predicate};
use crate::error::{PolicyError, Result};

/// Highest argument slot in `struct seccomp_data`.
pub const MAX_ARG_INDEX: u8 = 5;

/// A predicate after folding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    /// Holds for every argument vector.
    Always,
    /// Holds for none.
    Never,
    Clauses(Vec<Clause>),
}

enum Fold {
    Always,
    Never,
    Keep(Comparison),
}

/// Validate a predicate for `arch` and fold it.
pub fn normalize(predicate: &Predicate, arch: TargetArch) -> Result<Normalized> {
    let mut clauses: Vec<Clause> = Vec::new();

    'clauses: for clause in &predicate.clauses {
        let mut kept: Vec<Comparison> = Vec::new();
        for cmp in &clause.comparisons {
            match fold(check(*cmp, arch)?, arch) {
                Fold::Always => {}
                Fold::Never => continue 'clauses,
                Fold::Keep(c) => {
                    if !kept.contains(&c) {
                        kept.push(c);
                    }
                }
            }
        }
        if kept.is_empty() {
            return Ok(Normalized::Always);
        }
        let clause = Clause::new(kept);
        if !clauses.contains(&clause) {
            clauses.push(clause);
        }
    }

    if clauses.is_empty() {
        Ok(Normalized::Never)
    } else {
        Ok(Normalized::Clauses(clauses))
    }
}

/// Argument index and constant width checks.
fn check(cmp: Comparison, arch: TargetArch) -> Result<Comparison> {
    if cmp.arg > MAX_ARG_INDEX {
        return Err(PolicyError::Compile(format!(
            "argument index {} out of range (0-{})",
            cmp.arg, MAX_ARG_INDEX
        )));
    }

    let word = arch.word_mask();
    let value = cmp.op.constant();
    let value = match cmp.op {
        // bits beyond the word can never be set, so masks just truncate
        CmpOp::MaskedNonZero(_) | CmpOp::In(_) => value & word,
        _ if value & !word == 0 => value,
        // sign-extended negative literal that fits the word
        _ if value | word == u64::MAX && (value & word) >> (arch.word_bits() - 1) == 1 => value & word,
        _ => {
            return Err(PolicyError::Compile(format!(
                "constant {:#x} exceeds the {}-bit argument width of {}",
                value,
                arch.word_bits(),
                arch
            )))
        }
    };
    Ok(Comparison::new(cmp.arg, cmp.op.with_constant(value)))
}

fn fold(cmp: Comparison, arch: TargetArch) -> Fold {
    let max = arch.word_mask();
    match cmp.op {
        CmpOp::Lt(0) | CmpOp::MaskedNonZero(0) => Fold::Never,
        CmpOp::Gt(v) if v == max => Fold::Never,
        CmpOp::Ge(0) => Fold::Always,
        CmpOp::Le(v) if v == max => Fold::Always,
        CmpOp::In(m) if m & max == max => Fold::Always,
        _ => Fold::Keep(cmp),
    }
}

impl Comparison {
    /// Reference semantics against concrete argument values.
    pub fn evaluate(&self, args: &[u64; 6], arch: TargetArch) -> bool {
        match args.get(self.arg as usize) {
            Some(&value) => self.op.holds(value & arch.word_mask()),
            None => false,
        }
    }
}

impl Clause {
    pub fn evaluate(&self, args: &[u64; 6], arch: TargetArch) -> bool {
        self.comparisons.iter().all(|c| c.evaluate(args, arch))
    }
}

impl Predicate {
    pub fn evaluate(&self, args: &[u64; 6], arch: TargetArch) -> bool {
        self.clauses.iter().any(|c| c.evaluate(args, arch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARCH: TargetArch = TargetArch::X86_64;

    fn clause(cmps: &[(u8, CmpOp)]) -> Clause {
        Clause::new(cmps.iter().map(|&(a, op)| Comparison::new(a, op)).collect())
    }

    #[test]
    fn test_plain_predicate_is_kept() {
        let p = Predicate::new(vec![clause(&[(1, CmpOp::Eq(0x1234))])]);
        assert_eq!(normalize(&p, ARCH).unwrap(), Normalized::Clauses(p.clauses.clone()));
    }

    #[test]
    fn test_arg_index_out_of_range() {
        let p = Predicate::new(vec![clause(&[(6, CmpOp::Eq(1))])]);
        let err = normalize(&p, ARCH).unwrap_err();
        assert!(matches!(err, PolicyError::Compile(_)));
        assert!(err.to_string().contains("argument index 6"));
    }

    #[test]
    fn test_trivially_true_atom_makes_predicate_always() {
        let p = Predicate::new(vec![
            clause(&[(0, CmpOp::Eq(3))]),
            clause(&[(1, CmpOp::Ge(0)), (2, CmpOp::In(u64::MAX))]),
        ]);
        assert_eq!(normalize(&p, ARCH).unwrap(), Normalized::Always);
    }

    #[test]
    fn test_trivially_false_clauses_drop() {
        let p = Predicate::new(vec![
            clause(&[(0, CmpOp::MaskedNonZero(0))]),
            clause(&[(0, CmpOp::Eq(1)), (1, CmpOp::Lt(0))]),
            clause(&[(2, CmpOp::Eq(9))]),
        ]);
        assert_eq!(
            normalize(&p, ARCH).unwrap(),
            Normalized::Clauses(vec![clause(&[(2, CmpOp::Eq(9))])])
        );

        let never = Predicate::new(vec![clause(&[(0, CmpOp::Gt(u64::MAX))])]);
        assert_eq!(normalize(&never, ARCH).unwrap(), Normalized::Never);
    }

    #[test]
    fn test_duplicates_removed() {
        let p = Predicate::new(vec![
            clause(&[(0, CmpOp::Eq(1)), (0, CmpOp::Eq(1))]),
            clause(&[(0, CmpOp::Eq(1))]),
            clause(&[(0, CmpOp::Eq(2)), (1, CmpOp::Ge(0))]),
        ]);
        assert_eq!(
            normalize(&p, ARCH).unwrap(),
            Normalized::Clauses(vec![clause(&[(0, CmpOp::Eq(1))]), clause(&[(0, CmpOp::Eq(2))])])
        );
    }

    #[test]
    fn test_evaluate_or_of_and() {
        let p = Predicate::new(vec![
            clause(&[(0, CmpOp::Eq(5))]),
            clause(&[(1, CmpOp::MaskedNonZero(0x40)), (2, CmpOp::Lt(3))]),
        ]);
        assert!(p.evaluate(&[5, 0, 0, 0, 0, 0], ARCH));
        assert!(p.evaluate(&[0, 0x41, 2, 0, 0, 0], ARCH));
        assert!(!p.evaluate(&[0, 0x41, 3, 0, 0, 0], ARCH));
        assert!(!p.evaluate(&[6, 0, 0, 0, 0, 0], ARCH));
    }
}
