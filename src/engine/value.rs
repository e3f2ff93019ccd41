use alloy_primitives::U256;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use super::opcode::Opcode;
use crate::analyzers::annotation::{Annotation, AnnotationSet};

/// Shared, immutable expression node.
pub type Word = Rc<Term>;

/// Symbolic 256-bit expression. Structural equality is term identity, which is
/// what the reference oracle reasons about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    Const(U256),
    /// Transaction or block environment value, keyed by the opcode producing it.
    Env(Opcode),
    CallData(Word),
    /// Storage content at transaction start.
    Storage(Word),
    Unary(Opcode, Word),
    Binary(Opcode, Word, Word),
    Keccak(Vec<Word>),
    /// Big-endian concatenation of byte-sized terms.
    Concat(Vec<Word>),
    /// Result of an instruction the explorer does not model.
    Opaque { origin: Opcode, id: usize },
}

impl Term {
    pub fn constant(value: U256) -> Word {
        Rc::new(Term::Const(value))
    }

    pub fn from_u64(value: u64) -> Word {
        Self::constant(U256::from(value))
    }

    pub fn as_const(&self) -> Option<U256> {
        match self {
            Term::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        !matches!(self, Term::Const(_))
    }

    /// True when `self` is built on top of a calldata read at offset zero, which is
    /// where the function selector lives.
    pub fn reads_selector(&self) -> bool {
        match self {
            Term::CallData(offset) => offset.as_const() == Some(U256::ZERO),
            Term::Unary(_, a) => a.reads_selector(),
            Term::Binary(_, a, b) => a.reads_selector() || b.reads_selector(),
            _ => false,
        }
    }

    /// Applies a unary opcode, folding constants.
    pub fn unary(op: Opcode, a: &Word) -> Word {
        if let Some(x) = a.as_const() {
            let folded = match op {
                Opcode::ISZERO => Some(bool_word(x.is_zero())),
                Opcode::NOT => Some(!x),
                _ => None,
            };
            if let Some(v) = folded {
                return Self::constant(v);
            }
        }
        Rc::new(Term::Unary(op, a.clone()))
    }

    /// Applies a binary opcode with `a` being the top of the stack, folding constants.
    pub fn binary(op: Opcode, a: &Word, b: &Word) -> Word {
        if let (Some(x), Some(y)) = (a.as_const(), b.as_const()) {
            if let Some(v) = fold_binary(op, x, y) {
                return Self::constant(v);
            }
        }
        Rc::new(Term::Binary(op, a.clone(), b.clone()))
    }

    pub fn concat(parts: Vec<Word>) -> Word {
        Rc::new(Term::Concat(parts))
    }
}

fn bool_word(flag: bool) -> U256 {
    if flag {
        U256::from(1)
    } else {
        U256::ZERO
    }
}

fn signed_lt(a: U256, b: U256) -> bool {
    let (a_neg, b_neg) = (a.bit(255), b.bit(255));
    if a_neg != b_neg {
        a_neg
    } else {
        a < b
    }
}

fn fold_binary(op: Opcode, a: U256, b: U256) -> Option<U256> {
    let value = match op.0 {
        0x01 => a.wrapping_add(b),
        0x02 => a.wrapping_mul(b),
        0x03 => a.wrapping_sub(b),
        0x04 => {
            if b.is_zero() {
                U256::ZERO
            } else {
                a / b
            }
        }
        0x06 => {
            if b.is_zero() {
                U256::ZERO
            } else {
                a % b
            }
        }
        0x0a => a.wrapping_pow(b),
        0x10 => bool_word(a < b),
        0x11 => bool_word(a > b),
        0x12 => bool_word(signed_lt(a, b)),
        0x13 => bool_word(signed_lt(b, a)),
        0x14 => bool_word(a == b),
        0x16 => a & b,
        0x17 => a | b,
        0x18 => a ^ b,
        0x1a => match to_usize(a) {
            Some(i) if i < 32 => (b >> (8 * (31 - i))) & U256::from(0xff),
            _ => U256::ZERO,
        },
        0x1b => match to_usize(a) {
            Some(shift) if shift < 256 => b << shift,
            _ => U256::ZERO,
        },
        0x1c => match to_usize(a) {
            Some(shift) if shift < 256 => b >> shift,
            _ => U256::ZERO,
        },
        _ => return None,
    };
    Some(value)
}

/// Narrows a word to `usize` when it fits.
pub fn to_usize(value: U256) -> Option<usize> {
    let limbs = value.as_limbs();
    if limbs[1..].iter().any(|&limb| limb != 0) {
        return None;
    }
    usize::try_from(limbs[0]).ok()
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Const(v) => write!(f, "{:#x}", v),
            Term::Env(op) => write!(f, "{}", op.name().to_lowercase()),
            Term::CallData(offset) => write!(f, "calldata[{}]", offset),
            Term::Storage(slot) => write!(f, "storage[{}]", slot),
            Term::Unary(op, a) => write!(f, "{}({})", op.name().to_lowercase(), a),
            Term::Binary(op, a, b) => write!(f, "{}({}, {})", op.name().to_lowercase(), a, b),
            Term::Keccak(words) => {
                write!(f, "keccak(")?;
                for (i, w) in words.iter().enumerate() {
                    if i > 0 {
                        write!(f, " . ")?;
                    }
                    write!(f, "{}", w)?;
                }
                write!(f, ")")
            }
            Term::Concat(parts) => write!(f, "concat<{}>", parts.len()),
            Term::Opaque { origin, id } => write!(f, "{}#{}", origin.name().to_lowercase(), id),
        }
    }
}

/// A value on the evaluation stack together with its annotations.
///
/// Values are shared through `Rc` so that every stack slot and state view holding
/// the same value sees the same annotation set.
#[derive(Debug)]
pub struct StackValue {
    word: Word,
    annotations: RefCell<AnnotationSet>,
}

impl StackValue {
    pub fn new(word: Word) -> Self {
        StackValue {
            word,
            annotations: RefCell::new(AnnotationSet::new()),
        }
    }

    pub fn with_annotations(word: Word, annotations: AnnotationSet) -> Self {
        StackValue {
            word,
            annotations: RefCell::new(annotations),
        }
    }

    pub fn constant(value: U256) -> Self {
        Self::new(Term::constant(value))
    }

    pub fn word(&self) -> &Word {
        &self.word
    }

    /// Concrete value, `None` when symbolic.
    pub fn value(&self) -> Option<U256> {
        self.word.as_const()
    }

    pub fn is_symbolic(&self) -> bool {
        self.word.is_symbolic()
    }

    pub fn annotate(&self, annotation: Annotation) {
        self.annotations.borrow_mut().insert(annotation);
    }

    pub fn discard(&self, annotation: &Annotation) -> bool {
        self.annotations.borrow_mut().remove(annotation)
    }

    pub fn has(&self, annotation: &Annotation) -> bool {
        self.annotations.borrow().contains(annotation)
    }

    pub fn has_any(&self, candidates: &[Annotation]) -> bool {
        let annotations = self.annotations.borrow();
        candidates.iter().any(|a| annotations.contains(a))
    }

    pub fn has_all(&self, candidates: &[Annotation]) -> bool {
        let annotations = self.annotations.borrow();
        candidates.iter().all(|a| annotations.contains(a))
    }

    /// First annotation for which `f` returns `Some`.
    pub fn find_map<T>(&self, f: impl FnMut(&Annotation) -> Option<T>) -> Option<T> {
        self.annotations.borrow().iter().find_map(f)
    }

    pub fn annotations(&self) -> Ref<'_, AnnotationSet> {
        self.annotations.borrow()
    }

    /// Copy with its own annotation set, used when a path forks.
    pub fn detached(&self) -> Self {
        Self::with_annotations(self.word.clone(), self.annotations.borrow().clone())
    }
}

/// Branch condition accumulated along a path: `condition != 0` equals `holds`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Constraint {
    pub condition: Word,
    pub holds: bool,
}

impl Constraint {
    pub fn new(condition: Word, holds: bool) -> Self {
        Constraint { condition, holds }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_folding() {
        let a = Term::from_u64(7);
        let b = Term::from_u64(3);
        assert_eq!(Term::binary(Opcode::SUB, &a, &b).as_const(), Some(U256::from(4)));
        assert_eq!(Term::binary(Opcode::LT, &b, &a).as_const(), Some(U256::from(1)));
        assert_eq!(
            Term::binary(Opcode::SHR, &Term::from_u64(8), &Term::from_u64(0x1200)).as_const(),
            Some(U256::from(0x12))
        );
        assert_eq!(Term::unary(Opcode::ISZERO, &Term::from_u64(0)).as_const(), Some(U256::from(1)));
    }

    #[test]
    fn test_symbolic_operands_build_terms() {
        let caller = Rc::new(Term::Env(Opcode::CALLER));
        let eq = Term::binary(Opcode::EQ, &caller, &Term::from_u64(1));
        assert!(eq.is_symbolic());
        assert_eq!(eq, Term::binary(Opcode::EQ, &caller, &Term::from_u64(1)));
    }

    #[test]
    fn test_selector_detection() {
        let cd = Rc::new(Term::CallData(Term::from_u64(0)));
        let shifted = Term::binary(Opcode::SHR, &Term::from_u64(0xe0), &cd);
        assert!(shifted.reads_selector());
        let cd4 = Rc::new(Term::CallData(Term::from_u64(4)));
        assert!(!cd4.reads_selector());
    }

    #[test]
    fn test_annotation_membership_is_by_value() {
        let value = StackValue::constant(U256::from(1));
        value.annotate(Annotation::Storage(Some(U256::from(3))));
        value.annotate(Annotation::Storage(Some(U256::from(3))));
        assert_eq!(value.annotations().len(), 1);
        assert!(value.has(&Annotation::Storage(Some(U256::from(3)))));
        let copy = value.detached();
        copy.annotate(Annotation::Caller);
        assert!(!value.has(&Annotation::Caller));
    }
}
