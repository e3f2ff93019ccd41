use alloy_primitives::U256;
use std::collections::BTreeSet;

/// Side of an owner check an equality taint was attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Actor {
    Sender,
    Owner,
}

/// Operand of a block-number comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComparedItem {
    BlockNumber,
    Storage,
}

/// Taint attached to a stack value. Two annotations are the same annotation
/// when they are equal by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Annotation {
    /// Result of `CALLER`.
    Caller,
    /// Result of `SLOAD`, with the slot when it was concrete.
    Storage(Option<U256>),
    Equality(Actor),
    Comparison(ComparedItem),
    /// Ordering comparison between two plain storage slots.
    StorageComparison { left: U256, right: U256 },
    /// Result of `NUMBER`.
    BlockNumber,
    /// Result of `CALLDATALOAD`.
    Input,
    /// Hash of a short input, i.e. a candidate secret.
    HashedInput,
    /// Equality involving a hashed input.
    HashedInputEq,
    /// Storage read keyed by a hashed input.
    HashedStorage,
    Role,
    HashedRole,
    HashedCaller,
}

pub type AnnotationSet = BTreeSet<Annotation>;

impl Annotation {
    /// Slot of a `Storage` annotation with a known index.
    pub fn storage_index(&self) -> Option<U256> {
        match self {
            Annotation::Storage(index) => *index,
            _ => None,
        }
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Annotation::Storage(_))
    }
}
