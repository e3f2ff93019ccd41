use alloy_primitives::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("either creation bytecode or a target address must be provided")]
    MissingTarget,

    #[error("creation bytecode and target address are mutually exclusive")]
    AmbiguousTarget,

    #[error("no runtime code available for contract at {0}")]
    MissingRuntimeCode(Address),

    #[error("invalid bytecode: {0}")]
    InvalidBytecode(String),

    /// A hook fired on a stack shallower than its opcode guarantees. The engine
    /// broke its arity contract, so the run cannot be trusted.
    #[error("stack underflow in {opcode} hook at {address}: needs {required} item(s), found {actual}")]
    StackUnderflow {
        opcode: &'static str,
        address: usize,
        required: usize,
        actual: usize,
    },

    #[error("failed to read storage slot {slot} of {address}: {reason}")]
    StorageRead {
        address: Address,
        slot: String,
        reason: String,
    },
}
