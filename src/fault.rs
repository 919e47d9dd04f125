use thiserror::Error;

/// An illegal condition detected during execution.
///
/// Raising a fault never aborts the instruction in flight: the machine is
/// flagged halted, the diagnostic is recorded, and the current handler keeps
/// running against default values. Forward progress stops at the next tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    #[error("illegal register index {index}")]
    IllegalRegisterIndex { index: u32 },

    #[error("memory access out of bounds at {address:#x}")]
    MemoryOutOfBounds { address: u32 },

    #[error("stack underflow")]
    StackUnderflow,

    #[error("PC overflow at {pc:#x}")]
    PcOverflow { pc: u32 },

    #[error("unknown instruction: {opcode:#x}")]
    UnknownInstruction { opcode: u32 },

    #[error("unknown cmp value {predicate}")]
    UndefinedComparePredicate { predicate: u8 },

    #[error("interrupt return outside of an interrupt")]
    InterruptMisuse,

    #[error("division by zero")]
    DivisionByZero,
}
