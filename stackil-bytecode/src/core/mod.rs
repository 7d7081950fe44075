pub mod handles;
pub mod instructions;
pub mod metadata;
pub mod opcodes;
pub mod types;

// Re-export core types
pub use self::handles::{BuilderId, ExceptionBlock, Label, Local};
pub use self::instructions::{
    BinaryOp, BitwiseOp, BranchCondition, CompareOp, ConvertOp, Instruction, Op, ShiftOp, Targets,
};
pub use self::metadata::{
    CallSignature, CallingConvention, ClassHierarchy, FieldRef, MethodKind, MethodRef,
    MethodSignature, TypeKind, TypeProvider, TypeRef,
};
pub use self::opcodes::{InstructionFlags, Opcode, OperandKind};
pub use self::types::{TypeClass, VerificationType};
