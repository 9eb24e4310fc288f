//! Error codes shared by every runtime layer.
//!
//! Errors are values: fallible core operations return [`OpResult<T>`] and the
//! caller decides whether to recover, substitute a default or escalate the
//! code into a scripted [`crate::vm::RuntimeError`] with a source location.

use serde::{Deserialize, Serialize};

/// Failure codes, grouped by origin.
///
/// `Display` renders the snake_case code name so that messages and scripts
/// see the same identifier (`invalid_type`, `cant_modify_const_member`, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, thiserror::Error,
)]
#[repr(u8)]
pub enum ErrorCode {
    // ── Generic ──────────────────────────────────────────────────────────────
    #[error("error")]
    Error,
    #[error("not_found")]
    NotFound,
    #[error("out_of_bounds")]
    OutOfBounds,

    // ── Type errors ──────────────────────────────────────────────────────────
    #[error("invalid_type")]
    InvalidType,
    #[error("invalid_type_assignment")]
    InvalidTypeAssignment,
    #[error("invalid_parameters")]
    InvalidParameters,
    #[error("invalid_parameter_count")]
    InvalidParameterCount,

    // ── Access errors ────────────────────────────────────────────────────────
    #[error("inaccessible")]
    Inaccessible,
    #[error("inaccessible_private")]
    InaccessiblePrivate,
    #[error("cant_modify_const_member")]
    CantModifyConstMember,
    #[error("cant_modify_static_const")]
    CantModifyStaticConst,
    #[error("cant_modify_export_table")]
    CantModifyExportTable,
    #[error("cant_modify_const")]
    CantModifyConst,

    // ── Declaration errors ───────────────────────────────────────────────────
    #[error("already_exists")]
    AlreadyExists,
    #[error("duplicated_default_constructor")]
    DuplicatedDefaultConstructor,
    #[error("ambiguous_constructors")]
    AmbiguousConstructors,
    #[error("too_many_locals")]
    TooManyLocals,

    // ── Operation errors ─────────────────────────────────────────────────────
    #[error("invalid_operation")]
    InvalidOperation,
    #[error("invalid_argument")]
    InvalidArgument,
    #[error("division_by_zero")]
    DivisionByZero,
    #[error("call_error")]
    CallError,
    #[error("assertion_failed")]
    AssertionFailed,

    // ── Resource errors ──────────────────────────────────────────────────────
    #[error("out_of_memory")]
    OutOfMemory,
    #[error("memory_error")]
    MemoryError,
    #[error("stack_error")]
    StackError,
}

/// Result of a fallible core operation. `Ok` is the success sentinel.
pub type OpResult<T> = Result<T, ErrorCode>;

impl ErrorCode {
    /// Every code, in declaration order.
    pub const ALL: [ErrorCode; 25] = [
        ErrorCode::Error,
        ErrorCode::NotFound,
        ErrorCode::OutOfBounds,
        ErrorCode::InvalidType,
        ErrorCode::InvalidTypeAssignment,
        ErrorCode::InvalidParameters,
        ErrorCode::InvalidParameterCount,
        ErrorCode::Inaccessible,
        ErrorCode::InaccessiblePrivate,
        ErrorCode::CantModifyConstMember,
        ErrorCode::CantModifyStaticConst,
        ErrorCode::CantModifyExportTable,
        ErrorCode::CantModifyConst,
        ErrorCode::AlreadyExists,
        ErrorCode::DuplicatedDefaultConstructor,
        ErrorCode::AmbiguousConstructors,
        ErrorCode::TooManyLocals,
        ErrorCode::InvalidOperation,
        ErrorCode::InvalidArgument,
        ErrorCode::DivisionByZero,
        ErrorCode::CallError,
        ErrorCode::AssertionFailed,
        ErrorCode::OutOfMemory,
        ErrorCode::MemoryError,
        ErrorCode::StackError,
    ];

    /// Look a code up by its snake_case name.
    pub fn from_name(name: &str) -> Option<ErrorCode> {
        Self::ALL.iter().copied().find(|c| c.to_string() == name)
    }

    /// Hard faults terminate the whole call chain instead of being handed
    /// back to the calling instruction.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorCode::OutOfMemory | ErrorCode::StackError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_snake_case() {
        assert_eq!(ErrorCode::CantModifyConstMember.to_string(), "cant_modify_const_member");
        assert_eq!(ErrorCode::InvalidType.to_string(), "invalid_type");
        assert_eq!(ErrorCode::MemoryError.to_string(), "memory_error");
    }

    #[test]
    fn test_from_name() {
        assert_eq!(ErrorCode::from_name("already_exists"), Some(ErrorCode::AlreadyExists));
        assert_eq!(ErrorCode::from_name("no_such_code"), None);
    }

    #[test]
    fn test_fatal_codes() {
        assert!(ErrorCode::StackError.is_fatal());
        assert!(!ErrorCode::InvalidOperation.is_fatal());
    }
}
