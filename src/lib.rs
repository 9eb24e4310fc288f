//! The Kestrel embeddable language runtime.
//!
//! This crate provides the complete Kestrel pipeline:
//!
//! 1. **Engine** (`engine`, `heap`): allocator routing, per-tag accounting
//!    and the reference-counted heap every object lives on.
//! 2. **Values** (`value`, `object`, `structs`): the tagged [`value::Value`],
//!    heap object kinds, and struct schemas with constructor overloads.
//! 3. **Arithmetic** (`arith`): operator dispatch by exposed kind, with
//!    delegate meta-method redirects.
//! 4. **Front end** (`lexer`, `parser`, `ast`): source text to a typed
//!    [`ast::Program`].
//! 5. **Compiler** (`compiler`, `bytecode`, `serialize`): lowers the AST to
//!    [`bytecode::FunctionPrototype`]s, optionally saved to disk.
//! 6. **VM** (`vm`, `stack`, `native`, `builtins`): the interpreter, its
//!    execution stack, the native call protocol and the builtin library.
//!
//! # Entry point
//!
//! ```rust,ignore
//! use kestrel::run_source;
//! let value = run_source("return 1 + 2;", "main")?;
//! ```

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

pub mod arith;
pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod heap;
pub mod lexer;
pub mod native;
pub mod object;
pub mod parser;
pub mod serialize;
pub mod stack;
pub mod structs;
pub mod token;
pub mod value;
pub mod vm;

pub use config::VmConfig;
pub use engine::Engine;
pub use error::{ErrorCode, OpResult};
pub use value::Value;
pub use vm::{ModuleOutput, RuntimeError, Vm};

// ─────────────────────────────────────────────────────────────────────────────
// Unified error type
// ─────────────────────────────────────────────────────────────────────────────

use crate::bytecode::FunctionPrototype;
use crate::compiler::{CompileError, CompileOptions};
use crate::lexer::LexError;
use crate::parser::ParseError;

fn join_errors<E: ToString>(errors: &[E]) -> String {
    errors.iter().map(E::to_string).collect::<Vec<_>>().join("; ")
}

/// The unified error type for every pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum KestrelError {
    #[error("lex error: {}", join_errors(.0))]
    Lex(Vec<LexError>),

    #[error("parse error: {}", join_errors(.0))]
    Parse(Vec<ParseError>),

    #[error("compile error: {}", join_errors(.0))]
    Compile(Vec<CompileError>),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// A bytecode image could not be written or read back.
    #[error("bytecode error: {0}")]
    Serialize(ErrorCode),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type KestrelResult<T> = Result<T, KestrelError>;

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Lex and parse a source string. Lex errors win over parse errors.
pub fn parse_source(src: &str) -> KestrelResult<ast::Program> {
    let (tokens, lex_errors) = lexer::lex(src);
    if !lex_errors.is_empty() {
        return Err(KestrelError::Lex(lex_errors));
    }
    parser::parse(tokens).map_err(KestrelError::Parse)
}

/// Parse and compile a source string into a module prototype.
pub fn compile_source(src: &str, options: &CompileOptions) -> KestrelResult<FunctionPrototype> {
    let program = parse_source(src)?;
    compiler::compile(&program, options).map_err(KestrelError::Compile)
}

/// Full pipeline on a fresh engine and default-configured VM.
pub fn run_source(src: &str, source_name: &str) -> KestrelResult<Value> {
    let config = VmConfig {
        source_name: source_name.to_string(),
        ..VmConfig::default()
    };
    let proto = compile_source(src, &config.compile_options())?;
    let mut vm = Vm::new(Engine::new(), config);
    Ok(vm.run(&proto)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_source() {
        assert_eq!(run_source("return 1 + 2;", "main").unwrap(), Value::Integer(3));
    }

    #[test]
    fn test_stage_errors() {
        assert!(matches!(run_source("return \"open", "main"), Err(KestrelError::Lex(_))));
        assert!(matches!(run_source("return (1;", "main"), Err(KestrelError::Parse(_))));
        assert!(matches!(run_source("break;", "main"), Err(KestrelError::Compile(_))));
        assert!(matches!(run_source("return 1 / 0;", "main"), Err(KestrelError::Runtime(_))));
    }

    #[test]
    fn test_runtime_error_display() {
        let err = run_source("return 1 + null;", "main").unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("runtime error: invalid_operation"), "{text}");
    }

    #[test]
    fn test_bytecode_roundtrip_runs() {
        let proto = compile_source("var s = 0; for (var i = 1; i <= 4; i++) s += i; return s;", &CompileOptions::default())
            .unwrap();
        let bytes = serialize::to_bytes(&proto).unwrap();
        let loaded = serialize::from_bytes(&bytes).unwrap();
        let mut vm = Vm::new(Engine::new(), VmConfig::default());
        assert_eq!(vm.run(&loaded).unwrap(), Value::Integer(10));
    }
}
