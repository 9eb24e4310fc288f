//! Native built-in functions for the Kestrel VM.
//!
//! [`register_all`] installs the root-table builtins into a [`Vm`];
//! [`type_method`] resolves the methods every value type answers to in
//! `value.method(...)` calls. Each builtin is a plain [`NativeFn`].
//!
//! # Organisation
//!
//! | Group    | Functions |
//! |----------|-----------|
//! | Core     | `print`, `typeof`, `tostring`, `clone`, `weak`, `mutable`, `set_delegate`, `get_delegate`, `iterator`, `error`, `assert` |
//! | String   | `size`, `replace`, `contains`, `starts_with`, `ends_with`, `find`, `to_upper`, `to_lower`, `substr`, `append` (mutable only) |
//! | Array    | `size`, `push`, `pop`, `insert`, `erase`, `clear`, `contains`, `find`, `begin` |
//! | Table    | `size`, `contains`, `erase`, `keys`, `values`, `begin` |
//! | Weak ref | `get`, `is_expired` |
//! | Iterator | `get`, `key`, `valid` |

use tracing::debug;

use crate::error::{ErrorCode, OpResult};
use crate::heap::Ref;
use crate::native::{NativeCall, NativeFn};
use crate::object::{delegate_of, lookup_meta, ArrayObject, MetaMethod, TableObject};
use crate::value::{Extension, Value};
use crate::vm::Vm;

type NativeResult = OpResult<Option<Value>>;

// ─────────────────────────────────────────────────────────────────────────────
// Registration entry point
// ─────────────────────────────────────────────────────────────────────────────

/// Register every root-table builtin into `vm`.
pub fn register_all(vm: &mut Vm) -> OpResult<()> {
    const CORE: [(&str, NativeFn); 11] = [
        ("print", core_print),
        ("typeof", core_typeof),
        ("tostring", core_tostring),
        ("clone", core_clone),
        ("weak", core_weak),
        ("mutable", core_mutable),
        ("set_delegate", core_set_delegate),
        ("get_delegate", core_get_delegate),
        ("iterator", core_iterator),
        ("error", core_error),
        ("assert", core_assert),
    ];
    for (name, func) in CORE {
        vm.register_native(name, func)?;
    }
    debug!(count = CORE.len(), "registered builtins");
    Ok(())
}

/// The built-in method `name` of `value`'s type, if it has one.
pub fn type_method(value: &Value, name: &str) -> Option<NativeFn> {
    let found: NativeFn = match (value, name) {
        // ── Mutable strings ──
        (Value::MutableString(_), "append") => str_append,

        // ── Strings ──
        (v, "size") if v.is_string() => str_size,
        (v, "replace") if v.is_string() => str_replace,
        (v, "contains") if v.is_string() => str_contains,
        (v, "starts_with") if v.is_string() => str_starts_with,
        (v, "ends_with") if v.is_string() => str_ends_with,
        (v, "find") if v.is_string() => str_find,
        (v, "to_upper") if v.is_string() => str_to_upper,
        (v, "to_lower") if v.is_string() => str_to_lower,
        (v, "substr") if v.is_string() => str_substr,

        // ── Arrays ──
        (Value::Array(_), "size") => array_size,
        (Value::Array(_), "push") => array_push,
        (Value::Array(_), "pop") => array_pop,
        (Value::Array(_), "insert") => array_insert,
        (Value::Array(_), "erase") => array_erase,
        (Value::Array(_), "clear") => array_clear,
        (Value::Array(_), "contains") => array_contains,
        (Value::Array(_), "find") => array_find,
        (Value::Array(_), "begin") => core_iterator_of_this,

        // ── Tables ──
        (Value::Table(_), "size") => table_size,
        (Value::Table(_), "contains") => table_contains,
        (Value::Table(_), "erase") => table_erase,
        (Value::Table(_), "keys") => table_keys,
        (Value::Table(_), "values") => table_values,
        (Value::Table(_), "begin") => core_iterator_of_this,

        // ── Weak references ──
        (Value::WeakRef(_), "get") => weak_get,
        (Value::WeakRef(_), "is_expired") => weak_is_expired,

        // ── Iterators ──
        (Value::Extension(_), "get") => iter_get,
        (Value::Extension(_), "key") => iter_key,
        (Value::Extension(_), "valid") => iter_valid,

        _ => return None,
    };
    Some(found)
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument helpers
// ─────────────────────────────────────────────────────────────────────────────

fn string_arg(call: &NativeCall<'_>, index: usize) -> OpResult<String> {
    Ok(call.arg(index)?.get_string()?.to_string())
}

fn this_string(call: &NativeCall<'_>) -> OpResult<String> {
    Ok(call.this()?.get_string()?.to_string())
}

fn this_array(call: &NativeCall<'_>) -> OpResult<Ref<ArrayObject>> {
    call.this()?.as_array().cloned().ok_or(ErrorCode::InvalidType)
}

fn this_table(call: &NativeCall<'_>) -> OpResult<Ref<TableObject>> {
    call.this()?.as_table().cloned().ok_or(ErrorCode::InvalidType)
}

fn this_iterator(call: &NativeCall<'_>) -> OpResult<Extension> {
    match call.this()? {
        Value::Extension(ext) => Ok(ext.clone()),
        _ => Err(ErrorCode::InvalidType),
    }
}

/// A non-negative integer argument.
fn index_arg(call: &NativeCall<'_>, index: usize) -> OpResult<usize> {
    let n = call.arg(index)?.get_integer()?;
    usize::try_from(n).map_err(|_| ErrorCode::OutOfBounds)
}

fn string_result(call: &NativeCall<'_>, s: &str) -> NativeResult {
    Ok(Some(Value::string(call.engine(), s)))
}

fn iterator_for(container: &Value) -> OpResult<Value> {
    let ext = match container {
        Value::Array(array) => Extension::ArrayIterator {
            array: array.clone(),
            index: 0,
        },
        Value::Table(table) => Extension::TableIterator {
            table: table.clone(),
            index: 0,
        },
        _ => return Err(ErrorCode::InvalidType),
    };
    Ok(Value::Extension(ext))
}

// ─────────────────────────────────────────────────────────────────────────────
// Core
// ─────────────────────────────────────────────────────────────────────────────

/// Print all arguments separated by spaces, followed by a newline.
fn core_print(call: &mut NativeCall<'_>) -> NativeResult {
    let args: Vec<Value> = call.args()?.iter().cloned().collect();
    let mut parts = Vec::with_capacity(args.len());
    for arg in &args {
        parts.push(call.vm().to_display(arg)?);
    }
    let mut line = parts.join(" ");
    line.push('\n');
    call.engine().write_stream(&line).map_err(|_| ErrorCode::Error)?;
    Ok(None)
}

fn core_typeof(call: &mut NativeCall<'_>) -> NativeResult {
    let value = call.arg(0)?.clone();
    let name = call.vm().type_name_of(&value)?;
    string_result(call, &name)
}

fn core_tostring(call: &mut NativeCall<'_>) -> NativeResult {
    let value = call.arg(0)?.clone();
    let text = call.vm().to_display(&value)?;
    string_result(call, &text)
}

/// Structural copy; `__cloned` on the copy's delegate runs afterwards.
fn core_clone(call: &mut NativeCall<'_>) -> NativeResult {
    let copy = call.arg(0)?.deep_clone();
    if let Some(delegate) = delegate_of(&copy) {
        if let Some(hook) = lookup_meta(&delegate, MetaMethod::Cloned) {
            call.vm().call_meta(&hook, copy.clone(), &[delegate])?;
        }
    }
    Ok(Some(copy))
}

fn core_weak(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(call.arg(0)?.downgrade()?))
}

fn core_mutable(call: &mut NativeCall<'_>) -> NativeResult {
    let text = string_arg(call, 0)?;
    Ok(Some(Value::mutable_string(call.engine(), text)))
}

/// `set_delegate(target, delegate)`; a `null` delegate clears it.
fn core_set_delegate(call: &mut NativeCall<'_>) -> NativeResult {
    let delegate = match call.arg(1)? {
        Value::Null => None,
        d @ (Value::Table(_) | Value::Struct(_)) => Some(d.clone()),
        _ => return Err(ErrorCode::InvalidType),
    };
    match call.arg(0)? {
        Value::Table(t) => t.set_delegate(delegate),
        Value::UserData(u) => u.set_delegate(delegate),
        _ => return Err(ErrorCode::InvalidType),
    }
    Ok(None)
}

fn core_get_delegate(call: &mut NativeCall<'_>) -> NativeResult {
    let delegate = match call.arg(0)? {
        Value::Table(t) => t.delegate(),
        Value::UserData(u) => u.delegate(),
        Value::StructInstance(_) => delegate_of(call.arg(0)?),
        _ => return Err(ErrorCode::InvalidType),
    };
    Ok(delegate)
}

fn core_iterator(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(iterator_for(call.arg(0)?)?))
}

fn core_iterator_of_this(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(iterator_for(call.this()?)?))
}

/// `error("not_found")` builds an error value from a code name.
fn core_error(call: &mut NativeCall<'_>) -> NativeResult {
    let name = string_arg(call, 0)?;
    let code = ErrorCode::from_name(&name).ok_or(ErrorCode::InvalidArgument)?;
    Ok(Some(Value::Error(code)))
}

fn core_assert(call: &mut NativeCall<'_>) -> NativeResult {
    if call.arg(0)?.is_truthy() {
        Ok(None)
    } else {
        Err(ErrorCode::AssertionFailed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// String methods
// ─────────────────────────────────────────────────────────────────────────────

fn str_size(call: &mut NativeCall<'_>) -> NativeResult {
    let n = this_string(call)?.chars().count();
    Ok(Some(Value::Integer(n as i64)))
}

/// Replace every occurrence of the first argument with the second.
fn str_replace(call: &mut NativeCall<'_>) -> NativeResult {
    let s = this_string(call)?;
    let from = string_arg(call, 0)?;
    let to = string_arg(call, 1)?;
    if from.is_empty() {
        return Err(ErrorCode::InvalidArgument);
    }
    string_result(call, &s.replace(&from, &to))
}

fn str_contains(call: &mut NativeCall<'_>) -> NativeResult {
    let found = this_string(call)?.contains(string_arg(call, 0)?.as_str());
    Ok(Some(Value::Bool(found)))
}

fn str_starts_with(call: &mut NativeCall<'_>) -> NativeResult {
    let found = this_string(call)?.starts_with(string_arg(call, 0)?.as_str());
    Ok(Some(Value::Bool(found)))
}

fn str_ends_with(call: &mut NativeCall<'_>) -> NativeResult {
    let found = this_string(call)?.ends_with(string_arg(call, 0)?.as_str());
    Ok(Some(Value::Bool(found)))
}

/// Character index of the first occurrence, or `-1`.
fn str_find(call: &mut NativeCall<'_>) -> NativeResult {
    let s = this_string(call)?;
    let needle = string_arg(call, 0)?;
    let index = s
        .find(&needle)
        .map(|byte| s[..byte].chars().count() as i64)
        .unwrap_or(-1);
    Ok(Some(Value::Integer(index)))
}

fn str_to_upper(call: &mut NativeCall<'_>) -> NativeResult {
    let s = this_string(call)?.to_uppercase();
    string_result(call, &s)
}

fn str_to_lower(call: &mut NativeCall<'_>) -> NativeResult {
    let s = this_string(call)?.to_lowercase();
    string_result(call, &s)
}

/// `substr(start[, len])` over characters; `len` is clamped to the end.
fn str_substr(call: &mut NativeCall<'_>) -> NativeResult {
    let s = this_string(call)?;
    let start = index_arg(call, 0)?;
    let total = s.chars().count();
    if start > total {
        return Err(ErrorCode::OutOfBounds);
    }
    let len = if call.argc() > 1 {
        index_arg(call, 1)?
    } else {
        total - start
    };
    let out: String = s.chars().skip(start).take(len).collect();
    string_result(call, &out)
}

fn str_append(call: &mut NativeCall<'_>) -> NativeResult {
    let suffix = string_arg(call, 0)?;
    let this = call.this()?.clone();
    match &this {
        Value::MutableString(m) => m.push_str(&suffix),
        _ => return Err(ErrorCode::InvalidType),
    }
    Ok(Some(this))
}

// ─────────────────────────────────────────────────────────────────────────────
// Array methods
// ─────────────────────────────────────────────────────────────────────────────

fn array_size(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(Value::Integer(this_array(call)?.len() as i64)))
}

fn array_push(call: &mut NativeCall<'_>) -> NativeResult {
    let array = this_array(call)?;
    for value in call.args()?.iter() {
        array.push(value.clone());
    }
    Ok(None)
}

fn array_pop(call: &mut NativeCall<'_>) -> NativeResult {
    this_array(call)?.pop().map(Some).ok_or(ErrorCode::OutOfBounds)
}

fn array_insert(call: &mut NativeCall<'_>) -> NativeResult {
    let array = this_array(call)?;
    let index = index_arg(call, 0)?;
    let value = call.arg(1)?.clone();
    array.insert(index, value)?;
    Ok(None)
}

/// Remove and return the element at an index.
fn array_erase(call: &mut NativeCall<'_>) -> NativeResult {
    let array = this_array(call)?;
    let index = index_arg(call, 0)?;
    Ok(Some(array.erase(index)?))
}

fn array_clear(call: &mut NativeCall<'_>) -> NativeResult {
    this_array(call)?.clear();
    Ok(None)
}

fn array_position(call: &NativeCall<'_>) -> OpResult<Option<usize>> {
    let array = this_array(call)?;
    let needle = call.arg(0)?;
    Ok(array.snapshot().iter().position(|v| v == needle))
}

fn array_contains(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(Value::Bool(array_position(call)?.is_some())))
}

fn array_find(call: &mut NativeCall<'_>) -> NativeResult {
    let index = array_position(call)?.map_or(-1, |i| i as i64);
    Ok(Some(Value::Integer(index)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Table methods
// ─────────────────────────────────────────────────────────────────────────────

fn table_size(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(Value::Integer(this_table(call)?.len() as i64)))
}

fn table_contains(call: &mut NativeCall<'_>) -> NativeResult {
    let found = this_table(call)?.contains(call.arg(0)?);
    Ok(Some(Value::Bool(found)))
}

/// Remove a key, returning its value (or `null` when absent).
fn table_erase(call: &mut NativeCall<'_>) -> NativeResult {
    let table = this_table(call)?;
    table.remove(call.arg(0)?)
}

fn table_keys(call: &mut NativeCall<'_>) -> NativeResult {
    let keys = this_table(call)?.entries().into_iter().map(|(k, _)| k).collect();
    Ok(Some(Value::array(call.engine(), keys)))
}

fn table_values(call: &mut NativeCall<'_>) -> NativeResult {
    let values = this_table(call)?.entries().into_iter().map(|(_, v)| v).collect();
    Ok(Some(Value::array(call.engine(), values)))
}

// ─────────────────────────────────────────────────────────────────────────────
// Weak references and iterators
// ─────────────────────────────────────────────────────────────────────────────

fn weak_get(call: &mut NativeCall<'_>) -> NativeResult {
    match call.this()? {
        Value::WeakRef(w) => Ok(w.upgrade()),
        _ => Err(ErrorCode::InvalidType),
    }
}

fn weak_is_expired(call: &mut NativeCall<'_>) -> NativeResult {
    match call.this()? {
        Value::WeakRef(w) => Ok(Some(Value::Bool(w.is_expired()))),
        _ => Err(ErrorCode::InvalidType),
    }
}

fn iter_get(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(this_iterator(call)?.get()?))
}

fn iter_key(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(this_iterator(call)?.key()?))
}

fn iter_valid(call: &mut NativeCall<'_>) -> NativeResult {
    Ok(Some(Value::Bool(this_iterator(call)?.is_valid())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{compile, CompileOptions};
    use crate::config::VmConfig;
    use crate::engine::{Engine, MemoryStream};
    use crate::lexer::lex;
    use crate::parser::parse;

    fn eval_with(engine: &Engine, src: &str) -> Result<Value, crate::vm::RuntimeError> {
        let (tokens, errors) = lex(src);
        assert!(errors.is_empty(), "lex errors: {errors:?}");
        let program = parse(tokens).expect("parse");
        let proto = compile(&program, &CompileOptions::default()).expect("compile");
        Vm::new(engine.clone(), VmConfig::default()).run(&proto)
    }

    fn eval(src: &str) -> Value {
        eval_with(&Engine::new(), src).expect("run")
    }

    fn eval_str(src: &str) -> String {
        eval(src).to_string()
    }

    #[test]
    fn test_print_writes_to_engine_stream() {
        let stream = MemoryStream::new();
        let engine = Engine::builder().stream(stream.clone()).build();
        eval_with(&engine, r#"print("a", 1, 2.5, null); print();"#).unwrap();
        assert_eq!(stream.contents(), "a 1 2.5 null\n\n");
    }

    #[test]
    fn test_print_uses_tostring_meta() {
        let stream = MemoryStream::new();
        let engine = Engine::builder().stream(stream.clone()).build();
        eval_with(
            &engine,
            r#"var d = { __tostring = function() { return "<point>"; } };
               var p = {}; set_delegate(p, d); print(p);"#,
        )
        .unwrap();
        assert_eq!(stream.contents(), "<point>\n");
    }

    #[test]
    fn test_typeof_and_tostring() {
        assert_eq!(eval_str("return typeof(1);"), "integer");
        assert_eq!(eval_str("return typeof(\"s\");"), "string");
        assert_eq!(eval_str("return typeof([]);"), "array");
        assert_eq!(eval_str("return tostring(12) + \"!\";"), "12!");
        assert_eq!(
            eval_str(r#"var t = {}; set_delegate(t, { __typeof = function() { return "vec"; } }); return typeof(t);"#),
            "vec"
        );
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(eval(r#"return "hello".size();"#), Value::Integer(5));
        assert_eq!(eval(r#"return "hello".find("ll");"#), Value::Integer(2));
        assert_eq!(eval(r#"return "hello".find("z");"#), Value::Integer(-1));
        assert_eq!(eval_str(r#"return "hello".substr(1, 3);"#), "ell");
        assert_eq!(eval_str(r#"return "hello".substr(2);"#), "llo");
        assert_eq!(eval_str(r#"return "Hello".to_upper();"#), "HELLO");
        assert_eq!(eval(r#"return "hello".starts_with("he");"#), Value::Bool(true));
        assert_eq!(eval(r#"return "hello".ends_with("he");"#), Value::Bool(false));
        assert_eq!(eval_str(r#"return "a-b-c".replace("-", "+");"#), "a+b+c");
    }

    #[test]
    fn test_mutable_string_append() {
        let value = eval(r#"var s = mutable("ab"); s.append("cd"); s.append("e"); return s;"#);
        assert_eq!(value.type_name(), "mutable_string");
        assert_eq!(value.to_string(), "abcde");
        assert!(eval_with(&Engine::new(), r#"return "ab".append("c");"#).is_err());
    }

    #[test]
    fn test_array_methods() {
        assert_eq!(
            eval("var a = [1, 2]; a.push(3, 4); a.insert(0, 0); return a.size();"),
            Value::Integer(5)
        );
        assert_eq!(eval("var a = [1, 2, 3]; var x = a.erase(1); return x * 10 + a.size();"), Value::Integer(22));
        assert_eq!(eval("var a = [1, 2, 3]; return a.pop();"), Value::Integer(3));
        assert_eq!(eval("var a = [\"x\", \"y\"]; return a.find(\"y\");"), Value::Integer(1));
        assert_eq!(eval("var a = [1]; a.clear(); return a.contains(1);"), Value::Bool(false));
        let err = eval_with(&Engine::new(), "var a = []; return a.pop();").unwrap_err();
        assert_eq!(err.code, ErrorCode::OutOfBounds);
    }

    #[test]
    fn test_table_methods() {
        assert_eq!(eval("var t = { a = 1, b = 2 }; return t.size();"), Value::Integer(2));
        assert_eq!(eval("var t = { a = 1 }; return t.contains(\"a\");"), Value::Bool(true));
        assert_eq!(eval("var t = { a = 1, b = 2 }; t.erase(\"a\"); return t.keys()[0];").to_string(), "b");
        assert_eq!(eval("var t = { a = 5 }; return t.values()[0];"), Value::Integer(5));
        assert_eq!(eval("var t = {}; return t.erase(\"nope\");"), Value::Null);
    }

    #[test]
    fn test_table_iterator() {
        let value = eval(
            "var t = { a = 1, b = 2, c = 3 }; var total = 0; var keys = \"\";
             for (var it = t.begin(); it.valid(); it++) { total += it.get(); keys += it.key(); }
             return keys + tostring(total);",
        );
        assert_eq!(value.to_string(), "abc6");
    }

    #[test]
    fn test_iterator_builtin_rejects_scalars() {
        let err = eval_with(&Engine::new(), "return iterator(3);").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidType);
    }

    #[test]
    fn test_error_and_assert() {
        assert_eq!(eval("return error(\"not_found\");"), Value::Error(ErrorCode::NotFound));
        let err = eval_with(&Engine::new(), "assert(1 == 2);").unwrap_err();
        assert_eq!(err.code, ErrorCode::AssertionFailed);
        let err = eval_with(&Engine::new(), "return error(\"bogus\");").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_clone_is_deep() {
        let value = eval("var a = { inner = [1] }; var b = clone(a); b.inner.push(2); return a.inner.size();");
        assert_eq!(value, Value::Integer(1));
    }

    #[test]
    fn test_get_delegate_roundtrip() {
        assert_eq!(eval("var d = {}; var t = {}; set_delegate(t, d); return get_delegate(t) == d;"), Value::Bool(true));
        assert_eq!(eval("var t = {}; return get_delegate(t);"), Value::Null);
    }

    #[test]
    fn test_unknown_method() {
        let err = eval_with(&Engine::new(), "return (5).size();").unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
        assert!(err.message.contains("no method `size`"));
    }

    #[test]
    fn test_type_method_lookup() {
        let engine = Engine::new();
        assert!(type_method(&Value::string(&engine, "x"), "size").is_some());
        assert!(type_method(&Value::string(&engine, "x"), "append").is_none());
        assert!(type_method(&Value::mutable_string(&engine, "x"), "append").is_some());
        assert!(type_method(&Value::Integer(1), "size").is_none());
    }
}
