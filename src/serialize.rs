//! Binary (de)serialization of compiled prototypes.
//!
//! The container is a four-byte magic followed by the bincode encoding of
//! the [`FunctionPrototype`] tree. Every collection is length-prefixed and
//! the field order is the implicit format version. Decoding fails closed:
//! truncated input, trailing bytes and malformed instruction streams are all
//! `memory_error`, and no partially built prototype escapes.

use bincode::Options;
use tracing::{debug, instrument, warn};

use crate::bytecode::FunctionPrototype;
use crate::error::{ErrorCode, OpResult};

const MAGIC: &[u8; 4] = b"KBC1";

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

#[instrument(skip_all, fields(name = %proto.name))]
pub fn to_bytes(proto: &FunctionPrototype) -> OpResult<Vec<u8>> {
    let body = codec().serialize(proto).map_err(|err| {
        warn!(%err, "prototype encoding failed");
        ErrorCode::MemoryError
    })?;
    let mut bytes = Vec::with_capacity(MAGIC.len() + body.len());
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&body);
    debug!(bytes = bytes.len(), "prototype serialized");
    Ok(bytes)
}

#[instrument(skip_all, fields(len = bytes.len()))]
pub fn from_bytes(bytes: &[u8]) -> OpResult<FunctionPrototype> {
    let body = bytes.strip_prefix(MAGIC.as_slice()).ok_or_else(|| {
        warn!("missing bytecode header");
        ErrorCode::MemoryError
    })?;
    let proto: FunctionPrototype = codec().deserialize(body).map_err(|err| {
        warn!(%err, "prototype decoding failed");
        ErrorCode::MemoryError
    })?;
    proto.validate().map_err(|err| {
        warn!(%err, "corrupt instruction stream");
        ErrorCode::MemoryError
    })?;
    Ok(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{CaptureDesc, CaptureKind, Constant, OpCode};
    use std::rc::Rc;

    fn sample() -> FunctionPrototype {
        let mut inner = FunctionPrototype::new("inner", "main");
        inner.parameter_names = vec!["x".into()];
        inner.captures.push(CaptureDesc {
            name: "y".into(),
            index: 1,
            kind: CaptureKind::OuterLocal,
        });
        inner.chunk.emit_op_u8(OpCode::LoadLocal, 1);
        inner.chunk.emit_op(OpCode::Return);

        let mut proto = FunctionPrototype::new("main", "main");
        let idx = proto.chunk.add_constant(Constant::Str("hello".into())).unwrap();
        proto.chunk.mark(1, 1);
        proto.chunk.emit_op_u16(OpCode::Const, idx);
        proto.chunk.emit_op(OpCode::Return);
        proto.functions.push(Rc::new(inner));
        proto
    }

    #[test]
    fn test_roundtrip_preserves_prototype() {
        let proto = sample();
        let bytes = to_bytes(&proto).unwrap();
        assert_eq!(from_bytes(&bytes).unwrap(), proto);
    }

    #[test]
    fn test_truncated_input_is_memory_error() {
        let bytes = to_bytes(&sample()).unwrap();
        for cut in [0, 3, 4, bytes.len() / 2, bytes.len() - 1] {
            assert_eq!(from_bytes(&bytes[..cut]), Err(ErrorCode::MemoryError), "cut at {cut}");
        }
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = to_bytes(&sample()).unwrap();
        bytes.push(0);
        assert_eq!(from_bytes(&bytes), Err(ErrorCode::MemoryError));
    }

    #[test]
    fn test_invalid_opcode_is_rejected() {
        let mut proto = sample();
        proto.chunk.code.push(0x99);
        let bytes = to_bytes(&proto).unwrap();
        assert_eq!(from_bytes(&bytes), Err(ErrorCode::MemoryError));
    }
}
