//! Deterministic binary codec.
//!
//! Layout: one kind byte, then the payload. Integers are little-endian,
//! sequences carry a `u32` count prefix, strings a `u32` byte-length prefix
//! followed by UTF-8. Encoding the same logical message always produces
//! byte-identical output, which is what makes round-trip testing and
//! response comparison meaningful.
//!
//! Decoding is bounds-checked field by field and reports:
//!
//! - [`DecodeError::Truncated`] when the buffer ends before a declared field,
//! - [`DecodeError::UnknownType`] for an unrecognized variable type tag,
//! - [`DecodeError::SchemaMismatch`] when the declared kind and the payload
//!   disagree (unknown kind byte, trailing bytes, wrong kind for a
//!   kind-specific decode, out-of-range boolean, invalid UTF-8).

use bytes::BufMut;

use crate::{
    error::DecodeError,
    message::{Attach, AttachAck, Message, MessageKind, StepRequest, StepResponse},
    value::{Value, ValueKind, Variable},
};

/// Size of the length prefix framing a message on a byte stream.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Upper bound on one encoded message, framing excluded.
///
/// Matches the pre-sized transfer buffers of the transport layer; a declared
/// length above this is rejected before any allocation happens.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encode `message` with its 4-byte length prefix, ready for a byte stream.
pub fn encode_framed(message: &Message) -> Vec<u8> {
    let mut body = Vec::new();
    message.encode(&mut body);

    let mut framed = Vec::with_capacity(LENGTH_PREFIX_SIZE + body.len());
    framed.put_u32_le(u32::try_from(body.len()).unwrap_or(u32::MAX));
    framed.extend_from_slice(&body);
    framed
}

impl Message {
    /// Append the encoded form of this message to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.kind().byte());
        match self {
            Self::StepRequest(request) => {
                buf.put_u64_le(request.timestep_us);
                encode_variables(&request.inputs, buf);
            },
            Self::StepResponse(response) => {
                encode_variables(&response.outputs, buf);
            },
            Self::Attach(attach) => {
                buf.put_u32_le(attach.unit_id);
            },
            Self::AttachAck(ack) => {
                buf.put_u32_le(ack.unit_id);
                buf.put_u8(u8::from(ack.accepted));
            },
        }
    }

    /// Encode into a fresh buffer.
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode(&mut buf);
        buf
    }

    /// Decode one complete message from `buf`.
    ///
    /// The whole buffer must be consumed; trailing bytes mean the declared
    /// kind does not match the payload present.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(buf);
        let kind = reader.u8()?;

        let message = match kind {
            k if k == MessageKind::StepRequest.byte() => {
                let timestep_us = reader.u64()?;
                let inputs = decode_variables(&mut reader)?;
                Self::StepRequest(StepRequest { timestep_us, inputs })
            },
            k if k == MessageKind::StepResponse.byte() => {
                let outputs = decode_variables(&mut reader)?;
                Self::StepResponse(StepResponse { outputs })
            },
            k if k == MessageKind::Attach.byte() => {
                Self::Attach(Attach { unit_id: reader.u32()? })
            },
            k if k == MessageKind::AttachAck.byte() => {
                let unit_id = reader.u32()?;
                let accepted = reader.bool()?;
                Self::AttachAck(AttachAck { unit_id, accepted })
            },
            k => {
                return Err(DecodeError::mismatch(format!("unknown message kind {k:#04x}")));
            },
        };

        reader.finish()?;
        Ok(message)
    }

    /// Decode a message that must be a [`StepRequest`].
    pub fn decode_request(buf: &[u8]) -> Result<StepRequest, DecodeError> {
        match Self::decode(buf)? {
            Self::StepRequest(request) => Ok(request),
            other => Err(DecodeError::mismatch(format!(
                "expected step request, got {:?}",
                other.kind()
            ))),
        }
    }

    /// Decode a message that must be a [`StepResponse`].
    pub fn decode_response(buf: &[u8]) -> Result<StepResponse, DecodeError> {
        match Self::decode(buf)? {
            Self::StepResponse(response) => Ok(response),
            other => Err(DecodeError::mismatch(format!(
                "expected step response, got {:?}",
                other.kind()
            ))),
        }
    }
}

fn encode_variables(variables: &[Variable], buf: &mut Vec<u8>) {
    buf.put_u32_le(u32::try_from(variables.len()).unwrap_or(u32::MAX));
    for variable in variables {
        buf.put_u32_le(variable.reference);
        buf.put_u8(variable.value.kind().tag());
        match &variable.value {
            Value::Real(v) => buf.put_f64_le(*v),
            Value::Integer(v) => buf.put_i32_le(*v),
            Value::Boolean(v) => buf.put_u8(u8::from(*v)),
            Value::String(v) => {
                buf.put_u32_le(u32::try_from(v.len()).unwrap_or(u32::MAX));
                buf.extend_from_slice(v.as_bytes());
            },
        }
    }
}

fn decode_variables(reader: &mut Reader<'_>) -> Result<Vec<Variable>, DecodeError> {
    let count = reader.u32()? as usize;

    // Pre-size conservatively: a hostile count must not drive allocation
    // beyond what the buffer can actually hold (5 bytes per variable floor).
    let mut variables = Vec::with_capacity(count.min(reader.remaining() / 5 + 1));

    for _ in 0..count {
        let reference = reader.u32()?;
        let kind = ValueKind::from_tag(reader.u8()?)?;
        let value = match kind {
            ValueKind::Real => Value::Real(reader.f64()?),
            ValueKind::Integer => Value::Integer(reader.i32()?),
            ValueKind::Boolean => Value::Boolean(reader.bool()?),
            ValueKind::String => {
                let len = reader.u32()? as usize;
                let bytes = reader.take(len)?;
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    DecodeError::mismatch(format!(
                        "invalid UTF-8 in string value of reference {reference}: {e}"
                    ))
                })?;
                Value::String(text.to_owned())
            },
        };
        variables.push(Variable { reference, value });
    }

    Ok(variables)
}

/// Bounds-checked cursor over an immutable buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::Truncated {
            expected: usize::MAX,
            actual: self.buf.len(),
        })?;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated { expected: end, actual: self.buf.len() });
        }
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::mismatch(format!("boolean out of range: {other}"))),
        }
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Assert the buffer is fully consumed.
    fn finish(self) -> Result<(), DecodeError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(DecodeError::mismatch(format!(
                "{} trailing bytes after payload",
                self.buf.len() - self.pos
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use hex_literal::hex;
    use proptest::prelude::*;

    use super::*;

    fn sample_request() -> Message {
        Message::StepRequest(StepRequest {
            timestep_us: 1000,
            inputs: vec![
                Variable::new(7, Value::Real(2.5)),
                Variable::new(9, Value::Integer(-3)),
                Variable::new(11, Value::Boolean(true)),
            ],
        })
    }

    #[test]
    fn request_golden_bytes() {
        let encoded = sample_request().encode_to_vec();

        // kind=1, timestep=1000 LE, count=3, then (ref, tag, value) triples.
        let expected = hex!(
            "01" "e803000000000000" "03000000"
            "07000000" "00" "0000000000000440"
            "09000000" "01" "fdffffff"
            "0b000000" "02" "01"
        );
        assert_eq!(encoded, expected);
    }

    #[test]
    fn encoding_is_deterministic() {
        assert_eq!(sample_request().encode_to_vec(), sample_request().encode_to_vec());
    }

    #[test]
    fn request_roundtrip() {
        let message = sample_request();
        let decoded = Message::decode(&message.encode_to_vec()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn response_roundtrip_with_string() {
        let message = Message::StepResponse(StepResponse {
            outputs: vec![
                Variable::new(1, Value::String("overload".to_owned())),
                Variable::new(2, Value::Real(f64::MIN_POSITIVE)),
            ],
        });
        let decoded = Message::decode(&message.encode_to_vec()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn empty_inputs_roundtrip() {
        let message = Message::StepRequest(StepRequest { timestep_us: 1, inputs: vec![] });
        let decoded = Message::decode(&message.encode_to_vec()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn attach_roundtrip() {
        let attach = Message::Attach(Attach { unit_id: 42 });
        assert_eq!(Message::decode(&attach.encode_to_vec()).unwrap(), attach);

        let ack = Message::AttachAck(AttachAck { unit_id: 42, accepted: true });
        assert_eq!(Message::decode(&ack.encode_to_vec()).unwrap(), ack);
    }

    #[test]
    fn truncated_buffer_reports_truncated() {
        let encoded = sample_request().encode_to_vec();

        for cut in 0..encoded.len() {
            let result = Message::decode(&encoded[..cut]);
            assert!(
                matches!(result, Err(DecodeError::Truncated { .. })),
                "cut at {cut}: {result:?}"
            );
        }

        // The codec holds no state: the full buffer still decodes after the
        // truncated attempts.
        assert!(Message::decode(&encoded).is_ok());
    }

    #[test]
    fn unknown_type_tag_rejected() {
        // StepResponse with one variable whose tag byte is 9.
        let mut buf = vec![MessageKind::StepResponse.byte()];
        buf.put_u32_le(1);
        buf.put_u32_le(5);
        buf.put_u8(9);

        assert_eq!(Message::decode(&buf), Err(DecodeError::UnknownType { tag: 9 }));
    }

    #[test]
    fn unknown_kind_is_schema_mismatch() {
        let result = Message::decode(&[0xff]);
        assert!(matches!(result, Err(DecodeError::SchemaMismatch { .. })), "{result:?}");
    }

    #[test]
    fn trailing_bytes_are_schema_mismatch() {
        let mut encoded = sample_request().encode_to_vec();
        encoded.push(0);

        let result = Message::decode(&encoded);
        assert!(matches!(result, Err(DecodeError::SchemaMismatch { .. })), "{result:?}");
    }

    #[test]
    fn wrong_kind_for_specific_decode() {
        let response = Message::StepResponse(StepResponse { outputs: vec![] });
        let result = Message::decode_request(&response.encode_to_vec());
        assert!(matches!(result, Err(DecodeError::SchemaMismatch { .. })), "{result:?}");

        let request = sample_request();
        let result = Message::decode_response(&request.encode_to_vec());
        assert!(matches!(result, Err(DecodeError::SchemaMismatch { .. })), "{result:?}");
    }

    #[test]
    fn out_of_range_boolean_rejected() {
        let mut buf = vec![MessageKind::StepResponse.byte()];
        buf.put_u32_le(1);
        buf.put_u32_le(3);
        buf.put_u8(ValueKind::Boolean.tag());
        buf.put_u8(2);

        let result = Message::decode(&buf);
        assert!(matches!(result, Err(DecodeError::SchemaMismatch { .. })), "{result:?}");
    }

    #[test]
    fn hostile_count_does_not_overallocate() {
        // Declares u32::MAX variables but carries none.
        let mut buf = vec![MessageKind::StepResponse.byte()];
        buf.put_u32_le(u32::MAX);

        let result = Message::decode(&buf);
        assert!(matches!(result, Err(DecodeError::Truncated { .. })), "{result:?}");
    }

    #[test]
    fn framed_message_carries_length_prefix() {
        let message = sample_request();
        let framed = encode_framed(&message);
        let body = message.encode_to_vec();

        assert_eq!(&framed[..LENGTH_PREFIX_SIZE], (body.len() as u32).to_le_bytes());
        assert_eq!(&framed[LENGTH_PREFIX_SIZE..], body);
    }

    fn value_strategy() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<f64>().prop_filter("NaN breaks equality", |v| !v.is_nan()).prop_map(Value::Real),
            any::<i32>().prop_map(Value::Integer),
            any::<bool>().prop_map(Value::Boolean),
            "[ -~]{0,32}".prop_map(Value::String),
        ]
    }

    fn variables_strategy() -> impl Strategy<Value = Vec<Variable>> {
        prop::collection::vec(
            (any::<u32>(), value_strategy()).prop_map(|(reference, value)| Variable {
                reference,
                value,
            }),
            0..16,
        )
    }

    proptest! {
        #[test]
        fn roundtrip_request(timestep_us in 1u64.., inputs in variables_strategy()) {
            let message = Message::StepRequest(StepRequest { timestep_us, inputs });
            prop_assert_eq!(Message::decode(&message.encode_to_vec()).unwrap(), message);
        }

        #[test]
        fn roundtrip_response(outputs in variables_strategy()) {
            let message = Message::StepResponse(StepResponse { outputs });
            prop_assert_eq!(Message::decode(&message.encode_to_vec()).unwrap(), message);
        }

        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = Message::decode(&bytes);
        }
    }
}
