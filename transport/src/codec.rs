//! Generic binary encoding for typed payloads.
//!
//! Encoding is purely a function of the value: there is no schema negotiation, no versioning and
//!  no self-description on the wire. Both peers must agree on the types statically.

use std::mem::size_of;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Opens an encoded sequence, following the element count
pub const SEQ_BEGIN: u8 = b'b';
/// Closes an encoded sequence
pub const SEQ_END: u8 = b'e';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("ordinal {ordinal} is out of range for enum {type_name}")]
    InvalidEnumOrdinal { type_name: &'static str, ordinal: u64 },
    #[error("variant index {index} is out of range for {type_name}")]
    InvalidVariantIndex { type_name: &'static str, index: u64 },
    #[error("expected sequence marker {expected:?}, found {found:?}")]
    MissingMarker { expected: char, found: char },
    #[error("encoded value {value:#x} does not fit into {type_name}")]
    IntegerOutOfRange { type_name: &'static str, value: u64 },
    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("{0} trailing bytes after the decoded value")]
    TrailingBytes(usize),
}

pub type DecodeResult<T> = Result<T, DecodeError>;

/// A value with a binary wire representation.
///
/// Decoding mirrors encoding exactly: `deser` consumes exactly the bytes `ser` produced for the
///  same value and leaves the rest of the buffer untouched. Decoding never reads past the end of
///  the buffer; running out of bytes is reported as [DecodeError::Truncated].
pub trait Wire: Sized {
    fn ser(&self, buf: &mut impl BufMut);
    fn deser(buf: &mut impl Buf) -> DecodeResult<Self>;
}

/// Encodes a value into a fresh buffer
pub fn encode_to_vec<T: Wire>(value: &T) -> Vec<u8> {
    let mut buf = Vec::new();
    value.ser(&mut buf);
    buf
}

/// Decodes a value that is expected to occupy the entire buffer
pub fn decode_exact<T: Wire>(mut bytes: &[u8]) -> DecodeResult<T> {
    let result = T::deser(&mut bytes)?;
    if bytes.has_remaining() {
        return Err(DecodeError::TrailingBytes(bytes.remaining()));
    }
    Ok(result)
}

fn check_remaining(buf: &impl Buf, needed: usize) -> DecodeResult<()> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated { needed, remaining: buf.remaining() });
    }
    Ok(())
}

macro_rules! checked_get_impl {
    ($checked_getter: ident, $ty:ty, $getter: ident) => {
        fn $checked_getter(&mut self) -> DecodeResult<$ty> {
            check_remaining(&*self, size_of::<$ty>())?;
            Ok(self.$getter())
        }
    }
}

/// [Buf] getters that report underflow as an error instead of panicking
pub trait CheckedBuf: Buf + Sized {
    checked_get_impl!(checked_get_u8, u8, get_u8);
    checked_get_impl!(checked_get_i8, i8, get_i8);
    checked_get_impl!(checked_get_u64, u64, get_u64);

    fn checked_copy_to_vec(&mut self, len: usize) -> DecodeResult<Vec<u8>> {
        check_remaining(&*self, len)?;
        let mut result = vec![0u8; len];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    fn expect_marker(&mut self, expected: u8) -> DecodeResult<()> {
        let found = self.checked_get_u8()?;
        if found != expected {
            return Err(DecodeError::MissingMarker { expected: expected as char, found: found as char });
        }
        Ok(())
    }
}
impl <B: Buf> CheckedBuf for B {}

/// Writes the prefix of a sequence with `len` elements
pub fn ser_seq_header(len: usize, buf: &mut impl BufMut) {
    (len as u64).ser(buf);
    buf.put_u8(SEQ_BEGIN);
}

/// Reads the prefix of a sequence, returning its element count
pub fn deser_seq_header(buf: &mut impl Buf) -> DecodeResult<usize> {
    let len = usize::deser(buf)?;
    buf.expect_marker(SEQ_BEGIN)?;
    Ok(len)
}

macro_rules! wire_unsigned {
    ($($ty:ty),*) => {$(
        impl Wire for $ty {
            fn ser(&self, buf: &mut impl BufMut) {
                buf.put_u64(*self as u64);
            }

            fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
                let raw = buf.checked_get_u64()?;
                <$ty>::try_from(raw)
                    .map_err(|_| DecodeError::IntegerOutOfRange { type_name: stringify!($ty), value: raw })
            }
        }
    )*}
}
wire_unsigned!(u16, u32, u64, usize);

macro_rules! wire_signed {
    ($($ty:ty),*) => {$(
        impl Wire for $ty {
            fn ser(&self, buf: &mut impl BufMut) {
                buf.put_i64(*self as i64);
            }

            fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
                let raw = buf.checked_get_u64()?;
                <$ty>::try_from(raw as i64)
                    .map_err(|_| DecodeError::IntegerOutOfRange { type_name: stringify!($ty), value: raw })
            }
        }
    )*}
}
wire_signed!(i16, i32, i64, isize);

impl Wire for u8 {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(*self);
    }

    fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        buf.checked_get_u8()
    }
}

impl Wire for i8 {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i8(*self);
    }

    fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        buf.checked_get_i8()
    }
}

impl Wire for bool {
    fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(u8::from(*self));
    }

    fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        match buf.checked_get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }
}

impl Wire for () {
    fn ser(&self, _buf: &mut impl BufMut) {}

    fn deser(_buf: &mut impl Buf) -> DecodeResult<Self> {
        Ok(())
    }
}

impl <A: Wire, B: Wire> Wire for (A, B) {
    fn ser(&self, buf: &mut impl BufMut) {
        self.0.ser(buf);
        self.1.ser(buf);
    }

    fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        let first = A::deser(buf)?;
        let second = B::deser(buf)?;
        Ok((first, second))
    }
}

impl <T: Wire> Wire for Vec<T> {
    fn ser(&self, buf: &mut impl BufMut) {
        ser_seq_header(self.len(), buf);
        for element in self {
            element.ser(buf);
        }
        buf.put_u8(SEQ_END);
    }

    fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        let len = deser_seq_header(buf)?;

        // the count comes off the wire, so the pre-allocation is bounded by the input size
        let mut result = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            result.push(T::deser(buf)?);
        }
        buf.expect_marker(SEQ_END)?;
        Ok(result)
    }
}

impl Wire for String {
    fn ser(&self, buf: &mut impl BufMut) {
        ser_seq_header(self.len(), buf);
        buf.put_slice(self.as_bytes());
        buf.put_u8(SEQ_END);
    }

    fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        let len = deser_seq_header(buf)?;
        let raw = buf.checked_copy_to_vec(len)?;
        buf.expect_marker(SEQ_END)?;
        String::from_utf8(raw)
            .map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl <T: Wire> Wire for Option<T> {
    fn ser(&self, buf: &mut impl BufMut) {
        match self {
            None => 0u64.ser(buf),
            Some(value) => {
                1u64.ser(buf);
                value.ser(buf);
            }
        }
    }

    fn deser(buf: &mut impl Buf) -> DecodeResult<Self> {
        match u64::deser(buf)? {
            0 => Ok(None),
            1 => Ok(Some(T::deser(buf)?)),
            index => Err(DecodeError::InvalidVariantIndex { type_name: "Option", index }),
        }
    }
}
