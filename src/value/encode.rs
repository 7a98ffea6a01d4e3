// Copyright 2026 Strata Project Authors. Licensed under Apache-2.0.

use bytes::{Buf, BufMut};

use super::F64;

/// Encode one column value into the canonical stream representation.
///
/// Fixed-width values are stored as consecutive little-endian bytes.
/// Var-len values carry a `u32` length prefix so streams stay
/// self-delimiting.
pub trait NativeType: Clone + Ord + Send + Sync + 'static {
    /// Byte width of the encoded value, `None` for var-len types.
    const WIDTH: Option<usize>;

    fn encode(&self, buf: &mut impl BufMut);

    fn decode(buf: &mut impl Buf) -> Self;

    /// Encoded length including any length prefix.
    fn encoded_len(&self) -> usize;
}

impl NativeType for i32 {
    const WIDTH: Option<usize> = Some(std::mem::size_of::<i32>());

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_i32_le()
    }

    fn encoded_len(&self) -> usize {
        std::mem::size_of::<i32>()
    }
}

impl NativeType for i64 {
    const WIDTH: Option<usize> = Some(std::mem::size_of::<i64>());

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i64_le(*self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        buf.get_i64_le()
    }

    fn encoded_len(&self) -> usize {
        std::mem::size_of::<i64>()
    }
}

impl NativeType for F64 {
    const WIDTH: Option<usize> = Some(std::mem::size_of::<f64>());

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_f64_le(self.into_inner());
    }

    fn decode(buf: &mut impl Buf) -> Self {
        F64::from(buf.get_f64_le())
    }

    fn encoded_len(&self) -> usize {
        std::mem::size_of::<f64>()
    }
}

impl NativeType for String {
    const WIDTH: Option<usize> = None;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self.as_bytes());
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let len = buf.get_u32_le() as usize;
        let mut bytes = vec![0; len];
        buf.copy_to_slice(&mut bytes);
        String::from_utf8(bytes).expect("corrupted utf8 value")
    }

    fn encoded_len(&self) -> usize {
        std::mem::size_of::<u32>() + self.len()
    }
}

impl NativeType for Vec<u8> {
    const WIDTH: Option<usize> = None;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.len() as u32);
        buf.put_slice(self);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let len = buf.get_u32_le() as usize;
        let mut bytes = vec![0; len];
        buf.copy_to_slice(&mut bytes);
        bytes
    }

    fn encoded_len(&self) -> usize {
        std::mem::size_of::<u32>() + self.len()
    }
}
