//! Primitives for encoding and decoding wire data

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Error indicating that a buffer ended earlier than a decoder expected
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("unexpected end of buffer")]
pub struct UnexpectedEnd;

/// Outcome of a decode operation
pub type Result<T> = ::std::result::Result<T, UnexpectedEnd>;

/// A type that can be read from and written to a byte buffer
pub trait Codec: Sized {
    /// Decode a `Self` from the front of `buf`
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;
    /// Append `self` to `buf`
    fn encode<B: BufMut>(&self, buf: &mut B);
}

impl Codec for u8 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 1 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u8())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self);
    }
}

impl Codec for u16 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 2 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u16())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(*self);
    }
}

impl Codec for u32 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u32())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32(*self);
    }
}

impl Codec for u64 {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 8 {
            return Err(UnexpectedEnd);
        }
        Ok(buf.get_u64())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u64(*self);
    }
}

impl Codec for Ipv4Addr {
    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(UnexpectedEnd);
        }
        let mut octets = [0; 4];
        buf.copy_to_slice(&mut octets);
        Ok(octets.into())
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.octets());
    }
}

/// Convenience for reading `Codec` values out of a `Buf`
pub trait BufExt {
    /// Decode a `T` from the front of `self`
    fn get<T: Codec>(&mut self) -> Result<T>;
    /// Copy `len` raw bytes from the front of `self`
    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]>;
}

impl<T: Buf> BufExt for T {
    fn get<U: Codec>(&mut self) -> Result<U> {
        U::decode(self)
    }

    fn get_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; N];
        self.copy_to_slice(&mut bytes);
        Ok(bytes)
    }
}

/// Convenience for writing `Codec` values into a `BufMut`
pub trait BufMutExt {
    /// Append `x` to `self`
    fn write<T: Codec>(&mut self, x: T);
}

impl<T: BufMut> BufMutExt for T {
    fn write<U: Codec>(&mut self, x: U) {
        x.encode(self);
    }
}
