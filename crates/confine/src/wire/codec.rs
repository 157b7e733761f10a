//! Little-endian primitives shared by the request and response frames

use std::time::Duration;

use crate::wire::{LEN_PREFIX, MAX_FRAME_LEN, WireError};

/// Builds one length-prefixed frame
#[derive(Debug)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self {
            buf: vec![0; LEN_PREFIX],
        }
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.u8(v as u8);
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) -> Result<(), WireError> {
        let len = u32::try_from(v.len()).map_err(|_| WireError::FrameTooLarge(v.len()))?;
        self.u32(len);
        self.buf.extend_from_slice(v);
        Ok(())
    }

    pub fn str(&mut self, v: &str) -> Result<(), WireError> {
        self.bytes(v.as_bytes())
    }

    pub fn strings(&mut self, v: &[String]) -> Result<(), WireError> {
        let len = u32::try_from(v.len()).map_err(|_| WireError::FrameTooLarge(v.len()))?;
        self.u32(len);
        for s in v {
            self.str(s)?;
        }
        Ok(())
    }

    pub fn opt_u32(&mut self, v: Option<u32>) {
        self.bool(v.is_some());
        if let Some(v) = v {
            self.u32(v);
        }
    }

    pub fn opt_u64(&mut self, v: Option<u64>) {
        self.bool(v.is_some());
        if let Some(v) = v {
            self.u64(v);
        }
    }

    pub fn opt_str(&mut self, v: Option<&str>) -> Result<(), WireError> {
        self.bool(v.is_some());
        match v {
            Some(v) => self.str(v),
            None => Ok(()),
        }
    }

    pub fn duration(&mut self, v: Duration) {
        self.u64(v.as_secs());
        self.u32(v.subsec_nanos());
    }

    pub fn opt_duration(&mut self, v: Option<Duration>) {
        self.bool(v.is_some());
        if let Some(v) = v {
            self.duration(v);
        }
    }

    /// Fill in the length prefix and return the frame
    pub fn finish(mut self) -> Result<Vec<u8>, WireError> {
        let body_len = self.buf.len() - LEN_PREFIX;
        if body_len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(body_len));
        }
        self.buf[..LEN_PREFIX].copy_from_slice(&(body_len as u32).to_le_bytes());
        Ok(self.buf)
    }
}

/// Reads the body of one frame
#[derive(Debug)]
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(body: &'a [u8]) -> Self {
        Self { buf: body }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated);
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, WireError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::InvalidBool(other)),
        }
    }

    pub fn u32(&mut self) -> Result<u32, WireError> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> Result<i32, WireError> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> Result<u64, WireError> {
        self.array().map(u64::from_le_bytes)
    }

    pub fn bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn strings(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.u32()? as usize;
        // Every string takes at least its 4-byte length, so a bogus count fails fast
        if count > self.buf.len() / 4 {
            return Err(WireError::Truncated);
        }
        (0..count).map(|_| self.string()).collect()
    }

    fn opt<T>(
        &mut self,
        read: impl FnOnce(&mut Self) -> Result<T, WireError>,
    ) -> Result<Option<T>, WireError> {
        if self.bool()? { read(self).map(Some) } else { Ok(None) }
    }

    pub fn opt_u32(&mut self) -> Result<Option<u32>, WireError> {
        self.opt(Self::u32)
    }

    pub fn opt_u64(&mut self) -> Result<Option<u64>, WireError> {
        self.opt(Self::u64)
    }

    pub fn opt_string(&mut self) -> Result<Option<String>, WireError> {
        self.opt(Self::string)
    }

    pub fn duration(&mut self) -> Result<Duration, WireError> {
        let secs = self.u64()?;
        let nanos = self.u32()?;
        if nanos >= 1_000_000_000 {
            return Err(WireError::InvalidNanos(nanos));
        }
        Ok(Duration::new(secs, nanos))
    }

    pub fn opt_duration(&mut self) -> Result<Option<Duration>, WireError> {
        self.opt(Self::duration)
    }

    /// Every byte of the body has to be consumed
    pub fn finish(self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len()))
        }
    }
}
