//! Framing between a client and its supervisor
//!
//! Every frame is a little-endian `u32` body length followed by the body. File
//! descriptors never appear in the bytes: they travel as `SCM_RIGHTS` ancillary data
//! sent together with the first chunk of the frame, and the request body carries a
//! mask saying which of the optional descriptors are attached.

use thiserror::Error;

pub(crate) use crate::wire::codec::{Decoder, Encoder};
pub use crate::wire::fds::{MAX_FDS_PER_MESSAGE, recv_with_fds, send_with_fds};
pub use crate::wire::request::{FdMask, Request, RequestFds, decode_request, encode_request};
pub use crate::wire::response::{decode_response, encode_response};

mod codec;
mod fds;
mod request;
mod response;

/// Bytes taken by the length prefix
pub const LEN_PREFIX: usize = 4;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// Errors produced while encoding or decoding frames
#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame body of {0} bytes exceeds the limit of {MAX_FRAME_LEN} bytes")]
    FrameTooLarge(usize),

    #[error("frame is truncated")]
    Truncated,

    #[error("frame has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("invalid boolean byte {0}")]
    InvalidBool(u8),

    #[error("invalid nanoseconds value {0}")]
    InvalidNanos(u32),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown {what} tag {tag}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("invalid file descriptor mask {0:#x}")]
    InvalidFdMask(u8),

    #[error("frame expects {expected} file descriptors but {received} were received")]
    MissingFds { expected: usize, received: usize },

    #[error("invalid si_code {0}")]
    InvalidSiCode(i32),
}

/// Length of the complete frame starting at `buf`, once its prefix is available
pub fn frame_len(buf: &[u8]) -> Result<Option<usize>, WireError> {
    let Some(prefix) = buf.get(..LEN_PREFIX) else {
        return Ok(None);
    };
    let mut len = [0u8; LEN_PREFIX];
    len.copy_from_slice(prefix);
    let body_len = u32::from_le_bytes(len) as usize;
    if body_len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body_len));
    }
    Ok(Some(LEN_PREFIX + body_len))
}
