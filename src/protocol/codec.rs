use bytes::{BufMut, BytesMut};

use crate::protocol::ProtocolError;

/// System limit on identifier length (database and user names), including
/// the terminating NUL.
pub const NAME_MAX_LENGTH: usize = 64;

/// Read a NUL-terminated string starting at `offset` in a packet body.
///
/// Returns the string (without the terminator) and the offset just past it.
pub fn get_cstring(body: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    let rest = body.get(offset..).ok_or(ProtocolError::BadTerminator)?;
    let Some(null_pos) = rest.iter().position(|&b| b == 0) else {
        return Err(ProtocolError::BadTerminator);
    };
    let s = std::str::from_utf8(&rest[..null_pos]).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok((s.to_string(), offset + null_pos + 1))
}

/// Read a fixed-width NUL-padded string field from a legacy packet body.
///
/// A short body behaves as if padded with zeroes; bytes beyond the field
/// width are ignored.
pub fn get_fixed_string(body: &[u8], offset: usize, width: usize) -> Result<String, ProtocolError> {
    let end = (offset + width).min(body.len());
    let field = body.get(offset.min(body.len())..end).unwrap_or(&[]);
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..len])
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidUtf8)
}

/// Write a NUL-terminated string into an outgoing buffer.
pub fn put_cstring(dst: &mut BytesMut, s: &str) {
    dst.put_slice(s.as_bytes());
    dst.put_u8(0);
}

/// Truncate an identifier to the system name limit, in place.
pub fn truncate_name(name: &mut String) {
    if name.len() >= NAME_MAX_LENGTH {
        let mut cut = NAME_MAX_LENGTH - 1;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
}
