use std::io::{Cursor, Read};

use bytes::BufMut;

use crate::ofp_message::OfpSerializationError;

macro_rules! create_empty_wrapper {
    ($wrapped_name:ident, $wrapper_name:ident) => {
        #[allow(dead_code)]
        struct $wrapper_name {}
    };
}

/// Declares a fieldless enum backed by OpenFlow numeric codes, with `from_code` and `code`
/// conversions.
macro_rules! code_enum {
    ($(#[$meta:meta])* $repr:ty, $name:ident { $($variant:ident = $value:expr),* $(,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub fn from_code(code: $repr) -> Option<$name> {
                match code {
                    $(v if v == $value => Some($name::$variant),)*
                    _ => None,
                }
            }

            pub fn code(self) -> $repr {
                match self {
                    $($name::$variant => $value),*
                }
            }
        }
    };
}

pub fn write_padding_bytes(bytes: &mut Vec<u8>, count: usize) {
    bytes.put_bytes(0, count);
}

/// Number of unread bytes left in `bytes`.
pub fn remaining(bytes: &Cursor<&[u8]>) -> usize {
    bytes.get_ref().len().saturating_sub(bytes.position() as usize)
}

/// Skip `count` bytes, failing if the buffer is too short.
pub fn skip(bytes: &mut Cursor<&[u8]>, count: usize) -> Result<(), OfpSerializationError> {
    if remaining(bytes) < count {
        return Err(OfpSerializationError::ParsingError {
            message: format!("expected {} more bytes, {} left", count, remaining(bytes)),
        });
    }
    bytes.set_position(bytes.position() + count as u64);
    Ok(())
}

/// Read a NUL-padded string occupying exactly `max_capacity` bytes.
pub fn read_fixed_size_string(
    bytes: &mut Cursor<&[u8]>,
    max_capacity: usize,
) -> Result<String, OfpSerializationError> {
    let mut arr = vec![0; max_capacity];
    bytes.read_exact(&mut arr)?;
    let end = arr.iter().position(|c| *c == 0).unwrap_or(max_capacity);
    arr.truncate(end);
    Ok(String::from_utf8_lossy(&arr).into_owned())
}

/// Write `s` into exactly `max_capacity` bytes, truncating and NUL padding as needed. The
/// last byte is always NUL.
pub fn write_fixed_size_string(bytes: &mut Vec<u8>, s: &str, max_capacity: usize) {
    let raw = s.as_bytes();
    let len = raw.len().min(max_capacity.saturating_sub(1));
    bytes.put_slice(&raw[..len]);
    write_padding_bytes(bytes, max_capacity - len);
}
