//! Atari DOS filenames.
//!
//! A directory entry stores a filename as 11 ATASCII bytes: an 8-character
//! name and a 3-character extension, both padded with spaces.  A set high bit
//! marks an inverse-video character.  For display, and for naming files in a
//! directory index, names are rendered as escaped text:
//!
//! * `\i` toggles inverse video on or off
//! * `\xHH` is a raw character given in hex
//! * `\ ` is a space and `\\` is a backslash
//! * `.` separates the name from the extension

use std::fmt;
use std::io;
use std::str::FromStr;

use crate::disk::DiskError;

pub const NAME_SIZE: usize = 8;
pub const EXTENSION_SIZE: usize = 3;
pub const FILENAME_SIZE: usize = NAME_SIZE + EXTENSION_SIZE;

const PADDING_BYTE: u8 = b' ';
const INVERSE_BIT: u8 = 0x80;
const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Characters that are written as `\xHH` rather than literally.  This adds
/// `.` to the usual control and `{`/`}`-and-above set: a literal dot would
/// read back as the extension separator.
#[inline]
fn needs_hex_escape(b: u8) -> bool {
    b < 0x20 || b == b'{' || b >= 0x7D || b == b'.'
}

/// An 8.3 Atari filename in its raw on-disk form.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtariName([u8; FILENAME_SIZE]);

impl AtariName {
    pub fn from_bytes(bytes: &[u8]) -> AtariName {
        let mut name = [PADDING_BYTE; FILENAME_SIZE];
        let length = bytes.len().min(FILENAME_SIZE);
        name[..length].copy_from_slice(&bytes[..length]);
        AtariName(name)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True if every byte is a (non-inverse) space.
    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|&b| b == PADDING_BYTE)
    }

    /// Render the name as escaped text.  Trailing spaces of the name and of
    /// the extension are dropped, as is the dot when the extension is empty.
    ///
    /// Dropping trailing spaces can cut an inverse run short; the run is then
    /// closed with `\i` before the dot, so the text parses back to the same
    /// bytes.  This and the escaped `.` are the two departures from a plain
    /// escape of every byte; DESIGN.md records both.
    pub fn to_escaped_string(&self) -> String {
        let mut text: Vec<u8> = Vec::with_capacity(4 * FILENAME_SIZE);
        let mut inverse = false;
        let mut non_space = 0;
        // Inverse state at the cut point; a run left open there must be
        // closed again before the dot.
        let mut cut_inverse = false;

        for (i, &raw) in self.0.iter().enumerate() {
            if i == NAME_SIZE && !inverse {
                text.truncate(non_space);
                if cut_inverse {
                    text.extend_from_slice(b"\\i");
                }
                text.push(b'.');
            }
            let b = raw & !INVERSE_BIT;
            if (raw & INVERSE_BIT != 0) != inverse {
                inverse = !inverse;
                text.extend_from_slice(b"\\i");
            }
            if needs_hex_escape(b) {
                text.extend_from_slice(&[
                    b'\\',
                    b'x',
                    HEX_DIGITS[(b >> 4) as usize],
                    HEX_DIGITS[(b & 0x0F) as usize],
                ]);
            } else {
                if b == b' ' || b == b'\\' {
                    text.push(b'\\');
                }
                text.push(b);
            }
            if b != b' ' || inverse {
                non_space = text.len();
                cut_inverse = inverse;
            }
        }
        text.truncate(non_space);
        // Every byte pushed above is printable ASCII.
        text.into_iter().map(|b| b as char).collect()
    }

    /// Parse escaped text up to the first unescaped space after the name has
    /// started.  Returns the name and the rest of the input following that
    /// space.
    pub fn parse_prefix(text: &str) -> io::Result<(AtariName, &str)> {
        let bytes = text.as_bytes();
        let mut name = [PADDING_BYTE; FILENAME_SIZE];
        let mut inverse = false;
        let mut i = 0;
        let mut pos = 0;

        while pos < bytes.len() {
            let mut c = bytes[pos];
            pos += 1;
            match c {
                b' ' if i == 0 => continue,
                b' ' => break,
                b'\\' => {
                    let escaped = match bytes.get(pos) {
                        Some(&e) => e,
                        None => break,
                    };
                    pos += 1;
                    match escaped {
                        b'i' => {
                            inverse = !inverse;
                            continue;
                        }
                        b'x' => {
                            let digits = text
                                .get(pos..pos + 2)
                                .ok_or_else(|| DiskError::InvalidIndex.to_io_error())?;
                            c = u8::from_str_radix(digits, 16)
                                .map_err(|_| DiskError::InvalidIndex.to_io_error())?;
                            pos += 2;
                        }
                        other => c = other,
                    }
                }
                b'.' if i <= NAME_SIZE => {
                    i = NAME_SIZE;
                    continue;
                }
                _ => {}
            }
            if i >= FILENAME_SIZE {
                return Err(DiskError::NameTooLong.into());
            }
            name[i] = if inverse { c | INVERSE_BIT } else { c };
            i += 1;
        }
        Ok((AtariName(name), &text[pos..]))
    }

    /// Parse a complete escaped name.
    pub fn parse(text: &str) -> io::Result<AtariName> {
        let (name, rest) = Self::parse_prefix(text)?;
        if rest.trim().is_empty() {
            Ok(name)
        } else {
            Err(DiskError::InvalidIndex.into())
        }
    }
}

impl FromStr for AtariName {
    type Err = io::Error;

    fn from_str(s: &str) -> io::Result<AtariName> {
        AtariName::parse(s)
    }
}

impl From<[u8; FILENAME_SIZE]> for AtariName {
    fn from(bytes: [u8; FILENAME_SIZE]) -> AtariName {
        AtariName(bytes)
    }
}

impl Into<String> for AtariName {
    fn into(self) -> String {
        self.to_escaped_string()
    }
}

impl fmt::Display for AtariName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.pad(&self.to_escaped_string())
    }
}

impl fmt::Debug for AtariName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self.to_escaped_string())
    }
}
