use std::fmt;

const COLUMNS: usize = 16;
const INVERSE_BIT: u8 = 0x80;

/// Text column rendering of one byte.  Inverse video characters show as
/// their normal counterparts.
fn printable(b: u8) -> char {
    match b & !INVERSE_BIT {
        c @ 0x20..=0x7A => c as char,
        _ => '.',
    }
}

/// Write a hexdump of the provided byte slice, numbering rows from `base`.
pub fn hexdump(f: &mut fmt::Formatter, base: usize, buffer: &[u8]) -> fmt::Result {
    if buffer.is_empty() {
        // For a zero-length buffer, at least print an offset instead of
        // nothing.
        return write!(f, "{:04x}:", base);
    }
    for (n, row) in buffer.chunks(COLUMNS).enumerate() {
        if n > 0 {
            writeln!(f)?;
        }
        write!(f, "{:04x}: ", base + n * COLUMNS)?;
        for b in row {
            write!(f, "{:02x} ", b)?;
        }
        for _ in row.len()..COLUMNS {
            write!(f, "   ")?;
        }
        let text: String = row.iter().map(|&b| printable(b)).collect();
        write!(f, "{}", text)?;
    }
    Ok(())
}

/// Displays as a hexdump.
pub struct Hex<'a> {
    bytes: &'a [u8],
    base: usize,
}

impl<'a> fmt::Display for Hex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        hexdump(f, self.base, self.bytes)
    }
}

pub fn hex(bytes: &[u8]) -> Hex {
    Hex { bytes, base: 0 }
}

/// A hexdump whose offsets start at `base` rather than zero.
pub fn hex_at(bytes: &[u8], base: usize) -> Hex {
    Hex { bytes, base }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[]).to_string(), "0000:");
        assert_eq!(
            hex(b"HI\x9b").to_string(),
            format!("0000: 48 49 9b {}HI.", "   ".repeat(13))
        );
        let bytes: Vec<u8> = (0x41..0x41 + 17).collect();
        assert_eq!(
            hex(&bytes).to_string(),
            format!(
                "0000: 41 42 43 44 45 46 47 48 49 4a 4b 4c 4d 4e 4f 50 ABCDEFGHIJKLMNOP\n\
                 0010: 51 {}Q",
                "   ".repeat(15)
            )
        );
    }

    #[test]
    fn test_hex_at_and_inverse() {
        assert_eq!(
            hex_at(&[0xC1, 0x00], 0x80).to_string(),
            format!("0080: c1 00 {}A.", "   ".repeat(14))
        );
    }
}
