use std::fmt::Write;

const BYTES_PER_LINE: usize = 16;

/// Renders `data` as offset, hex and printable-ASCII columns, 16 bytes per line.
pub fn hexdump(data: &[u8]) -> String {
    let mut out: String = String::with_capacity(data.len() * 4 + 16);
    for (line, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:04x}  ", line * BYTES_PER_LINE);
        for idx in 0..BYTES_PER_LINE {
            match chunk.get(idx) {
                Some(byte) => {
                    let _ = write!(out, "{byte:02x} ");
                }
                None => out.push_str("   "),
            }
        }
        out.push(' ');
        out.extend(chunk.iter().map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        }));
        out.push('\n');
    }
    out
}
