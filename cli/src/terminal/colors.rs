use colored::Color;

pub const PRIMARY: Color = Color::TrueColor { r: 120, g: 200, b: 255 };
pub const ACCENT: Color = Color::TrueColor { r: 255, g: 190, b: 80 };
pub const SEPARATOR: Color = Color::TrueColor { r: 110, g: 110, b: 110 };
pub const TEXT_DEFAULT: Color = Color::TrueColor { r: 220, g: 220, b: 220 };

pub const IPV4_ADDR: Color = Color::TrueColor { r: 130, g: 220, b: 130 };
pub const IPV4_PREFIX: Color = Color::TrueColor { r: 90, g: 160, b: 90 };
pub const IPV6_ADDR: Color = Color::TrueColor { r: 200, g: 150, b: 255 };
pub const IPV6_PREFIX: Color = Color::TrueColor { r: 150, g: 110, b: 200 };
pub const MAC_ADDR: Color = Color::TrueColor { r: 255, g: 160, b: 200 };

/// Drops the alpha channel of an ARGB value.
pub fn from_argb(argb: u32) -> Color {
    Color::TrueColor {
        r: (argb >> 16) as u8,
        g: (argb >> 8) as u8,
        b: argb as u8,
    }
}
