//! Corner-anchored geometry descriptors and placement math.
//!
//! Min-mode windows are placed by a descriptor of the form `WxH±X±Y`: exact
//! width and height, with the offset signs selecting the root corner the
//! offsets count from (`+` top/left, `-` bottom/right). `480x360-0-0` is the
//! bottom-right corner, flush with both edges.

use anyhow::Context;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Absolute placement inside the root window.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct Geometry {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

/// Root corner an anchored geometry counts its offsets from.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomRight,
    BottomLeft,
}

impl Corner {
    /// Short form conveyed to virtual window callbacks.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Corner::TopLeft => "lt",
            Corner::TopRight => "rt",
            Corner::BottomRight => "rb",
            Corner::BottomLeft => "lb",
        }
    }
}

/// Parsed `WxH±X±Y` descriptor.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct AnchoredGeometry {
    pub width: u16,
    pub height: u16,
    pub x_offset: u16,
    pub y_offset: u16,
    pub corner: Corner,
}

impl AnchoredGeometry {
    /// Resolve the descriptor against the current root size.
    ///
    /// Offsets are measured from the anchor corner toward the opposite one,
    /// so a bottom-right descriptor ends up flush with the bottom-right edge
    /// at zero offsets regardless of the root dimensions.
    #[must_use]
    pub fn resolve(&self, root_width: u16, root_height: u16) -> Geometry {
        let right_x = root_width
            .saturating_sub(self.width)
            .saturating_sub(self.x_offset);
        let bottom_y = root_height
            .saturating_sub(self.height)
            .saturating_sub(self.y_offset);
        let (x, y) = match self.corner {
            Corner::TopLeft => (self.x_offset, self.y_offset),
            Corner::TopRight => (right_x, self.y_offset),
            Corner::BottomRight => (right_x, bottom_y),
            Corner::BottomLeft => (self.x_offset, bottom_y),
        };
        Geometry {
            x: x as i16,
            y: y as i16,
            width: self.width,
            height: self.height,
        }
    }
}

impl Default for AnchoredGeometry {
    fn default() -> Self {
        // Small rectangle in the bottom-right corner.
        AnchoredGeometry {
            width: 480,
            height: 360,
            x_offset: 0,
            y_offset: 0,
            corner: Corner::BottomRight,
        }
    }
}

impl Display for AnchoredGeometry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (x_sign, y_sign) = match self.corner {
            Corner::TopLeft => ('+', '+'),
            Corner::TopRight => ('-', '+'),
            Corner::BottomRight => ('-', '-'),
            Corner::BottomLeft => ('+', '-'),
        };
        write!(
            f,
            "{}x{}{}{}{}{}",
            self.width, self.height, x_sign, self.x_offset, y_sign, self.y_offset
        )
    }
}

impl FromStr for AnchoredGeometry {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (width_str, rest) = s
            .split_once('x')
            .context("expected 'x' between width and height")?;
        let width = u16::from_str(width_str).context("width is not numeric")?;

        let x_sign_pos = rest
            .char_indices()
            .find(|&(_, c)| c == '+' || c == '-')
            .map(|(pos, _)| pos)
            .context("expected '+' or '-' after height")?;
        let height = u16::from_str(&rest[..x_sign_pos]).context("height is not numeric")?;
        let x_sign = rest.as_bytes()[x_sign_pos] as char;
        let rest = &rest[x_sign_pos + 1..];

        let y_sign_pos = rest
            .char_indices()
            .find(|&(_, c)| c == '+' || c == '-')
            .map(|(pos, _)| pos)
            .context("expected '+' or '-' after x offset")?;
        let x_offset = u16::from_str(&rest[..y_sign_pos]).context("x offset is not numeric")?;
        let y_sign = rest.as_bytes()[y_sign_pos] as char;
        let y_offset = u16::from_str(&rest[y_sign_pos + 1..]).context("y offset is not numeric")?;

        let corner = match (x_sign, y_sign) {
            ('+', '+') => Corner::TopLeft,
            ('-', '+') => Corner::TopRight,
            ('-', '-') => Corner::BottomRight,
            ('+', '-') => Corner::BottomLeft,
            _ => unreachable!("signs are checked above"),
        };

        Ok(AnchoredGeometry {
            width,
            height,
            x_offset,
            y_offset,
            corner,
        })
    }
}

/// Margins around a max-mode window, in pixels.
///
/// The root grows by the margins around the primary, so side content (e.g. a
/// camera strip) has reserved space that the primary never covers.
#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct Margin {
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
    pub left: u16,
}

impl Margin {
    /// Root size required for a primary of `width` x `height` with these
    /// margins.
    #[must_use]
    pub fn outer_size(&self, width: u16, height: u16) -> (u16, u16) {
        (
            width + self.left + self.right,
            height + self.top + self.bottom,
        )
    }
}
