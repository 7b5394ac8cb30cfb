use std::fmt;

use crate::error::{HcgError, Result};

/// Pixel layout of a decoded image. Always 8 bits per channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    Gray,
    GrayAlpha,
    Rgb,
    Rgba,
}

impl ColorMode {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            ColorMode::Gray => 1,
            ColorMode::GrayAlpha => 2,
            ColorMode::Rgb => 3,
            ColorMode::Rgba => 4,
        }
    }

    /// Channels summed per block when sampling.
    ///
    /// Only single, three and four channel layouts are sampled; anything
    /// else fails with [`HcgError::UnsupportedMode`].
    pub fn sample_channels(self) -> Result<usize> {
        match self {
            ColorMode::Gray => Ok(1),
            ColorMode::Rgb => Ok(3),
            ColorMode::Rgba => Ok(4),
            ColorMode::GrayAlpha => Err(HcgError::UnsupportedMode(self)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColorMode::Gray => "L",
            ColorMode::GrayAlpha => "LA",
            ColorMode::Rgb => "RGB",
            ColorMode::Rgba => "RGBA",
        }
    }
}

impl fmt::Display for ColorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `(width, height, mode)` triple. Only images of the same group are
/// ever compared or diffed against each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Group {
    pub width: u32,
    pub height: u32,
    pub mode: ColorMode,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.mode)
    }
}

/// A raw, row-major pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pixels {
    pub mode: ColorMode,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl Pixels {
    /// Wrap `data`, checking it holds exactly `width * height` pixels.
    pub fn new(mode: ColorMode, width: u32, height: u32, data: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * mode.bytes_per_pixel();
        if data.len() != expected {
            return Err(HcgError::ShapeMismatch(format!(
                "{}x{} {} needs {} bytes, buffer has {}",
                width,
                height,
                mode,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            mode,
            width,
            height,
            data,
        })
    }

    pub fn group(&self) -> Group {
        Group {
            width: self.width,
            height: self.height,
            mode: self.mode,
        }
    }
}
