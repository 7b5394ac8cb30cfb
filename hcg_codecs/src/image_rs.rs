use std::io::Cursor;
use std::path::Path;

use hcg_core::{CodecError, ColorMode, PixelCodec, Pixels};
use image::codecs::png::PngEncoder;
use image::{DynamicImage, ExtendedColorType, ImageEncoder};
use tracing::debug;

/// Pixel codec backed by the `image` crate.
///
/// Decodes anything the enabled `image` features understand (PNG, JPEG,
/// GIF, BMP, TIFF, WebP). 8-bit gray, gray+alpha, RGB and RGBA images keep
/// their mode; every other color type is widened or narrowed to 8-bit RGB,
/// or RGBA when it carries alpha.
///
/// `save` picks the output format from the file extension.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageRsCodec;

fn color_type(mode: ColorMode) -> ExtendedColorType {
    match mode {
        ColorMode::Gray => ExtendedColorType::L8,
        ColorMode::GrayAlpha => ExtendedColorType::La8,
        ColorMode::Rgb => ExtendedColorType::Rgb8,
        ColorMode::Rgba => ExtendedColorType::Rgba8,
    }
}

fn into_pixels(decoded: DynamicImage) -> Result<Pixels, CodecError> {
    let (width, height) = (decoded.width(), decoded.height());
    let (mode, data) = match decoded {
        DynamicImage::ImageLuma8(buf) => (ColorMode::Gray, buf.into_raw()),
        DynamicImage::ImageLumaA8(buf) => (ColorMode::GrayAlpha, buf.into_raw()),
        DynamicImage::ImageRgb8(buf) => (ColorMode::Rgb, buf.into_raw()),
        DynamicImage::ImageRgba8(buf) => (ColorMode::Rgba, buf.into_raw()),
        other if other.color().has_alpha() => (ColorMode::Rgba, other.to_rgba8().into_raw()),
        other => (ColorMode::Rgb, other.to_rgb8().into_raw()),
    };
    Pixels::new(mode, width, height, data).map_err(|e| CodecError::Decode(e.to_string()))
}

impl PixelCodec for ImageRsCodec {
    fn name(&self) -> &'static str {
        "image-rs"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Pixels, CodecError> {
        let decoded =
            image::load_from_memory(bytes).map_err(|e| CodecError::Decode(e.to_string()))?;
        into_pixels(decoded)
    }

    fn encode_png(&self, pixels: &Pixels) -> Result<Vec<u8>, CodecError> {
        let mut out = Cursor::new(Vec::new());
        PngEncoder::new(&mut out)
            .write_image(&pixels.data, pixels.width, pixels.height, color_type(pixels.mode))
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(out.into_inner())
    }

    fn save(&self, pixels: &Pixels, path: &Path) -> Result<(), CodecError> {
        debug!(path = %path.display(), mode = %pixels.mode, "saving decoded image");
        image::save_buffer(path, &pixels.data, pixels.width, pixels.height, color_type(pixels.mode))
            .map_err(|e| CodecError::Encode(format!("{}: {}", path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Rgb, RgbImage, Rgba, RgbaImage};

    fn png_of(img: DynamicImage) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn decode_keeps_8bit_modes() {
        let gray = GrayImage::from_fn(3, 2, |x, y| image::Luma([(x + 10 * y) as u8]));
        let pixels = ImageRsCodec.decode(&png_of(DynamicImage::ImageLuma8(gray))).unwrap();
        assert_eq!(pixels.mode, ColorMode::Gray);
        assert_eq!((pixels.width, pixels.height), (3, 2));
        assert_eq!(pixels.data, vec![0, 1, 2, 10, 11, 12]);

        let rgba = RgbaImage::from_pixel(2, 2, Rgba([1, 2, 3, 4]));
        let pixels = ImageRsCodec.decode(&png_of(DynamicImage::ImageRgba8(rgba))).unwrap();
        assert_eq!(pixels.mode, ColorMode::Rgba);
        assert_eq!(&pixels.data[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn sixteen_bit_input_is_narrowed_to_rgb() {
        let wide = image::ImageBuffer::<Rgb<u16>, Vec<u16>>::from_pixel(2, 1, Rgb([65535, 0, 257]));
        let pixels = ImageRsCodec.decode(&png_of(DynamicImage::ImageRgb16(wide))).unwrap();
        assert_eq!(pixels.mode, ColorMode::Rgb);
        assert_eq!(pixels.data, vec![255, 0, 1, 255, 0, 1]);
    }

    #[test]
    fn encode_png_is_lossless() {
        let rgb = RgbImage::from_fn(5, 4, |x, y| Rgb([x as u8 * 40, y as u8 * 60, 7]));
        let original = ImageRsCodec.decode(&png_of(DynamicImage::ImageRgb8(rgb))).unwrap();
        let encoded = ImageRsCodec.encode_png(&original).unwrap();
        assert_eq!(ImageRsCodec.decode(&encoded).unwrap(), original);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            ImageRsCodec.decode(b"definitely not an image"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn save_follows_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        let pixels = Pixels::new(ColorMode::Rgb, 2, 2, (0..12).collect()).unwrap();

        let bmp = dir.path().join("out.bmp");
        ImageRsCodec.save(&pixels, &bmp).unwrap();
        let bytes = std::fs::read(&bmp).unwrap();
        assert_eq!(&bytes[..2], b"BM");
        assert_eq!(ImageRsCodec.decode(&bytes).unwrap(), pixels);
    }
}
