use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use image::{DynamicImage, RgbaImage};

use super::layout::ModelLayout;

/// Only R, G and B are ever written, even when the model declares more channels.
const RGB_CHANNELS: usize = 3;

// ISO-BMFF brands of HEIF stills and sequences. AVIF shares the container.
const HEIF_BRANDS: [&[u8; 4]; 9] = [
    b"heic", b"heix", b"heim", b"heis", b"hevc", b"hevx", b"heif", b"mif1", b"msf1",
];
const AVIF_BRANDS: [&[u8; 4]; 2] = [b"avif", b"avis"];

#[derive(Debug)]
pub enum PreprocessError {
    Base64(base64::DecodeError),
    Image(image::ImageError),
    #[cfg(feature = "heif")]
    Heif(libheif_rs::HeifError),
    InvalidChannelCount(usize),
    InvalidDimensions { width: usize, height: usize },
}

impl fmt::Display for PreprocessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PreprocessError::Base64(err) => write!(f, "error decoding base64: {err}"),
            PreprocessError::Image(err) => write!(f, "error decoding image format: {err}"),
            #[cfg(feature = "heif")]
            PreprocessError::Heif(err) => write!(f, "error decoding HEIF image: {err}"),
            PreprocessError::InvalidChannelCount(count) => {
                write!(f, "invalid channel count: {count}")
            }
            PreprocessError::InvalidDimensions { width, height } => {
                write!(f, "invalid target size {width}x{height}")
            }
        }
    }
}

impl std::error::Error for PreprocessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PreprocessError::Base64(err) => Some(err),
            PreprocessError::Image(err) => Some(err),
            #[cfg(feature = "heif")]
            PreprocessError::Heif(err) => Some(err),
            _ => None,
        }
    }
}

impl From<base64::DecodeError> for PreprocessError {
    fn from(value: base64::DecodeError) -> Self {
        PreprocessError::Base64(value)
    }
}

impl From<image::ImageError> for PreprocessError {
    fn from(value: image::ImageError) -> Self {
        PreprocessError::Image(value)
    }
}

#[cfg(feature = "heif")]
impl From<libheif_rs::HeifError> for PreprocessError {
    fn from(value: libheif_rs::HeifError) -> Self {
        PreprocessError::Heif(value)
    }
}

/// Drops everything up to and including the first comma, if there is one.
pub fn strip_data_uri(data: &str) -> &str {
    match data.find(',') {
        Some(idx) => &data[idx + 1..],
        None => data,
    }
}

/// True for an ISO-BMFF `ftyp` box naming a HEIF brand and no AVIF brand.
pub fn is_heif(bytes: &[u8]) -> bool {
    if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return false;
    }
    let box_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let end = box_len.clamp(12, bytes.len());

    // Major brand, then compatible brands after the minor version.
    let brands = std::iter::once(&bytes[8..12])
        .chain(bytes.get(16..end).unwrap_or(&[]).chunks_exact(4));
    let mut heif = false;
    for brand in brands {
        if AVIF_BRANDS.iter().any(|b| &b[..] == brand) {
            return false;
        }
        heif |= HEIF_BRANDS.iter().any(|b| &b[..] == brand);
    }
    heif
}

#[cfg(feature = "heif")]
fn decode_heif(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    use libheif_rs::{ColorSpace, HeifContext, LibHeif, RgbChroma};

    let lib_heif = LibHeif::new();
    let ctx = HeifContext::read_from_bytes(bytes)?;
    let handle = ctx.primary_image_handle()?;
    let decoded = lib_heif.decode(&handle, ColorSpace::Rgb(RgbChroma::Rgb), None)?;
    let planes = decoded.planes();
    let plane = planes.interleaved.ok_or_else(|| {
        image::ImageError::Decoding(image::error::DecodingError::new(
            image::error::ImageFormatHint::Name("HEIF".into()),
            "decoder returned no interleaved RGB plane",
        ))
    })?;

    let (width, height) = (plane.width, plane.height);
    let row_len = width as usize * RGB_CHANNELS;
    let mut rgb = Vec::with_capacity(row_len * height as usize);
    for row in plane.data.chunks(plane.stride).take(height as usize) {
        rgb.extend_from_slice(&row[..row_len]);
    }
    image::RgbImage::from_raw(width, height, rgb)
        .map(DynamicImage::ImageRgb8)
        .ok_or_else(|| PreprocessError::InvalidDimensions {
            width: width as usize,
            height: height as usize,
        })
}

#[cfg(not(feature = "heif"))]
fn decode_heif(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Decodes base64 (optionally data-URI prefixed) image data into pixels.
///
/// PNG, JPEG, GIF, WEBP and AVIF are sniffed by `image`; HEIF goes to libheif.
pub fn decode_image(data: &str) -> Result<DynamicImage, PreprocessError> {
    let raw = STANDARD.decode(strip_data_uri(data))?;
    if is_heif(&raw) {
        return decode_heif(&raw);
    }
    Ok(image::load_from_memory(&raw)?)
}

/// Checks the layout can be packed, returning the target size.
fn target_size(layout: &ModelLayout) -> Result<(u32, u32), PreprocessError> {
    if layout.channels == 0 {
        return Err(PreprocessError::InvalidChannelCount(layout.channels));
    }
    let invalid = || PreprocessError::InvalidDimensions {
        width: layout.width,
        height: layout.height,
    };
    let width = u32::try_from(layout.width).map_err(|_| invalid())?;
    let height = u32::try_from(layout.height).map_err(|_| invalid())?;
    if width == 0 || height == 0 {
        return Err(invalid());
    }
    Ok((width, height))
}

/// Resizes `img` to the layout's size with bilinear filtering and packs it
/// into a fresh `height * width * channels` buffer of values in `[0, 1]`.
///
/// Colours are premultiplied by alpha first, which composites the image over
/// black: fully transparent areas pack as zeros and do not bleed into edges.
pub fn pack(img: &DynamicImage, layout: &ModelLayout) -> Result<Vec<f32>, PreprocessError> {
    let (width, height) = target_size(layout)?;
    Ok(pack_resized(img, layout, width, height))
}

fn pack_resized(img: &DynamicImage, layout: &ModelLayout, width: u32, height: u32) -> Vec<f32> {
    let mut rgba: RgbaImage = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let alpha = pixel[3] as u16;
        for c in 0..RGB_CHANNELS {
            pixel[c] = ((pixel[c] as u16 * alpha + 127) / 255) as u8;
        }
    }
    let resized = image::imageops::resize(
        &rgba,
        width,
        height,
        image::imageops::FilterType::Triangle,
    );

    let written = layout.channels.min(RGB_CHANNELS);
    let area = layout.height * layout.width;
    let mut tensor = vec![0f32; layout.element_count()];

    for (x, y, pixel) in resized.enumerate_pixels() {
        let spatial = y as usize * layout.width + x as usize;
        for c in 0..written {
            let value = pixel[c] as f32 / 255.0;
            let offset = if layout.channels_last {
                spatial * layout.channels + c
            } else {
                c * area + spatial
            };
            tensor[offset] = value;
        }
    }

    tensor
}

/// Full preprocessing path: base64 text in, model input buffer out. The
/// layout is validated before any decoding happens.
pub fn prepare(data: &str, layout: &ModelLayout) -> Result<Vec<f32>, PreprocessError> {
    let (width, height) = target_size(layout)?;
    let img = decode_image(data)?;
    Ok(pack_resized(&img, layout, width, height))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage, Rgba};
    use std::io::Cursor;

    pub(crate) fn png_base64(img: DynamicImage) -> String {
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, ImageFormat::Png).expect("encode png");
        STANDARD.encode(bytes.into_inner())
    }

    pub(crate) fn white_png_base64(width: u32, height: u32) -> String {
        png_base64(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            width,
            height,
            Rgb([255, 255, 255]),
        )))
    }

    fn layout(height: usize, width: usize, channels: usize, channels_last: bool) -> ModelLayout {
        ModelLayout {
            height,
            width,
            channels,
            channels_last,
        }
    }

    #[test]
    fn strips_data_uri_prefix_at_first_comma() {
        assert_eq!(strip_data_uri("data:image/png;base64,AAAA"), "AAAA");
        assert_eq!(strip_data_uri("AAAA"), "AAAA");
        assert_eq!(strip_data_uri("a,b,c"), "b,c");
    }

    #[test]
    fn white_image_packs_to_ones_channels_last() {
        let data = white_png_base64(31, 17);
        let tensor = prepare(&data, &layout(8, 6, 3, true)).expect("prepare");
        assert_eq!(tensor.len(), 8 * 6 * 3);
        assert!(tensor.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn data_uri_input_is_accepted() {
        let data = format!("data:image/png;base64,{}", white_png_base64(4, 4));
        let tensor = prepare(&data, &ModelLayout::FALLBACK).expect("prepare");
        assert_eq!(tensor.len(), 224 * 224 * 3);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn channels_first_stores_contiguous_planes() {
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 5, Rgb([255, 0, 51])));
        let tensor = prepare(&png_base64(red), &layout(4, 4, 3, false)).expect("prepare");
        let area = 16;
        assert!(tensor[..area].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        assert!(tensor[area..2 * area].iter().all(|v| v.abs() < 1e-6));
        assert!(tensor[2 * area..].iter().all(|v| (*v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn channels_last_interleaves_pixels() {
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([255, 0, 51])));
        let tensor = pack(&red, &layout(2, 2, 3, true)).expect("pack");
        for pixel in tensor.chunks(3) {
            assert!((pixel[0] - 1.0).abs() < 1e-6);
            assert!(pixel[1].abs() < 1e-6);
            assert!((pixel[2] - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn extra_declared_channels_stay_zero() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([255, 255, 255, 128])));
        let tensor = pack(&img, &layout(2, 2, 4, true)).expect("pack");
        assert_eq!(tensor.len(), 16);
        for pixel in tensor.chunks(4) {
            // Half-transparent white over black.
            assert!(pixel[..3].iter().all(|v| (*v - 128.0 / 255.0).abs() < 0.01));
            assert_eq!(pixel[3], 0.0);
        }
    }

    #[test]
    fn transparent_pixels_pack_as_black() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(6, 6, Rgba([255, 0, 255, 0])));
        let tensor = pack(&img, &layout(3, 3, 3, false)).expect("pack");
        assert!(tensor.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn transparent_border_does_not_bleed_into_opaque_pixels() {
        let mut img = RgbaImage::from_pixel(8, 8, Rgba([255, 255, 255, 0]));
        for x in 2..6 {
            for y in 2..6 {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let tensor = pack(&DynamicImage::ImageRgba8(img), &layout(4, 4, 3, true)).expect("pack");
        assert!(tensor.iter().all(|v| v.abs() < 1e-6));
    }

    #[test]
    fn single_channel_layout_takes_red_only() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([51, 255, 255])));
        let tensor = pack(&img, &layout(2, 2, 1, false)).expect("pack");
        assert_eq!(tensor.len(), 4);
        assert!(tensor.iter().all(|v| (*v - 0.2).abs() < 1e-6));
    }

    #[test]
    fn bad_base64_is_a_decode_error() {
        let err = prepare("%%%not-base64%%%", &ModelLayout::FALLBACK).unwrap_err();
        assert!(matches!(err, PreprocessError::Base64(_)));
    }

    #[test]
    fn corrupt_image_bytes_are_an_image_error() {
        let data = STANDARD.encode(b"definitely not an image");
        let err = prepare(&data, &ModelLayout::FALLBACK).unwrap_err();
        assert!(matches!(err, PreprocessError::Image(_)));
    }

    fn encoded_base64(img: DynamicImage, format: ImageFormat) -> String {
        let mut bytes = Cursor::new(Vec::new());
        img.write_to(&mut bytes, format).expect("encode fixture");
        STANDARD.encode(bytes.into_inner())
    }

    fn assert_grey(tensor: &[f32], tolerance: f32) {
        assert_eq!(tensor.len(), 4 * 4 * 3);
        for v in tensor {
            assert!((v - 0.6).abs() < tolerance, "{v} is not mid grey");
        }
    }

    fn grey_rgb() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(16, 16, Rgb([153, 153, 153])))
    }

    #[test]
    fn decodes_png() {
        let data = encoded_base64(grey_rgb(), ImageFormat::Png);
        assert_grey(&prepare(&data, &layout(4, 4, 3, true)).expect("png"), 1e-6);
    }

    #[test]
    fn decodes_jpeg() {
        let data = encoded_base64(grey_rgb(), ImageFormat::Jpeg);
        assert_grey(&prepare(&data, &layout(4, 4, 3, true)).expect("jpeg"), 0.05);
    }

    #[test]
    fn decodes_gif() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(16, 16, Rgba([153, 153, 153, 255])));
        let data = encoded_base64(img, ImageFormat::Gif);
        assert_grey(&prepare(&data, &layout(4, 4, 3, true)).expect("gif"), 0.02);
    }

    #[test]
    fn decodes_webp() {
        let data = encoded_base64(grey_rgb(), ImageFormat::WebP);
        assert_grey(&prepare(&data, &layout(4, 4, 3, true)).expect("webp"), 0.02);
    }

    #[cfg(feature = "avif")]
    #[test]
    fn decodes_avif() {
        let data = encoded_base64(grey_rgb(), ImageFormat::Avif);
        assert_grey(&prepare(&data, &layout(4, 4, 3, true)).expect("avif"), 0.1);
    }

    fn ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
        let len = 16 + 4 * compatible.len() as u32;
        let mut bytes = len.to_be_bytes().to_vec();
        bytes.extend_from_slice(b"ftyp");
        bytes.extend_from_slice(major);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        for brand in compatible {
            bytes.extend_from_slice(*brand);
        }
        bytes
    }

    #[test]
    fn heif_brands_are_recognised() {
        assert!(is_heif(&ftyp(b"heic", &[b"mif1", b"heic"])));
        assert!(is_heif(&ftyp(b"mif1", &[b"heif"])));
        assert!(is_heif(&ftyp(b"msf1", &[b"hevc"])));
    }

    #[test]
    fn avif_and_other_containers_are_not_heif() {
        assert!(!is_heif(&ftyp(b"avif", &[b"mif1", b"miaf"])));
        assert!(!is_heif(&ftyp(b"mif1", &[b"avif"])));
        assert!(!is_heif(&ftyp(b"isom", &[b"mp42"])));
        assert!(!is_heif(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"));
        assert!(!is_heif(b"ftyp"));
    }

    #[cfg(feature = "heif")]
    #[test]
    fn truncated_heif_goes_to_the_heif_decoder() {
        let mut bytes = ftyp(b"heic", &[b"mif1", b"heic"]);
        bytes.extend_from_slice(&[0, 0, 0, 8, b'm', b'e', b't', b'a']);
        let err = prepare(&STANDARD.encode(bytes), &ModelLayout::FALLBACK).unwrap_err();
        assert!(matches!(err, PreprocessError::Heif(_)), "got {err}");
        assert!(err.to_string().starts_with("error decoding HEIF image"));
    }

    #[test]
    fn zero_channels_fail_before_decoding() {
        let err = prepare("%%%not-base64%%%", &layout(4, 4, 0, true)).unwrap_err();
        assert!(matches!(err, PreprocessError::InvalidChannelCount(0)));
    }

    #[test]
    fn zero_sized_target_is_rejected() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let err = pack(&img, &layout(0, 4, 3, true)).unwrap_err();
        assert!(matches!(err, PreprocessError::InvalidDimensions { .. }));
    }
}
