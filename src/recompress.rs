//! Re-encodes embedded images into smaller forms.
//!
//! Rasters are downscaled and re-encoded as lossy WebP. SVG is never touched.
//! GIFs stay GIFs unless animated WebP output is requested, so animations
//! survive by default.

use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::imageops::{self, FilterType};
use image::{AnimationDecoder, DynamicImage, Frame, ImageFormat, RgbaImage};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::io::Cursor;
use tracing::{debug, warn};

const GIF_ENCODE_SPEED: i32 = 10;

/// How GIF resources are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GifPolicy {
    /// Downscale but keep the GIF container.
    #[default]
    KeepGif,
    /// Convert to animated WebP.
    AnimatedWebp,
}

/// Encoder settings for one compaction pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct PassParams {
    /// WebP quality, 0 to 100.
    pub quality: u8,
    /// Upper bound for both image dimensions.
    pub max_width: u32,
    /// GIF handling.
    pub gif_policy: GifPolicy,
}

impl Default for PassParams {
    fn default() -> Self {
        Self {
            quality: 70,
            max_width: 1600,
            gif_policy: GifPolicy::KeepGif,
        }
    }
}

/// A re-encoded resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recompressed {
    /// MIME type of `bytes`.
    pub mime: String,
    /// Encoded image.
    pub bytes: Vec<u8>,
}

/// SHA-256 of a resource's decoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hashes `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    /// Lowercase hex of the first `chars` hex digits.
    pub fn short_hex(&self, chars: usize) -> String {
        let mut hex = self.to_string();
        hex.truncate(chars);
        hex
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Converts a decoded resource, or declines to.
pub trait Recompressor {
    /// Returns the smaller replacement, `Ok(None)` when the resource should
    /// stay as it is, or an error when it could not be decoded or encoded.
    fn recompress(
        &self,
        mime: &str,
        bytes: &[u8],
        params: &PassParams,
    ) -> Result<Option<Recompressed>, RecompressError>;
}

/// Recompressor backed by the `image` decoders and libwebp.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageRecompressor;

impl Recompressor for ImageRecompressor {
    fn recompress(
        &self,
        mime: &str,
        bytes: &[u8],
        params: &PassParams,
    ) -> Result<Option<Recompressed>, RecompressError> {
        if is_svg(mime, bytes) {
            return Ok(None);
        }
        let converted = if is_gif(mime, bytes) {
            match params.gif_policy {
                GifPolicy::KeepGif => reencode_gif(bytes, params.max_width)?,
                GifPolicy::AnimatedWebp => gif_to_animated_webp(bytes, params)?,
            }
        } else {
            raster_to_webp(bytes, params)?
        };
        if converted.bytes.len() >= bytes.len() {
            debug!(mime, original = bytes.len(), encoded = converted.bytes.len(), "re-encode not smaller, keeping original");
            return Ok(None);
        }
        Ok(Some(converted))
    }
}

fn is_svg(mime: &str, bytes: &[u8]) -> bool {
    if mime.to_ascii_lowercase().contains("svg") {
        return true;
    }
    let head = &bytes[..bytes.len().min(256)];
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    text.starts_with("<svg") || (text.starts_with("<?xml") && text.contains("<svg"))
}

fn is_gif(mime: &str, bytes: &[u8]) -> bool {
    match image::guess_format(bytes) {
        Ok(format) => format == ImageFormat::Gif,
        Err(_) => mime.eq_ignore_ascii_case("image/gif"),
    }
}

/// Dimensions after fitting `(width, height)` inside a `max_side` square, or
/// `None` when the image already fits.
pub fn fit_within(width: u32, height: u32, max_side: u32) -> Option<(u32, u32)> {
    let longest = width.max(height);
    if max_side == 0 || longest <= max_side {
        return None;
    }
    let scale = f64::from(max_side) / f64::from(longest);
    let scaled = |side: u32| ((f64::from(side) * scale).round() as u32).clamp(1, max_side);
    Some((scaled(width), scaled(height)))
}

fn raster_to_webp(bytes: &[u8], params: &PassParams) -> Result<Recompressed, RecompressError> {
    let mut image = image::load_from_memory(bytes).map_err(RecompressError::Decode)?;
    if let Some((width, height)) = fit_within(image.width(), image.height(), params.max_width) {
        image = image.resize_exact(width, height, FilterType::Lanczos3);
    }
    let encoded = encode_webp(&image, params.quality)?;
    Ok(Recompressed {
        mime: "image/webp".to_string(),
        bytes: encoded,
    })
}

fn encode_webp(image: &DynamicImage, quality: u8) -> Result<Vec<u8>, RecompressError> {
    let (width, height) = (image.width(), image.height());
    let pixels = if image.color().has_alpha() {
        image.to_rgba8().into_raw()
    } else {
        image.to_rgb8().into_raw()
    };
    let encoder = if image.color().has_alpha() {
        webp::Encoder::from_rgba(&pixels, width, height)
    } else {
        webp::Encoder::from_rgb(&pixels, width, height)
    };
    let memory = encoder
        .encode_simple(false, f32::from(quality))
        .map_err(|err| RecompressError::Encode(format!("webp: {err:?}")))?;
    Ok(memory.to_vec())
}

fn decode_gif_frames(bytes: &[u8]) -> Result<Vec<Frame>, RecompressError> {
    let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(RecompressError::Decode)?;
    decoder
        .into_frames()
        .collect_frames()
        .map_err(RecompressError::Decode)
}

fn scale_frame(buffer: &RgbaImage, max_width: u32) -> RgbaImage {
    match fit_within(buffer.width(), buffer.height(), max_width) {
        Some((width, height)) => imageops::resize(buffer, width, height, FilterType::Lanczos3),
        None => buffer.clone(),
    }
}

fn reencode_gif(bytes: &[u8], max_width: u32) -> Result<Recompressed, RecompressError> {
    let frames = decode_gif_frames(bytes)?;
    let scaled: Vec<Frame> = frames
        .iter()
        .map(|frame| Frame::from_parts(scale_frame(frame.buffer(), max_width), 0, 0, frame.delay()))
        .collect();

    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new_with_speed(&mut out, GIF_ENCODE_SPEED);
        encoder
            .set_repeat(Repeat::Infinite)
            .map_err(|err| RecompressError::Encode(format!("gif: {err}")))?;
        encoder
            .encode_frames(scaled)
            .map_err(|err| RecompressError::Encode(format!("gif: {err}")))?;
    }
    Ok(Recompressed {
        mime: "image/gif".to_string(),
        bytes: out,
    })
}

fn gif_to_animated_webp(bytes: &[u8], params: &PassParams) -> Result<Recompressed, RecompressError> {
    let frames = decode_gif_frames(bytes)?;
    let buffers: Vec<(RgbaImage, i32)> = {
        let mut elapsed_ms = 0i32;
        frames
            .iter()
            .map(|frame| {
                let timestamp = elapsed_ms;
                let (numer, denom) = frame.delay().numer_denom_ms();
                let delay = numer.checked_div(denom).unwrap_or(0);
                elapsed_ms = elapsed_ms.saturating_add(i32::try_from(delay).unwrap_or(i32::MAX));
                (scale_frame(frame.buffer(), params.max_width), timestamp)
            })
            .collect()
    };
    let Some((first, _)) = buffers.first() else {
        return Err(RecompressError::Encode("gif has no frames".to_string()));
    };
    let (width, height) = first.dimensions();

    let mut config = webp::WebPConfig::new()
        .map_err(|()| RecompressError::Encode("webp: invalid config".to_string()))?;
    config.quality = f32::from(params.quality);
    let mut encoder = webp::AnimEncoder::new(width, height, &config);
    encoder.set_loop_count(0);
    for (buffer, timestamp) in &buffers {
        encoder.add_frame(webp::AnimFrame::from_rgba(buffer.as_raw(), width, height, *timestamp));
    }
    let memory = encoder
        .try_encode()
        .map_err(|err| RecompressError::Encode(format!("animated webp: {err:?}")))?;
    Ok(Recompressed {
        mime: "image/webp".to_string(),
        bytes: memory.to_vec(),
    })
}

/// Cached decision for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conversion {
    /// Use the smaller encoding.
    Replaced(Recompressed),
    /// Keep the original bytes.
    PassThrough,
    /// The resource could not be decoded or encoded; keep it inline.
    Failed,
}

/// Per-document memo of conversions keyed by content hash and parameters.
#[derive(Debug, Default)]
pub struct RecompressionCache {
    entries: HashMap<(ContentHash, PassParams), Conversion>,
    encodes: usize,
    hits: usize,
}

impl RecompressionCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the conversion for `(hash, params)`, running `produce` only
    /// the first time the key is seen.
    pub fn resolve(
        &mut self,
        hash: ContentHash,
        params: &PassParams,
        produce: impl FnOnce() -> Result<Option<Recompressed>, RecompressError>,
    ) -> &Conversion {
        let key = (hash, *params);
        if self.entries.contains_key(&key) {
            self.hits += 1;
        } else {
            self.encodes += 1;
            let conversion = match produce() {
                Ok(Some(recompressed)) => Conversion::Replaced(recompressed),
                Ok(None) => Conversion::PassThrough,
                Err(err) => {
                    warn!(hash = %hash.short_hex(16), error = %err, "keeping resource as-is");
                    Conversion::Failed
                }
            };
            self.entries.insert(key, conversion);
        }
        &self.entries[&key]
    }

    /// Number of times a conversion was actually computed.
    pub fn encodes(&self) -> usize {
        self.encodes
    }

    /// Number of lookups served from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }
}

/// File extension for a MIME type, defaulting to `bin`.
pub fn extension_for_mime(mime: &str) -> &'static str {
    let subtype = mime
        .split_once('/')
        .map(|(_, sub)| sub)
        .unwrap_or(mime)
        .trim()
        .to_ascii_lowercase();
    match subtype.as_str() {
        "webp" => "webp",
        "gif" => "gif",
        "png" => "png",
        "jpeg" | "jpg" | "pjpeg" => "jpg",
        "svg+xml" | "svg" => "svg",
        "avif" => "avif",
        "bmp" => "bmp",
        "x-icon" | "vnd.microsoft.icon" => "ico",
        "tiff" => "tiff",
        _ => "bin",
    }
}

/// Errors from the recompression engine.
#[derive(Debug)]
pub enum RecompressError {
    /// The resource is not a decodable image.
    Decode(image::ImageError),
    /// The encoder rejected the image.
    Encode(String),
}

impl fmt::Display for RecompressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "image decode failed: {err}"),
            Self::Encode(err) => write!(f, "image encode failed: {err}"),
        }
    }
}

impl Error for RecompressError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            Self::Encode(_) => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Delay, ImageBuffer, Rgb, Rgba};
    use pretty_assertions::assert_eq;

    pub(crate) fn noisy_png(width: u32, height: u32) -> Vec<u8> {
        let image = ImageBuffer::from_fn(width, height, |x, y| {
            let mut v = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
            v ^= v >> 13;
            v = v.wrapping_mul(0x5bd1_e995);
            v ^= v >> 15;
            let [r, g, b, _] = v.to_le_bytes();
            Rgb([r, g, b])
        });
        let mut out = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .expect("png");
        out
    }

    pub(crate) fn two_frame_gif(side: u32) -> Vec<u8> {
        let frame = |shade: u8| {
            let buffer = ImageBuffer::from_fn(side, side, |x, _| Rgba([shade, (x % 255) as u8, 0, 255]));
            Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(100, 1))
        };
        let mut out = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut out);
            encoder.set_repeat(Repeat::Infinite).expect("repeat");
            encoder.encode_frames(vec![frame(10), frame(200)]).expect("gif");
        }
        out
    }

    #[test]
    fn fit_within_never_upscales() {
        assert_eq!(fit_within(100, 50, 1600), None);
        assert_eq!(fit_within(3200, 1600, 1600), Some((1600, 800)));
        assert_eq!(fit_within(1000, 4000, 400), Some((100, 400)));
        assert_eq!(fit_within(5000, 1, 400), Some((400, 1)));
    }

    #[test]
    fn svg_passes_through() {
        let svg = br#"<?xml version="1.0"?><svg xmlns="http://www.w3.org/2000/svg"/>"#;
        let out = ImageRecompressor
            .recompress("image/svg+xml", svg, &PassParams::default())
            .expect("svg");
        assert_eq!(out, None);
        assert!(is_svg("image/png", b"  <svg></svg>"));
    }

    #[test]
    fn large_png_becomes_smaller_webp() {
        let png = noisy_png(600, 400);
        let params = PassParams {
            quality: 50,
            max_width: 300,
            gif_policy: GifPolicy::KeepGif,
        };
        let out = ImageRecompressor
            .recompress("image/png", &png, &params)
            .expect("recompress")
            .expect("smaller");
        assert_eq!(out.mime, "image/webp");
        assert!(out.bytes.len() < png.len());
        let decoded = image::load_from_memory(&out.bytes).expect("decode webp");
        assert_eq!((decoded.width(), decoded.height()), (300, 200));
    }

    #[test]
    fn gif_stays_gif_by_default() {
        let gif = two_frame_gif(120);
        let params = PassParams {
            quality: 70,
            max_width: 40,
            gif_policy: GifPolicy::KeepGif,
        };
        let out = ImageRecompressor
            .recompress("image/gif", &gif, &params)
            .expect("gif")
            .expect("smaller");
        assert_eq!(out.mime, "image/gif");
        assert_eq!(image::guess_format(&out.bytes).expect("format"), ImageFormat::Gif);
        let frames = decode_gif_frames(&out.bytes).expect("frames");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].buffer().dimensions(), (40, 40));
    }

    #[test]
    fn gif_converts_to_animated_webp_on_request() {
        let gif = two_frame_gif(120);
        let params = PassParams {
            quality: 60,
            max_width: 40,
            gif_policy: GifPolicy::AnimatedWebp,
        };
        let out = ImageRecompressor
            .recompress("image/gif", &gif, &params)
            .expect("animated webp")
            .expect("smaller");
        assert_eq!(out.mime, "image/webp");
        assert_eq!(&out.bytes[..4], b"RIFF");
        assert_eq!(&out.bytes[8..12], b"WEBP");
        assert!(out.bytes.windows(4).any(|chunk| chunk == b"VP8X"));
        assert!(out.bytes.windows(4).any(|chunk| chunk == b"ANIM"));
        assert!(out.bytes.len() < gif.len());
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = ImageRecompressor
            .recompress("image/png", b"not an image at all", &PassParams::default())
            .expect_err("garbage");
        assert!(matches!(err, RecompressError::Decode(_)));
    }

    #[test]
    fn cache_counts_encodes_and_hits() {
        let mut cache = RecompressionCache::new();
        let hash = ContentHash::of(b"same");
        let params = PassParams::default();
        let mut calls = 0;
        for _ in 0..3 {
            let conversion = cache.resolve(hash, &params, || {
                calls += 1;
                Ok(None)
            });
            assert_eq!(conversion, &Conversion::PassThrough);
        }
        assert_eq!(calls, 1);
        assert_eq!((cache.encodes(), cache.hits()), (1, 2));

        let tighter = PassParams { quality: 60, ..params };
        cache.resolve(hash, &tighter, || Ok(None));
        assert_eq!(cache.encodes(), 2);
    }

    #[test]
    fn hashes_render_as_hex() {
        let hash = ContentHash::of(b"abc");
        assert_eq!(
            hash.to_string(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(hash.short_hex(16), "ba7816bf8f01cfea");
    }

    #[test]
    fn extensions_follow_mime() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("image/SVG+xml"), "svg");
        assert_eq!(extension_for_mime("image/x-unknown"), "bin");
    }
}
