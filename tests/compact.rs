use datauri_scan::{encode_payload, scan};
use image::codecs::gif::{GifEncoder, Repeat};
use image::{Delay, DynamicImage, Frame, ImageBuffer, ImageFormat, Rgb, Rgba};
use snapnorm::{compact_file, BudgetState, CompactControls, FilterSet, GifPolicy, PassParams};
use std::fs;
use std::io::Cursor;
use tempfile::tempdir;

const SVG: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"><rect width="10" height="10" fill="#0a0"/></svg>"##;
const TRUNCATED_TAIL: &str = r#"<img src="data:image/png;base64,iVBORw0KGgoAAAANSUhEUgAAAAEAAAAB"#;

fn noisy_png(width: u32, height: u32) -> Vec<u8> {
    let image = ImageBuffer::from_fn(width, height, |x, y| {
        let mut v = x.wrapping_mul(2_654_435_761) ^ y.wrapping_mul(40_503);
        v ^= v >> 13;
        v = v.wrapping_mul(0x5bd1_e995);
        let [r, g, b, _] = v.to_le_bytes();
        Rgb([r, g, b])
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("png");
    out
}

fn small_gif() -> Vec<u8> {
    let frames = [20u8, 220].map(|shade| {
        let buffer = ImageBuffer::from_pixel(16, 16, Rgba([shade, 0, 0, 255]));
        Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(80, 1))
    });
    let mut out = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut out);
        encoder.set_repeat(Repeat::Infinite).expect("repeat");
        encoder.encode_frames(frames).expect("gif");
    }
    out
}

fn img(mime: &str, bytes: &[u8]) -> String {
    format!(r#"<img src="data:{mime};base64,{}">"#, encode_payload(bytes))
}

fn snapshot(png: &[u8], gif: &[u8]) -> String {
    format!(
        "<html><head><script>track()</script></head><body>{}{}{}{}<p>tail</p>{TRUNCATED_TAIL}",
        img("image/png", png),
        img("image/png", png),
        img("image/svg+xml", SVG.as_bytes()),
        img("image/gif", gif),
    )
}

fn controls(extract_images: bool, filters: FilterSet) -> CompactControls {
    let params = PassParams {
        quality: 60,
        max_width: 120,
        gif_policy: GifPolicy::KeepGif,
    };
    CompactControls::new(params, None, None, filters, extract_images)
}

#[test]
fn inline_compaction_preserves_unconvertible_content() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("page.html");
    let original = snapshot(&noisy_png(640, 480), &small_gif());
    fs::write(&path, &original).expect("write");

    let summary = compact_file(&path, &controls(false, FilterSet::default())).expect("compact");
    let after = fs::read(&path).expect("read");

    assert!(after.len() < original.len());
    assert_eq!(summary.final_bytes, after.len());
    assert_eq!(summary.budget_state, Some(BudgetState::Converged));
    assert_eq!(summary.passes.len(), 1);

    let mimes: Vec<&str> = scan(&after).map(|resource| resource.mime()).collect();
    assert_eq!(mimes, vec!["image/webp", "image/webp", "image/svg+xml", "image/gif"]);

    let resources: Vec<_> = scan(&after).collect();
    assert_eq!(resources[0].encoded(), resources[1].encoded());

    let svg_uri = img("image/svg+xml", SVG.as_bytes());
    assert!(String::from_utf8_lossy(&after).contains(&svg_uri));
    assert!(after.ends_with(TRUNCATED_TAIL.as_bytes()));

    assert_eq!(summary.encodes, 3);
    assert_eq!(summary.cache_hits, 1);
}

#[test]
fn srcset_descriptors_survive_compaction() {
    // An unpadded payload, so nothing but the space separates it from the descriptor.
    let png = (64..128)
        .map(|width| noisy_png(width, 48))
        .find(|bytes| bytes.len() % 3 == 0)
        .expect("unpadded png");
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("page.html");
    let original = format!(
        r#"<img srcset="data:image/png;base64,{} 2x, small.png 1x"><p>after</p>"#,
        encode_payload(&png)
    );
    fs::write(&path, &original).expect("write");

    let summary = compact_file(&path, &controls(false, FilterSet::default())).expect("compact");
    let after = String::from_utf8(fs::read(&path).expect("read")).expect("utf8");

    assert_eq!(summary.passes[0].replacements, 1);
    assert!(after.starts_with(r#"<img srcset="data:image/webp;base64,"#));
    assert!(after.ends_with(r#" 2x, small.png 1x"><p>after</p>"#));
}

#[test]
fn filters_run_before_compaction() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("page.html");
    fs::write(&path, snapshot(&noisy_png(64, 64), &small_gif())).expect("write");

    let filters = FilterSet {
        scripts: true,
        ..FilterSet::default()
    };
    let summary = compact_file(&path, &controls(false, filters)).expect("compact");
    let after = String::from_utf8(fs::read(&path).expect("read")).expect("utf8");

    assert!(!after.contains("<script>"));
    assert_eq!(summary.filters.len(), 1);
    assert_eq!(
        summary.filters[0].report.bytes_removed,
        "<script>track()</script>".len()
    );
}

#[test]
fn extraction_writes_one_file_per_distinct_image() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("Saved Page.zip.html");
    fs::write(&path, snapshot(&noisy_png(300, 200), &small_gif())).expect("write");

    let summary = compact_file(&path, &controls(true, FilterSet::default())).expect("compact");
    let after = String::from_utf8(fs::read(&path).expect("read")).expect("utf8");

    assert_eq!(summary.assets_written, 3);
    let asset_dir = dir.path().join("Saved_Page_files");
    let mut files: Vec<String> = fs::read_dir(&asset_dir)
        .expect("asset dir")
        .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();
    assert_eq!(files.len(), 3);
    assert!(files[0].starts_with("0001-") && files[0].ends_with(".webp"));
    assert!(files[1].starts_with("0002-") && files[1].ends_with(".svg"));
    assert!(files[2].starts_with("0003-") && files[2].ends_with(".gif"));

    assert_eq!(fs::read(asset_dir.join(&files[1])).expect("svg"), SVG.as_bytes());
    assert_eq!(after.matches(&format!("Saved_Page_files/{}", files[0])).count(), 2);
    assert!(after.ends_with(TRUNCATED_TAIL));
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempdir().expect("tempdir");
    let err = compact_file(&dir.path().join("absent.html"), &CompactControls::default())
        .expect_err("missing file");
    assert!(err.to_string().contains("absent.html"));
}
