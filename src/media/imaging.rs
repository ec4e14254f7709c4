use crate::error::Error;
use crate::recognition::BBox;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use std::path::Path;
use uuid::Uuid;

pub const THUMB_PADDING: i32 = 20;
pub const THUMB_SIZE: u32 = 200;
pub const THUMB_QUALITY: u8 = 95;
pub const FULL_FRAME_MAX_SIDE: u32 = 400;
pub const FULL_FRAME_QUALITY: u8 = 90;
pub const SNAPSHOT_QUALITY: u8 = 80;

/// Subdirectory of the data dir holding face thumbnails
pub const IMAGES_DIR: &str = "images";
/// Subdirectory of the data dir holding downscaled full frames
pub const FRAMES_DIR: &str = "frames";

const MATCH_COLOR: Rgb<u8> = Rgb([0, 200, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 140, 0]);

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}

/// Decode uploaded bytes, rejecting anything that is not an image
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, Error> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| Error::Validation(format!("Unreadable image: {}", e)))
}

pub fn load_image(path: &Path) -> Result<RgbImage, Error> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|e| Error::Io(format!("Failed to read image {}: {}", path.display(), e)))
}

/// Write `image` as `<subdir>/<prefix>_<uuid8>.jpg` under `data_dir` and
/// return the path relative to `data_dir`.
pub fn save_jpeg(
    data_dir: &Path,
    subdir: &str,
    prefix: &str,
    image: &RgbImage,
    quality: u8,
) -> Result<String, Error> {
    let dir = data_dir.join(subdir);
    std::fs::create_dir_all(&dir)?;

    let name = format!("{}_{}.jpg", prefix, short_id());
    std::fs::write(dir.join(&name), encode_jpeg(image, quality)?)?;
    Ok(format!("{}/{}", subdir, name))
}

/// Padded face crop scaled to the thumbnail size
pub fn thumbnail(frame: &RgbImage, bbox: &BBox) -> Result<RgbImage, Error> {
    let region = bbox.padded(THUMB_PADDING, frame.width(), frame.height());
    if region.is_empty() {
        return Err(Error::Validation("Face box lies outside the frame".to_string()));
    }
    let crop = imageops::crop_imm(
        frame,
        region.x1 as u32,
        region.y1 as u32,
        region.width() as u32,
        region.height() as u32,
    )
    .to_image();
    Ok(imageops::resize(&crop, THUMB_SIZE, THUMB_SIZE, FilterType::Triangle))
}

pub fn save_thumbnail(
    data_dir: &Path,
    frame: &RgbImage,
    bbox: &BBox,
    prefix: &str,
) -> Result<String, Error> {
    save_thumbnail_in(data_dir, IMAGES_DIR, frame, bbox, prefix)
}

/// Same as [`save_thumbnail`], into `subdir` of the data dir
pub fn save_thumbnail_in(
    data_dir: &Path,
    subdir: &str,
    frame: &RgbImage,
    bbox: &BBox,
    prefix: &str,
) -> Result<String, Error> {
    save_jpeg(data_dir, subdir, prefix, &thumbnail(frame, bbox)?, THUMB_QUALITY)
}

/// Frame shrunk so its longest side is at most `max_side`
pub fn downscale(frame: &RgbImage, max_side: u32) -> RgbImage {
    let longest = frame.width().max(frame.height());
    if longest <= max_side || longest == 0 {
        return frame.clone();
    }
    let scale = max_side as f64 / longest as f64;
    let width = ((frame.width() as f64 * scale).round() as u32).max(1);
    let height = ((frame.height() as f64 * scale).round() as u32).max(1);
    imageops::resize(frame, width, height, FilterType::Triangle)
}

pub fn save_full_frame(data_dir: &Path, frame: &RgbImage, prefix: &str) -> Result<String, Error> {
    save_full_frame_in(data_dir, FRAMES_DIR, frame, prefix)
}

pub fn save_full_frame_in(
    data_dir: &Path,
    subdir: &str,
    frame: &RgbImage,
    prefix: &str,
) -> Result<String, Error> {
    save_jpeg(
        data_dir,
        subdir,
        prefix,
        &downscale(frame, FULL_FRAME_MAX_SIDE),
        FULL_FRAME_QUALITY,
    )
}

/// Outline `bbox` in place, green for matches and orange otherwise
pub fn draw_box(image: &mut RgbImage, bbox: &BBox, matched: bool) {
    let color = if matched { MATCH_COLOR } else { UNKNOWN_COLOR };
    let thickness = ((image.width().max(image.height()) / 200) as i32).max(2);
    let b = bbox.clamp(image.width(), image.height());
    if b.is_empty() {
        return;
    }

    for t in 0..thickness {
        let (x1, y1) = (b.x1 + t, b.y1 + t);
        let (x2, y2) = (b.x2 - 1 - t, b.y2 - 1 - t);
        if x1 > x2 || y1 > y2 {
            break;
        }
        for x in x1..=x2 {
            image.put_pixel(x as u32, y1 as u32, color);
            image.put_pixel(x as u32, y2 as u32, color);
        }
        for y in y1..=y2 {
            image.put_pixel(x1 as u32, y as u32, color);
            image.put_pixel(x2 as u32, y as u32, color);
        }
    }
}

/// Map a frame's bbox onto a copy of that frame scaled to another size
pub fn scale_bbox(bbox: &BBox, from: (u32, u32), to: (u32, u32)) -> BBox {
    if from.0 == 0 || from.1 == 0 {
        return *bbox;
    }
    let sx = to.0 as f64 / from.0 as f64;
    let sy = to.1 as f64 / from.1 as f64;
    BBox::new(
        (bbox.x1 as f64 * sx).round() as i32,
        (bbox.y1 as f64 * sy).round() as i32,
        (bbox.x2 as f64 * sx).round() as i32,
        (bbox.y2 as f64 * sy).round() as i32,
    )
}

/// Resolve a stored relative path, refusing anything that escapes `data_dir`
pub fn resolve_relpath(data_dir: &Path, relpath: &str) -> Result<std::path::PathBuf, Error> {
    let rel = Path::new(relpath);
    if rel.is_absolute()
        || rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        return Err(Error::Validation(format!("Invalid path: {}", relpath)));
    }
    Ok(data_dir.join(rel))
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_is_written_under_images() {
        let dir = tempfile::tempdir().unwrap();
        let frame = RgbImage::from_pixel(320, 240, Rgb([10, 20, 30]));

        let relpath = save_thumbnail(dir.path(), &frame, &BBox::new(100, 50, 180, 150), "cam-1").unwrap();

        assert!(relpath.starts_with("images/cam-1_"));
        assert!(relpath.ends_with(".jpg"));
        let saved = image::open(dir.path().join(&relpath)).unwrap();
        assert_eq!((saved.width(), saved.height()), (THUMB_SIZE, THUMB_SIZE));
    }

    #[test]
    fn full_frame_is_downscaled() {
        let dir = tempfile::tempdir().unwrap();
        let frame = RgbImage::new(1280, 720);

        let relpath = save_full_frame(dir.path(), &frame, "cam-1").unwrap();

        assert!(relpath.starts_with("frames/"));
        let saved = image::open(dir.path().join(&relpath)).unwrap();
        assert_eq!((saved.width(), saved.height()), (400, 225));
    }

    #[test]
    fn draw_box_colours_edges() {
        let mut image = RgbImage::new(100, 100);
        draw_box(&mut image, &BBox::new(10, 10, 50, 50), true);
        assert_eq!(*image.get_pixel(10, 30), MATCH_COLOR);
        assert_eq!(*image.get_pixel(30, 30), Rgb([0, 0, 0]));

        draw_box(&mut image, &BBox::new(60, 60, 90, 90), false);
        assert_eq!(*image.get_pixel(60, 70), UNKNOWN_COLOR);
    }

    #[test]
    fn relpaths_cannot_escape() {
        let root = Path::new("/srv/data");
        assert!(resolve_relpath(root, "images/a.jpg").is_ok());
        assert!(resolve_relpath(root, "../etc/passwd").is_err());
        assert!(resolve_relpath(root, "/etc/passwd").is_err());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(matches!(decode_image(b"not an image"), Err(Error::Validation(_))));
    }
}
