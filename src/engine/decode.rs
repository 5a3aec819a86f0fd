use crate::engine::exif::read_jpeg_orientation;
use crate::jobs::model::ImageKind;
use image::DynamicImage;
use std::path::{Path, PathBuf};

/// Per-image result of the decode stage. Failures are values, not errors:
/// a failed image yields face_count = 0 and the batch continues.
#[derive(Debug)]
pub enum DecodeOutcome {
    Decoded(DynamicImage),
    DecodeFailed { reason: String },
}

/// Batch-scoped temp directory for RAW intermediates. The directory is
/// removed on drop, so intermediates die with the batch on every exit path.
#[derive(Debug)]
pub struct TempScope {
    dir: PathBuf,
}

impl TempScope {
    pub fn new(dir: PathBuf) -> std::io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, image_id: i64) -> PathBuf {
        self.dir.join(format!("{}.jpg", image_id))
    }
}

impl Drop for TempScope {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("decode: cannot remove temp dir {:?}: {}", self.dir, e);
            }
        }
    }
}

/// Apply an EXIF orientation to an image, covering rotations and mirrored
/// variants. Orientation 1 (or None) is identity.
pub fn apply_orientation(img: DynamicImage, orientation: Option<u16>) -> DynamicImage {
    match orientation {
        Some(2) => img.fliph(),
        Some(3) => img.rotate180(),
        Some(4) => img.flipv(),
        Some(5) => img.rotate90().fliph(),
        Some(6) => img.rotate90(),
        Some(7) => img.rotate270().fliph(),
        Some(8) => img.rotate270(),
        _ => img,
    }
}

/// Decode a source image to 8-bit sRGB with orientation baked in.
///
/// JPEG opens directly; ARW goes through the full rawler develop pipeline
/// (demosaic, metadata white balance, sRGB gamma). This is the single decode
/// path shared by the analysis and compression stages, so staged output is
/// byte-identical whether or not a run was interrupted in between.
pub fn decode_source(path: &Path, kind: ImageKind) -> Result<DynamicImage, String> {
    match kind {
        ImageKind::Jpeg => decode_jpeg(path),
        ImageKind::Raw => decode_raw(path),
    }
}

fn decode_jpeg(path: &Path) -> Result<DynamicImage, String> {
    let img = image::open(path).map_err(|e| format!("cannot open JPEG {:?}: {}", path, e))?;
    let orientation = read_jpeg_orientation(path);
    Ok(apply_orientation(img, orientation))
}

fn decode_raw(path: &Path) -> Result<DynamicImage, String> {
    // rawler may panic on malformed containers; contain it to this image.
    match std::panic::catch_unwind(|| decode_raw_inner(path)) {
        Ok(result) => result,
        Err(_) => Err(format!("panic while developing RAW {:?}", path)),
    }
}

fn decode_raw_inner(path: &Path) -> Result<DynamicImage, String> {
    let rawfile = rawler::rawsource::RawSource::new(path)
        .map_err(|e| format!("cannot open RAW {:?}: {}", path, e))?;
    let decoder = rawler::get_decoder(&rawfile)
        .map_err(|e| format!("no RAW decoder for {:?}: {:?}", path, e))?;
    let params = rawler::decoders::RawDecodeParams { image_index: 0 };

    let rawimage = decoder
        .raw_image(&rawfile, &params, false)
        .map_err(|e| format!("cannot decode RAW {:?}: {:?}", path, e))?;

    let developed = rawler::imgop::develop::RawDevelop::default()
        .develop_intermediate(&rawimage)
        .map_err(|e| format!("cannot develop RAW {:?}: {:?}", path, e))?;

    let img = developed
        .to_dynamic_image()
        .ok_or_else(|| format!("developed RAW {:?} yields no image", path))?;

    // Bake the capture orientation recorded in the RAW metadata.
    let orientation = decoder
        .raw_metadata(&rawfile, &params)
        .ok()
        .and_then(|m| m.exif.orientation);
    // Developed output is 16-bit; the engine works in 8-bit sRGB.
    let img = DynamicImage::ImageRgb8(img.to_rgb8());
    Ok(apply_orientation(img, orientation))
}

/// Decode for the analysis stage. RAW sources additionally materialise an
/// 8-bit JPEG under the batch temp scope; its lifetime is the batch's.
pub fn decode_for_analysis(
    path: &Path,
    kind: ImageKind,
    image_id: i64,
    temp: &TempScope,
) -> DecodeOutcome {
    let img = match decode_source(path, kind) {
        Ok(img) => img,
        Err(reason) => {
            tracing::warn!("decode: {}", reason);
            return DecodeOutcome::DecodeFailed { reason };
        }
    };

    if kind == ImageKind::Raw {
        let temp_path = temp.path_for(image_id);
        if let Err(e) = img.save(&temp_path) {
            // The in-memory image is still usable; the temp file is only the
            // file-backed intermediate.
            tracing::warn!("decode: cannot write temp JPEG {:?}: {}", temp_path, e);
        }
    }

    DecodeOutcome::Decoded(img)
}
