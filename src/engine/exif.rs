use std::path::Path;

/// Read the EXIF Orientation tag from a JPEG file using kamadak-exif.
/// Never panics; returns None on any error or when the tag is absent.
pub fn read_jpeg_orientation(path: &Path) -> Option<u16> {
    match std::panic::catch_unwind(|| read_jpeg_orientation_inner(path)) {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!("panic in read_jpeg_orientation for {:?}", path);
            None
        }
    }
}

fn read_jpeg_orientation_inner(path: &Path) -> Option<u16> {
    let file = std::fs::File::open(path).ok()?;
    let mut buf_reader = std::io::BufReader::new(file);
    let exif = exif::Reader::new()
        .read_from_container(&mut buf_reader)
        .ok()?;

    let field = exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)?;
    match &field.value {
        exif::Value::Short(v) => v.first().copied(),
        _ => None,
    }
}
