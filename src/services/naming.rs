//! Filename and folder-name helpers shared by ingestion and export.

/// Image extensions accepted when the client sends no usable content type.
const IMAGE_EXTENSIONS: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
    ("avif", "image/avif"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
];

const MAX_COMPONENT_LEN: usize = 120;

/// Image MIME type implied by a filename's extension.
pub fn image_content_type_for(filename: &str) -> Option<&'static str> {
    let (_, ext) = filename.rsplit_once('.')?;
    IMAGE_EXTENSIONS
        .iter()
        .find(|(candidate, _)| candidate.eq_ignore_ascii_case(ext))
        .map(|(_, mime)| *mime)
}

/// Resolve the effective image content type of an incoming file, or `None`
/// if it is not an image.
pub fn resolve_image_type(filename: &str, declared: Option<&str>) -> Option<String> {
    match declared.map(|ct| ct.trim().to_ascii_lowercase()) {
        Some(ct) if ct.starts_with("image/") => Some(ct),
        Some(ct) if !ct.is_empty() && ct != "application/octet-stream" => None,
        _ => image_content_type_for(filename).map(str::to_string),
    }
}

/// Make a single path component safe for object paths and archive entries.
///
/// Keeps letters, digits, `.`, `-`, `_` and spaces; everything else becomes
/// `_`. Leading dots are stripped so no component is hidden or `..`.
pub fn sanitize_component(raw: &str, fallback: &str) -> String {
    let mapped: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim_start_matches('.').trim();
    let clipped: String = trimmed.chars().take(MAX_COMPONENT_LEN).collect();
    let clipped = clipped.trim_end();
    if clipped.is_empty() || clipped.chars().all(|c| c == '_') {
        fallback.to_string()
    } else {
        clipped.to_string()
    }
}

/// Strip any client-side directory part from an uploaded filename.
pub fn base_filename(raw: &str) -> &str {
    raw.rsplit(['/', '\\']).next().unwrap_or(raw)
}

/// `name (n).ext` for the n-th duplicate of `name.ext`.
pub fn numbered_duplicate(name: &str, n: usize) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{} ({}).{}", stem, n, ext),
        _ => format!("{} ({})", name, n),
    }
}
