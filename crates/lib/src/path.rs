//! Asset path rules.
//!
//! Logical paths are slash-rooted and case-sensitive. A trailing slash
//! marks a folder; file paths never end in one. Segments are never
//! empty, so `//` is always invalid.

/// Whether `path` is a syntactically valid asset path (file or folder).
pub fn is_valid_path(path: &str) -> bool {
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    if path.contains("//") {
        return false;
    }
    // Folders end in '/', which `split` turns into one empty trailing
    // segment; every other segment must be non-empty and printable.
    let mut segments = rest.split('/').peekable();
    while let Some(segment) = segments.next() {
        let last = segments.peek().is_none();
        if segment.is_empty() {
            return last && path.len() > 1;
        }
        if segment.bytes().any(|b| b.is_ascii_control() || b == b'\\') {
            return false;
        }
    }
    true
}

/// Whether `path` is a valid path naming a file (no trailing slash).
pub fn is_valid_file_path(path: &str) -> bool {
    is_valid_path(path) && !path_is_folder(path)
}

pub fn path_is_folder(path: &str) -> bool {
    path.ends_with('/')
}

/// The lowercased extension after the final `.` of the final segment,
/// if any.
pub fn path_extension(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next()?;
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
