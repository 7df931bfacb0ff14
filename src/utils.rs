//! Small helpers: filename derivation and CLI-side output naming.
use std::path::{Path, PathBuf};

use crate::control::CONTROL_SUFFIX;

/// Derives an output filename from a URL's path component.
///
/// The last path segment is percent-decoded; an empty or unusable path
/// falls back to `"download"`.
pub fn filename_from_url(url: &str) -> String {
    let name = reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .map(percent_decode)
                .filter(|s| !s.is_empty())
        })
        .unwrap_or_default();
    if name.is_empty() {
        "download".to_string()
    } else {
        name
    }
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = String::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%'
            && index + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_value(bytes[index + 1]), hex_value(bytes[index + 2]))
        {
            let decoded = (hi << 4) | lo;
            // Path separators and control bytes never belong in a filename.
            if decoded.is_ascii_graphic() || decoded == b' ' {
                if decoded != b'/' && decoded != b'\\' {
                    out.push(decoded as char);
                } else {
                    out.push('_');
                }
                index += 3;
                continue;
            }
        }
        out.push(bytes[index] as char);
        index += 1;
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Picks a filename that does not collide with an existing file by
/// appending a numeric suffix before the extension: `name.1.ext`,
/// `name.2.ext` and so on.
pub fn unique_filename(dir: &Path, filename: &str) -> String {
    if !dir.join(filename).exists() {
        return filename.to_string();
    }
    let (stem, ext) = split_extension(filename);
    for n in 1.. {
        let candidate = match ext {
            Some(ext) => format!("{stem}.{n}.{ext}"),
            None => format!("{stem}.{n}"),
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
    }
    unreachable!()
}

/// Scans `dir` for the most recently modified control file whose output
/// name is `filename` or a numbered variant of it, and returns that output
/// filename so the caller can resume it instead of starting fresh.
pub fn find_resumable_filename(dir: &Path, filename: &str) -> Option<String> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut best: Option<(std::time::SystemTime, String)> = None;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(target) = name.strip_suffix(CONTROL_SUFFIX) else {
            continue;
        };
        if !matches_base_name(target, filename) {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if best.as_ref().is_none_or(|(time, _)| modified > *time) {
            best = Some((modified, target.to_string()));
        }
    }
    best.map(|(_, target)| target)
}

/// True when `candidate` is `base` itself or a numbered variant like
/// `name.3.ext` of `name.ext`.
fn matches_base_name(candidate: &str, base: &str) -> bool {
    if candidate == base {
        return true;
    }
    let (stem, ext) = split_extension(base);
    let Some(rest) = candidate.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix('.') else {
        return false;
    };
    match ext {
        Some(ext) => rest
            .strip_suffix(ext)
            .and_then(|n| n.strip_suffix('.'))
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
        None => !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()),
    }
}

fn split_extension(filename: &str) -> (&str, Option<&str>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    }
}

/// Convenience wrapper: full output path for a unique filename in `dir`.
pub fn unique_output_path(dir: &Path, filename: &str) -> PathBuf {
    dir.join(unique_filename(dir, filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn derives_filename_from_url_path() {
        assert_eq!(
            filename_from_url("https://example.com/pub/file.tar.gz?x=1"),
            "file.tar.gz"
        );
        assert_eq!(
            filename_from_url("https://example.com/a%20b.bin"),
            "a b.bin"
        );
        assert_eq!(filename_from_url("https://example.com/"), "download");
        assert_eq!(filename_from_url("not a url"), "download");
    }

    #[test]
    fn unique_filename_appends_numeric_suffix() {
        let dir = tempdir().unwrap();
        assert_eq!(unique_filename(dir.path(), "file.bin"), "file.bin");

        std::fs::write(dir.path().join("file.bin"), b"x").unwrap();
        assert_eq!(unique_filename(dir.path(), "file.bin"), "file.1.bin");

        std::fs::write(dir.path().join("file.1.bin"), b"x").unwrap();
        assert_eq!(unique_filename(dir.path(), "file.bin"), "file.2.bin");

        std::fs::write(dir.path().join("noext"), b"x").unwrap();
        assert_eq!(unique_filename(dir.path(), "noext"), "noext.1");
    }

    #[test]
    fn finds_newest_matching_control_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("file.1.bin.paradl"), b"{}").unwrap();
        std::fs::write(dir.path().join("other.bin.paradl"), b"{}").unwrap();

        let found = find_resumable_filename(dir.path(), "file.bin").unwrap();
        assert_eq!(found, "file.1.bin");
    }

    #[test]
    fn ignores_non_matching_control_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("filexbin.paradl"), b"{}").unwrap();
        std::fs::write(dir.path().join("file.abc.bin.paradl"), b"{}").unwrap();
        assert!(find_resumable_filename(dir.path(), "file.bin").is_none());
    }

    #[test]
    fn base_name_matching_rules() {
        assert!(matches_base_name("file.bin", "file.bin"));
        assert!(matches_base_name("file.7.bin", "file.bin"));
        assert!(!matches_base_name("file..bin", "file.bin"));
        assert!(!matches_base_name("file.x.bin", "file.bin"));
        assert!(matches_base_name("noext.2", "noext"));
        assert!(!matches_base_name("noext.x", "noext"));
    }
}
