use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

const MAX_REMOTE_TEXT_CHARS: usize = 512;
const MAX_FILE_NAME_BYTES: usize = 255;

static TRAILING_EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.[^/.]+$").unwrap_or_else(|_| unreachable!("static pattern"))
});

pub fn ensure_dir(p: &Path) -> Result<()> {
    fs::create_dir_all(p)
        .map_err(|e| Error::msg(format!("failed to create dir {}: {e}", p.display())))
}

/// Replace `path` wholesale: write a sibling temp file, fsync, rename over.
pub fn atomic_write(path: &Path, body: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            Error::msg(format!(
                "invalid file path for atomic write: {}",
                path.display()
            ))
        })?;
    ensure_dir(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
        Error::msg(format!(
            "failed to create temp file in {}: {e}",
            parent.display()
        ))
    })?;
    tmp.write_all(body)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| {
            Error::msg(format!(
                "failed to write temp file {}: {e}",
                tmp.path().display()
            ))
        })?;
    tmp.persist(path).map_err(|e| {
        Error::msg(format!(
            "failed to rename temp file -> {}: {}",
            path.display(),
            e.error
        ))
    })?;
    Ok(())
}

/// Returns whether something was removed.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::msg(format!(
            "failed to remove {}: {e}",
            path.display()
        ))),
    }
}

/// Accepts a single path segment usable both on local disk and on the mirror.
pub fn validate_file_name(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(Error::validation("file name is empty"));
    }
    if name.len() > MAX_FILE_NAME_BYTES {
        return Err(Error::validation(format!(
            "file name exceeds {MAX_FILE_NAME_BYTES} bytes"
        )));
    }
    if name.starts_with('.') {
        return Err(Error::validation(format!(
            "file name '{}' must not start with '.'",
            sanitize_remote_text(name)
        )));
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(Error::validation(format!(
            "file name '{}' contains a path separator or control character",
            sanitize_remote_text(name)
        )));
    }
    Ok(name)
}

/// File name without its final extension; falls back to `fallback` when the
/// stem would be empty.
pub fn title_from_file_name(name: &str, fallback: &str) -> String {
    let stem = TRAILING_EXTENSION.replace(name, "");
    let stem = stem.trim();
    if stem.is_empty() {
        fallback.to_string()
    } else {
        stem.to_string()
    }
}

/// Lowercase extension without the dot.
pub fn extension_of(name: &str) -> Option<String> {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .filter(|e| !e.is_empty())
}

/// Strip escape sequences and control characters from text that came off the
/// wire (server replies, remote listings) before it lands in logs or errors.
pub fn sanitize_remote_text(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_REMOTE_TEXT_CHARS));
    let mut in_csi = false;
    let mut after_esc = false;
    let mut count = 0usize;

    for c in input.chars() {
        if after_esc {
            after_esc = false;
            in_csi = c == '[';
            continue;
        }
        if in_csi {
            if ('@'..='~').contains(&c) {
                in_csi = false;
            }
            continue;
        }
        if c == '\x1b' {
            after_esc = true;
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if c.is_control() {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
        if count >= MAX_REMOTE_TEXT_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces_content() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("sub").join("state.json");
        atomic_write(&p, b"one").expect("first write");
        atomic_write(&p, b"two").expect("second write");
        assert_eq!(fs::read(&p).expect("read"), b"two");
        let leftovers = fs::read_dir(p.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn file_names_are_single_segments() {
        assert!(validate_file_name("report.pdf").is_ok());
        assert!(validate_file_name("Прайс 2024.pdf").is_ok());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name(".hidden").is_err());
        assert!(validate_file_name("a\\b").is_err());
        assert!(validate_file_name("").is_err());
    }

    #[test]
    fn titles_drop_only_the_last_extension() {
        assert_eq!(title_from_file_name("brochure.png", "Document"), "brochure");
        assert_eq!(title_from_file_name("archive.tar.gz", "Document"), "archive.tar");
        assert_eq!(title_from_file_name(".pdf", "Document"), "Document");
        assert_eq!(title_from_file_name("README", "Document"), "README");
    }

    #[test]
    fn remote_text_is_cleaned() {
        let got = sanitize_remote_text("550 \u{1b}[31mNo such file\u{1b}[0m\r\n");
        assert_eq!(got, "550 No such file");
    }
}
