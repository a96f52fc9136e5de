//! File-kind rules shared by uploads, on-demand repair and boot-time sync.

use crate::error::{Error, Result};
use crate::model::FileType;
use crate::util::extension_of;

pub const MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "jpeg", "jpg", "png", "gif", "doc", "docx", "xls", "xlsx", "txt", "zip",
];

const PDF_MAGIC: &[u8] = b"%PDF";
const PNG_MAGIC: &[u8] = b"\x89PNG";
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const GIF_MAGIC: &[u8] = b"GIF8";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

pub fn is_allowed(name: &str) -> bool {
    extension_of(name).is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
}

pub fn file_type_for(name: &str) -> FileType {
    match extension_of(name).as_deref() {
        Some("pdf") => FileType::Pdf,
        _ => FileType::Image,
    }
}

pub fn mime_for(name: &str) -> &'static str {
    match extension_of(name).as_deref() {
        Some("pdf") => "application/pdf",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("zip") => "application/zip",
        Some("txt") => "text/plain; charset=utf-8",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        _ => "application/octet-stream",
    }
}

fn expected_magic(ext: &str) -> Option<&'static [u8]> {
    match ext {
        "pdf" => Some(PDF_MAGIC),
        "png" => Some(PNG_MAGIC),
        "jpg" | "jpeg" => Some(JPEG_MAGIC),
        "gif" => Some(GIF_MAGIC),
        "zip" | "docx" | "xlsx" => Some(ZIP_MAGIC),
        "doc" | "xls" => Some(OLE_MAGIC),
        _ => None,
    }
}

/// Check that `bytes` plausibly hold a file called `name`: non-empty, and
/// starting with the extension's magic number when one is known.
pub fn verify(name: &str, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Err(Error::corrupt(format!("{name}: empty payload")));
    }
    let Some(ext) = extension_of(name) else {
        return Ok(());
    };
    if let Some(magic) = expected_magic(&ext)
        && !bytes.starts_with(magic)
    {
        return Err(Error::corrupt(format!(
            "{name}: content does not look like a .{ext} file"
        )));
    }
    Ok(())
}
