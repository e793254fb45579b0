//! Preprocessing conduit
//!
//! The conduit runs once per document before the parser adapter: it stats the
//! file (skipped when the manifest already carries size/mtime), classifies the
//! content by a fixed magic-byte table, validates minimum usable size per kind,
//! and optionally streams the file once to precompute the SHA-256 content hash.
//!
//! The table covers 15 formats and is matched in a fixed priority order
//! (pdf, epub, image formats, audio, video, geospatial); the first matching
//! entry wins. Unknown magic classifies as [`ContentKind::Unknown`], and the
//! downstream adapter is never invoked on obviously invalid input.

use crate::abi::{ConduitResult, ContentKind, Validation};
use crate::Result;
use anyhow::Context;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Bytes of the file head read for classification and validation
const HEAD_LEN: usize = 4096;

/// Minimum usable size for a PDF, per the validation rules
const MIN_PDF_BYTES: u64 = 8;

/// Minimum usable size for non-image, non-pdf kinds
const MIN_GENERIC_BYTES: u64 = 16;

/// Minimum reported dimension (either axis) for images
const MIN_IMAGE_DIM: u32 = 64;

/// How a table entry matches the file head
enum MagicRule {
    /// Exact prefix at offset 0
    Prefix(&'static [u8]),
    /// Any of several prefixes at offset 0
    AnyPrefix(&'static [&'static [u8]]),
    /// Exact bytes at a fixed offset
    PrefixAt { offset: usize, bytes: &'static [u8] },
    /// RIFF container with the given form type at offset 8
    Riff(&'static [u8; 4]),
    /// ZIP local header plus the EPUB mimetype entry
    EpubZip,
}

struct FormatSpec {
    name: &'static str,
    kind: ContentKind,
    mime: &'static str,
    rule: MagicRule,
}

/// The fixed magic-byte table, in priority order. 15 formats.
static FORMAT_TABLE: [FormatSpec; 15] = [
    FormatSpec {
        name: "pdf",
        kind: ContentKind::Pdf,
        mime: "application/pdf",
        rule: MagicRule::Prefix(b"%PDF"),
    },
    FormatSpec {
        name: "epub",
        kind: ContentKind::Epub,
        mime: "application/epub+zip",
        rule: MagicRule::EpubZip,
    },
    FormatSpec {
        name: "png",
        kind: ContentKind::Image,
        mime: "image/png",
        rule: MagicRule::Prefix(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]),
    },
    FormatSpec {
        name: "jpeg",
        kind: ContentKind::Image,
        mime: "image/jpeg",
        rule: MagicRule::Prefix(&[0xFF, 0xD8, 0xFF]),
    },
    FormatSpec {
        name: "gif",
        kind: ContentKind::Image,
        mime: "image/gif",
        rule: MagicRule::AnyPrefix(&[b"GIF87a", b"GIF89a"]),
    },
    FormatSpec {
        name: "tiff",
        kind: ContentKind::Image,
        mime: "image/tiff",
        rule: MagicRule::AnyPrefix(&[&[0x49, 0x49, 0x2A, 0x00], &[0x4D, 0x4D, 0x00, 0x2A]]),
    },
    FormatSpec {
        name: "bmp",
        kind: ContentKind::Image,
        mime: "image/bmp",
        rule: MagicRule::Prefix(b"BM"),
    },
    FormatSpec {
        name: "webp",
        kind: ContentKind::Image,
        mime: "image/webp",
        rule: MagicRule::Riff(b"WEBP"),
    },
    FormatSpec {
        name: "mp3",
        kind: ContentKind::Audio,
        mime: "audio/mpeg",
        rule: MagicRule::AnyPrefix(&[b"ID3", &[0xFF, 0xFB], &[0xFF, 0xF3]]),
    },
    FormatSpec {
        name: "wav",
        kind: ContentKind::Audio,
        mime: "audio/wav",
        rule: MagicRule::Riff(b"WAVE"),
    },
    FormatSpec {
        name: "flac",
        kind: ContentKind::Audio,
        mime: "audio/flac",
        rule: MagicRule::Prefix(b"fLaC"),
    },
    FormatSpec {
        name: "mp4",
        kind: ContentKind::Video,
        mime: "video/mp4",
        rule: MagicRule::PrefixAt { offset: 4, bytes: b"ftyp" },
    },
    FormatSpec {
        name: "mkv",
        kind: ContentKind::Video,
        mime: "video/x-matroska",
        rule: MagicRule::Prefix(&[0x1A, 0x45, 0xDF, 0xA3]),
    },
    FormatSpec {
        name: "grib",
        kind: ContentKind::Geospatial,
        mime: "application/x-grib",
        rule: MagicRule::Prefix(b"GRIB"),
    },
    FormatSpec {
        name: "hdf5",
        kind: ContentKind::Geospatial,
        mime: "application/x-hdf5",
        rule: MagicRule::Prefix(&[0x89, b'H', b'D', b'F', 0x0D, 0x0A, 0x1A, 0x0A]),
    },
];

impl MagicRule {
    fn matches(&self, head: &[u8]) -> bool {
        match self {
            MagicRule::Prefix(p) => head.starts_with(p),
            MagicRule::AnyPrefix(ps) => ps.iter().any(|p| head.starts_with(p)),
            MagicRule::PrefixAt { offset, bytes } => {
                head.len() >= offset + bytes.len() && &head[*offset..*offset + bytes.len()] == *bytes
            }
            MagicRule::Riff(form) => {
                head.len() >= 12 && &head[..4] == b"RIFF" && &head[8..12] == &form[..]
            }
            MagicRule::EpubZip => {
                // ZIP local file header, first entry "mimetype" stored with the
                // epub media type immediately after the 30-byte header.
                head.starts_with(&[0x50, 0x4B, 0x03, 0x04])
                    && find_subslice(head, b"mimetypeapplication/epub+zip").is_some()
            }
        }
    }
}

/// Classify a file head against the fixed table. First match wins.
pub fn classify(head: &[u8]) -> (ContentKind, &'static str) {
    for spec in &FORMAT_TABLE {
        if spec.rule.matches(head) {
            return (spec.kind, spec.mime);
        }
    }
    (ContentKind::Unknown, "application/octet-stream")
}

/// Format name for a file head, for diagnostics
pub fn format_name(head: &[u8]) -> Option<&'static str> {
    FORMAT_TABLE
        .iter()
        .find(|spec| spec.rule.matches(head))
        .map(|spec| spec.name)
}

/// Per-file preprocessor
///
/// One conduit is shared per node; it holds no per-document state.
pub struct Conduit {
    compute_hash: bool,
}

impl Conduit {
    pub fn new(compute_hash: bool) -> Self {
        Self { compute_hash }
    }

    /// Run the conduit on one document.
    ///
    /// `known_size` comes from an enriched manifest and suppresses the stat
    /// call. Never returns an error: every failure mode maps to a validation
    /// state in the result so the caller can checkpoint it uniformly.
    pub fn preprocess(&self, path: &Path, known_size: Option<u64>) -> ConduitResult {
        let file_size = match known_size {
            Some(s) => s,
            None => match std::fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    return ConduitResult::new(ContentKind::Unknown, Validation::Unreadable, 0)
                }
            },
        };

        let mut head = [0u8; HEAD_LEN];
        let head_len = match read_head(path, &mut head) {
            Ok(n) => n,
            Err(_) => {
                return ConduitResult::new(ContentKind::Unknown, Validation::Unreadable, file_size)
            }
        };
        let head = &head[..head_len];

        let (kind, _mime) = classify(head);
        let validation = validate(kind, head, file_size);
        let mut result = ConduitResult::new(kind, validation, file_size);

        if self.compute_hash && result.is_valid() {
            match hash_file(path) {
                Ok(hex) => result.set_sha256(&hex),
                Err(_) => {
                    return ConduitResult::new(kind, Validation::Unreadable, file_size);
                }
            }
        }

        result
    }
}

/// Minimum-usable-size validation per kind
fn validate(kind: ContentKind, head: &[u8], file_size: u64) -> Validation {
    match kind {
        ContentKind::Unknown => Validation::BadMagic,
        ContentKind::Pdf => {
            if file_size < MIN_PDF_BYTES {
                Validation::TooSmall
            } else {
                Validation::Ok
            }
        }
        ContentKind::Image => match image_dimensions(head) {
            Some((w, h)) if w < MIN_IMAGE_DIM || h < MIN_IMAGE_DIM => Validation::TooSmall,
            _ => Validation::Ok,
        },
        _ => {
            if file_size < MIN_GENERIC_BYTES {
                Validation::TooSmall
            } else {
                Validation::Ok
            }
        }
    }
}

/// Header-reported dimensions for the image formats that expose them cheaply.
///
/// Returns `None` when the format keeps dimensions out of the fixed header
/// (tiff, webp lossless variants) or the head is truncated; those pass
/// validation and are left to the image backend.
pub fn image_dimensions(head: &[u8]) -> Option<(u32, u32)> {
    if head.starts_with(&[0x89, b'P', b'N', b'G']) && head.len() >= 24 {
        let w = u32::from_be_bytes([head[16], head[17], head[18], head[19]]);
        let h = u32::from_be_bytes([head[20], head[21], head[22], head[23]]);
        return Some((w, h));
    }
    if head.starts_with(b"GIF8") && head.len() >= 10 {
        let w = u16::from_le_bytes([head[6], head[7]]) as u32;
        let h = u16::from_le_bytes([head[8], head[9]]) as u32;
        return Some((w, h));
    }
    if head.starts_with(b"BM") && head.len() >= 26 {
        let w = i32::from_le_bytes([head[18], head[19], head[20], head[21]]);
        let h = i32::from_le_bytes([head[22], head[23], head[24], head[25]]);
        return Some((w.unsigned_abs(), h.unsigned_abs()));
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return jpeg_dimensions(head);
    }
    None
}

/// Walk JPEG markers within the head looking for a start-of-frame segment
fn jpeg_dimensions(head: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 9 < head.len() {
        if head[i] != 0xFF {
            return None;
        }
        let marker = head[i + 1];
        // Standalone markers without a length field
        if (0xD0..=0xD9).contains(&marker) || marker == 0x01 {
            i += 2;
            continue;
        }
        let len = u16::from_be_bytes([head[i + 2], head[i + 3]]) as usize;
        let is_sof = matches!(marker, 0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF);
        if is_sof {
            let h = u16::from_be_bytes([head[i + 5], head[i + 6]]) as u32;
            let w = u16::from_be_bytes([head[i + 7], head[i + 8]]) as u32;
            return Some((w, h));
        }
        i += 2 + len;
    }
    None
}

/// Stream a file once, returning its SHA-256 as 64 lowercase hex characters
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Read failed while hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

/// SHA-256 over an in-memory buffer, as 64 lowercase hex characters
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex_encode(&Sha256::digest(bytes))
}

fn hex_encode(digest: &[u8]) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn read_head(path: &Path, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn png_head(w: u32, h: u32) -> Vec<u8> {
        let mut head = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        head.extend_from_slice(&13u32.to_be_bytes());
        head.extend_from_slice(b"IHDR");
        head.extend_from_slice(&w.to_be_bytes());
        head.extend_from_slice(&h.to_be_bytes());
        head.extend_from_slice(&[8, 2, 0, 0, 0]);
        head
    }

    #[test]
    fn classify_covers_priority_order() {
        assert_eq!(classify(b"%PDF-1.7\n").0, ContentKind::Pdf);
        assert_eq!(classify(&png_head(100, 100)).0, ContentKind::Image);
        assert_eq!(classify(b"GIF89a\x10\x00\x10\x00").0, ContentKind::Image);
        assert_eq!(classify(b"fLaC....").0, ContentKind::Audio);
        assert_eq!(classify(b"ID3\x04rest").0, ContentKind::Audio);
        assert_eq!(classify(b"\x00\x00\x00\x20ftypisom").0, ContentKind::Video);
        assert_eq!(classify(b"GRIB....").0, ContentKind::Geospatial);
        assert_eq!(classify(b"no magic here").0, ContentKind::Unknown);
    }

    #[test]
    fn riff_disambiguates_wav_and_webp() {
        let mut wav = b"RIFF".to_vec();
        wav.extend_from_slice(&[0; 4]);
        wav.extend_from_slice(b"WAVEfmt ");
        assert_eq!(classify(&wav), (ContentKind::Audio, "audio/wav"));

        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&[0; 4]);
        webp.extend_from_slice(b"WEBPVP8 ");
        assert_eq!(classify(&webp), (ContentKind::Image, "image/webp"));
    }

    #[test]
    fn epub_requires_zip_and_mimetype() {
        let mut epub = vec![0x50, 0x4B, 0x03, 0x04];
        epub.extend_from_slice(&[0u8; 26]);
        epub.extend_from_slice(b"mimetypeapplication/epub+zip");
        assert_eq!(classify(&epub).0, ContentKind::Epub);

        // A bare zip without the epub mimetype is not claimed by any entry
        let zip = [0x50, 0x4B, 0x03, 0x04, 0, 0, 0, 0];
        assert_eq!(classify(&zip).0, ContentKind::Unknown);
    }

    #[test]
    fn small_images_rejected_by_reported_dimensions() {
        assert_eq!(image_dimensions(&png_head(32, 200)), Some((32, 200)));
        assert_eq!(
            validate(ContentKind::Image, &png_head(32, 200), 10_000),
            Validation::TooSmall
        );
        assert_eq!(
            validate(ContentKind::Image, &png_head(64, 64), 10_000),
            Validation::Ok
        );
    }

    #[test]
    fn jpeg_sof_scan_finds_dimensions() {
        // SOI, APP0 (len 16), SOF0 with 480x640
        let mut head = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        head.extend_from_slice(&[0u8; 14]);
        head.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        head.extend_from_slice(&480u16.to_be_bytes());
        head.extend_from_slice(&640u16.to_be_bytes());
        head.extend_from_slice(&[0u8; 10]);
        assert_eq!(image_dimensions(&head), Some((640, 480)));
    }

    #[test]
    fn preprocess_missing_file_is_unreadable() {
        let conduit = Conduit::new(false);
        let result = conduit.preprocess(Path::new("/nonexistent/file.pdf"), None);
        assert_eq!(result.validation(), Some(Validation::Unreadable));
    }

    #[test]
    fn preprocess_pdf_with_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"%PDF-1.4\nsome pdf body\n%%EOF\n").unwrap();
        drop(f);

        let conduit = Conduit::new(true);
        let result = conduit.preprocess(&path, None);
        assert_eq!(result.kind(), Some(ContentKind::Pdf));
        assert_eq!(result.validation(), Some(Validation::Ok));
        assert_eq!(result.sha256().len(), 64);
        assert_eq!(result.file_size, 29);
        // The precomputed hash matches an independent streaming hash
        assert_eq!(result.sha256(), hash_file(&path).unwrap());
    }

    #[test]
    fn preprocess_tiny_pdf_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.pdf");
        std::fs::write(&path, b"%PDF").unwrap();
        let result = Conduit::new(false).preprocess(&path, None);
        assert_eq!(result.validation(), Some(Validation::TooSmall));
    }

    #[test]
    fn unknown_magic_is_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, b"just some text, no magic").unwrap();
        let result = Conduit::new(false).preprocess(&path, None);
        assert_eq!(result.kind(), Some(ContentKind::Unknown));
        assert_eq!(result.validation(), Some(Validation::BadMagic));
    }
}
