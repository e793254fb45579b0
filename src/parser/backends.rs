//! Built-in parser backends
//!
//! These are deliberately thin: each wraps the minimal native decoding needed
//! to surface text and metadata for the engine. The heavy per-format libraries
//! live behind the same [`ParserBackend`] seam and can replace any of these
//! without touching the orchestration layer.

use super::{BackendError, Extraction, ParserBackend, StreamDesc};
use crate::abi::ContentKind;
use crate::conduit;
use flate2::read::DeflateDecoder;
use std::io::Read;
use std::path::Path;

/// The default backend set, one per supported kind
pub fn builtin_backends() -> Vec<Box<dyn ParserBackend>> {
    vec![
        Box::new(PdfBackend),
        Box::new(ImageBackend),
        Box::new(AvBackend::new(ContentKind::Audio)),
        Box::new(AvBackend::new(ContentKind::Video)),
        Box::new(EpubBackend),
        Box::new(GeoBackend),
    ]
}

// ---------------------------------------------------------------------------
// PDF
// ---------------------------------------------------------------------------

/// Extracts text runs from uncompressed content streams and metadata from the
/// document information dictionary.
pub struct PdfBackend;

impl ParserBackend for PdfBackend {
    fn kind(&self) -> ContentKind {
        ContentKind::Pdf
    }

    fn extract(&mut self, _input: &Path, data: &[u8]) -> Result<Extraction, BackendError> {
        if !data.starts_with(b"%PDF") {
            return Err(BackendError::Corrupted("missing %PDF header".into()));
        }

        let mut extraction = Extraction {
            page_count: count_pdf_pages(data),
            ..Default::default()
        };
        extraction.text = extract_pdf_text(data);
        extraction.title = pdf_info_string(data, b"/Title");
        extraction.author = pdf_info_string(data, b"/Author");
        if let Some(version) = data.get(5..8).and_then(|v| std::str::from_utf8(v).ok()) {
            extraction
                .metadata
                .push(("pdf-version".into(), version.trim_end_matches(|c: char| !c.is_ascii_digit()).into()));
        }
        Ok(extraction)
    }

    fn version(&self) -> &'static str {
        "pdf-scan 0.1.0"
    }
}

fn count_pdf_pages(data: &[u8]) -> i32 {
    let mut pages = 0;
    for pattern in [&b"/Type /Page"[..], &b"/Type/Page"[..]] {
        let mut at = 0;
        while let Some(pos) = find_from(data, pattern, at) {
            let next = data.get(pos + pattern.len()).copied();
            // "/Type /Pages" is the page tree node, not a page
            if next != Some(b's') {
                pages += 1;
            }
            at = pos + pattern.len();
        }
    }
    pages
}

/// Collect literal strings used by Tj/TJ show operators inside BT..ET blocks
fn extract_pdf_text(data: &[u8]) -> String {
    let mut out = String::new();
    let mut at = 0;
    while let Some(bt) = find_from(data, b"BT", at) {
        let et = find_from(data, b"ET", bt + 2).unwrap_or(data.len());
        let block = &data[bt..et];
        let mut i = 0;
        while i < block.len() {
            if block[i] == b'(' {
                let (s, consumed) = read_pdf_string(&block[i..]);
                let trimmed = s.trim();
                if !trimmed.is_empty() {
                    if !out.is_empty() {
                        out.push(' ');
                    }
                    out.push_str(trimmed);
                }
                i += consumed;
            } else {
                i += 1;
            }
        }
        at = et + 2;
        if at >= data.len() {
            break;
        }
    }
    out
}

/// Read a parenthesized PDF string with escape handling. Returns the decoded
/// text and the number of bytes consumed.
fn read_pdf_string(block: &[u8]) -> (String, usize) {
    let mut s = String::new();
    let mut depth = 0;
    let mut i = 0;
    while i < block.len() {
        match block[i] {
            b'(' => {
                depth += 1;
                if depth > 1 {
                    s.push('(');
                }
            }
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return (s, i + 1);
                }
                s.push(')');
            }
            b'\\' if i + 1 < block.len() => {
                i += 1;
                match block[i] {
                    b'n' => s.push('\n'),
                    b't' => s.push('\t'),
                    b'r' => s.push('\r'),
                    c => s.push(c as char),
                }
            }
            c if c.is_ascii() && !c.is_ascii_control() => s.push(c as char),
            _ => {}
        }
        i += 1;
    }
    (s, block.len())
}

fn pdf_info_string(data: &[u8], key: &[u8]) -> Option<String> {
    let pos = find_from(data, key, 0)?;
    let rest = &data[pos + key.len()..];
    let open = rest.iter().position(|&b| b == b'(')?;
    // Key and value must be adjacent in the info dictionary
    if open > 8 {
        return None;
    }
    let (s, _) = read_pdf_string(&rest[open..]);
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// Surfaces header metadata for raster images; pixel decoding belongs to the
/// OCR and perceptual-hash stages.
pub struct ImageBackend;

impl ParserBackend for ImageBackend {
    fn kind(&self) -> ContentKind {
        ContentKind::Image
    }

    fn extract(&mut self, _input: &Path, data: &[u8]) -> Result<Extraction, BackendError> {
        let head = &data[..data.len().min(4096)];
        let (kind, mime) = conduit::classify(head);
        if kind != ContentKind::Image {
            return Err(BackendError::Corrupted("not an image header".into()));
        }

        let mut extraction = Extraction {
            page_count: 1,
            ..Default::default()
        };
        extraction.metadata.push(("format".into(), mime.into()));
        if let Some((w, h)) = conduit::image_dimensions(head) {
            extraction.metadata.push(("width".into(), w.to_string()));
            extraction.metadata.push(("height".into(), h.to_string()));
        }
        Ok(extraction)
    }

    fn version(&self) -> &'static str {
        "image-meta 0.1.0"
    }
}

// ---------------------------------------------------------------------------
// Audio / Video containers
// ---------------------------------------------------------------------------

/// Container metadata for audio and video: duration and stream listing.
/// One instance claims each kind.
pub struct AvBackend {
    kind: ContentKind,
}

impl AvBackend {
    pub fn new(kind: ContentKind) -> Self {
        Self { kind }
    }
}

impl ParserBackend for AvBackend {
    fn kind(&self) -> ContentKind {
        self.kind
    }

    fn extract(&mut self, _input: &Path, data: &[u8]) -> Result<Extraction, BackendError> {
        let mut extraction = Extraction::default();

        if data.starts_with(b"RIFF") && data.len() >= 12 && &data[8..12] == b"WAVE" {
            extraction.duration_sec = wav_duration(data).unwrap_or(0.0);
            extraction.streams.push(StreamDesc {
                stream_type: "audio".into(),
                codec: "pcm".into(),
            });
        } else if data.len() >= 8 && &data[4..8] == b"ftyp" {
            extraction.duration_sec = mp4_duration(data).unwrap_or(0.0);
            extraction.streams = mp4_streams(data);
        } else if data.starts_with(b"fLaC") || data.starts_with(b"ID3") || data.starts_with(&[0xFF, 0xFB]) {
            extraction.streams.push(StreamDesc {
                stream_type: "audio".into(),
                codec: if data.starts_with(b"fLaC") { "flac" } else { "mp3" }.into(),
            });
        } else if data.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
            extraction.streams.push(StreamDesc {
                stream_type: "video".into(),
                codec: "matroska".into(),
            });
        } else {
            return Err(BackendError::Corrupted("unrecognized container".into()));
        }
        Ok(extraction)
    }

    fn version(&self) -> &'static str {
        "av-container 0.1.0"
    }
}

/// Duration of a PCM WAV from the fmt byte rate and data chunk size
fn wav_duration(data: &[u8]) -> Option<f64> {
    let mut byte_rate = None;
    let mut data_len = None;
    let mut i = 12;
    while i + 8 <= data.len() {
        let id = &data[i..i + 4];
        let len = u32::from_le_bytes([data[i + 4], data[i + 5], data[i + 6], data[i + 7]]) as usize;
        if id == b"fmt " && i + 16 + 4 <= data.len() {
            byte_rate = Some(u32::from_le_bytes([
                data[i + 16],
                data[i + 17],
                data[i + 18],
                data[i + 19],
            ]));
        } else if id == b"data" {
            data_len = Some(len);
        }
        i += 8 + len + (len & 1);
    }
    match (byte_rate, data_len) {
        (Some(rate), Some(len)) if rate > 0 => Some(len as f64 / rate as f64),
        _ => None,
    }
}

/// Duration from the mvhd box (version 0 layout)
fn mp4_duration(data: &[u8]) -> Option<f64> {
    let pos = find_from(data, b"mvhd", 0)?;
    let body = data.get(pos + 4..pos + 24)?;
    let version = body[0];
    if version != 0 {
        return None;
    }
    let timescale = u32::from_be_bytes([body[12], body[13], body[14], body[15]]);
    let duration = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);
    if timescale == 0 {
        return None;
    }
    Some(duration as f64 / timescale as f64)
}

/// Stream listing from hdlr boxes (handler type at offset 8 of the box body)
fn mp4_streams(data: &[u8]) -> Vec<StreamDesc> {
    let mut streams = Vec::new();
    let mut at = 0;
    while let Some(pos) = find_from(data, b"hdlr", at) {
        if let Some(handler) = data.get(pos + 12..pos + 16) {
            let stream_type = match handler {
                b"vide" => Some("video"),
                b"soun" => Some("audio"),
                b"sbtl" | b"subt" => Some("subtitle"),
                b"text" => Some("text"),
                _ => None,
            };
            if let Some(t) = stream_type {
                streams.push(StreamDesc {
                    stream_type: t.into(),
                    codec: String::from_utf8_lossy(handler).into_owned(),
                });
            }
        }
        at = pos + 4;
    }
    streams
}

// ---------------------------------------------------------------------------
// EPUB
// ---------------------------------------------------------------------------

/// Walks the ZIP central directory, reads the OPF package metadata, and
/// strips markup from the XHTML spine entries.
pub struct EpubBackend;

impl ParserBackend for EpubBackend {
    fn kind(&self) -> ContentKind {
        ContentKind::Epub
    }

    fn extract(&mut self, _input: &Path, data: &[u8]) -> Result<Extraction, BackendError> {
        let entries = zip_entries(data)
            .ok_or_else(|| BackendError::Corrupted("no zip central directory".into()))?;

        let mut extraction = Extraction::default();
        let mut texts = Vec::new();
        for entry in &entries {
            let lower = entry.name.to_ascii_lowercase();
            if lower.ends_with(".opf") {
                if let Some(opf) = zip_entry_data(data, entry) {
                    let opf = String::from_utf8_lossy(&opf).into_owned();
                    extraction.title = xml_element_text(&opf, "dc:title");
                    extraction.author = xml_element_text(&opf, "dc:creator");
                }
            } else if lower.ends_with(".xhtml") || lower.ends_with(".html") || lower.ends_with(".htm")
            {
                extraction.page_count += 1;
                if let Some(body) = zip_entry_data(data, entry) {
                    texts.push(strip_markup(&String::from_utf8_lossy(&body)));
                }
            }
        }
        extraction.text = texts.join("\n");
        extraction
            .metadata
            .push(("container-entries".into(), entries.len().to_string()));
        Ok(extraction)
    }

    fn version(&self) -> &'static str {
        "epub-container 0.1.0"
    }
}

struct ZipEntry {
    name: String,
    method: u16,
    compressed_size: usize,
    local_offset: usize,
}

/// Parse the ZIP central directory. Returns `None` when the end-of-central-
/// directory record cannot be located.
fn zip_entries(data: &[u8]) -> Option<Vec<ZipEntry>> {
    const EOCD: [u8; 4] = [0x50, 0x4B, 0x05, 0x06];
    const CDIR: [u8; 4] = [0x50, 0x4B, 0x01, 0x02];

    let scan_start = data.len().saturating_sub(66_000);
    let eocd = (scan_start..data.len().saturating_sub(21))
        .rev()
        .find(|&i| data[i..i + 4] == EOCD)?;
    let count = u16::from_le_bytes([data[eocd + 10], data[eocd + 11]]) as usize;
    let cdir_offset = u32::from_le_bytes([
        data[eocd + 16],
        data[eocd + 17],
        data[eocd + 18],
        data[eocd + 19],
    ]) as usize;

    let mut entries = Vec::with_capacity(count);
    let mut i = cdir_offset;
    for _ in 0..count {
        if i + 46 > data.len() || data[i..i + 4] != CDIR {
            break;
        }
        let method = u16::from_le_bytes([data[i + 10], data[i + 11]]);
        let compressed_size = u32::from_le_bytes([
            data[i + 20],
            data[i + 21],
            data[i + 22],
            data[i + 23],
        ]) as usize;
        let name_len = u16::from_le_bytes([data[i + 28], data[i + 29]]) as usize;
        let extra_len = u16::from_le_bytes([data[i + 30], data[i + 31]]) as usize;
        let comment_len = u16::from_le_bytes([data[i + 32], data[i + 33]]) as usize;
        let local_offset = u32::from_le_bytes([
            data[i + 42],
            data[i + 43],
            data[i + 44],
            data[i + 45],
        ]) as usize;
        let name = String::from_utf8_lossy(&data[i + 46..i + 46 + name_len]).into_owned();
        entries.push(ZipEntry {
            name,
            method,
            compressed_size,
            local_offset,
        });
        i += 46 + name_len + extra_len + comment_len;
    }
    Some(entries)
}

/// Read one entry's bytes, inflating method-8 entries
fn zip_entry_data(data: &[u8], entry: &ZipEntry) -> Option<Vec<u8>> {
    let i = entry.local_offset;
    if i + 30 > data.len() || data[i..i + 4] != [0x50, 0x4B, 0x03, 0x04] {
        return None;
    }
    let name_len = u16::from_le_bytes([data[i + 26], data[i + 27]]) as usize;
    let extra_len = u16::from_le_bytes([data[i + 28], data[i + 29]]) as usize;
    let start = i + 30 + name_len + extra_len;
    let end = start.checked_add(entry.compressed_size)?;
    let raw = data.get(start..end)?;
    match entry.method {
        0 => Some(raw.to_vec()),
        8 => {
            let mut out = Vec::new();
            DeflateDecoder::new(raw).read_to_end(&mut out).ok()?;
            Some(out)
        }
        _ => None,
    }
}

/// First text content of `<element ...>text</element>` in a small XML blob
fn xml_element_text(xml: &str, element: &str) -> Option<String> {
    let open = format!("<{}", element);
    let close = format!("</{}>", element);
    let start = xml.find(&open)?;
    let content_start = xml[start..].find('>')? + start + 1;
    let content_end = xml[content_start..].find(&close)? + content_start;
    let text = xml[content_start..content_end].trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Remove tags and collapse whitespace from markup
fn strip_markup(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            c if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Geospatial
// ---------------------------------------------------------------------------

/// Header metadata for geospatial rasters (GRIB, HDF5). Band data never
/// crosses this boundary; the coordinates stage works from the metadata.
pub struct GeoBackend;

impl ParserBackend for GeoBackend {
    fn kind(&self) -> ContentKind {
        ContentKind::Geospatial
    }

    fn extract(&mut self, _input: &Path, data: &[u8]) -> Result<Extraction, BackendError> {
        let mut extraction = Extraction {
            page_count: 1,
            ..Default::default()
        };
        if data.starts_with(b"GRIB") {
            let edition = data.get(7).copied().unwrap_or(0);
            extraction.metadata.push(("format".into(), "grib".into()));
            extraction
                .metadata
                .push(("grib-edition".into(), edition.to_string()));
        } else if data.starts_with(&[0x89, b'H', b'D', b'F']) {
            extraction.metadata.push(("format".into(), "hdf5".into()));
        } else {
            return Err(BackendError::Corrupted("unrecognized raster header".into()));
        }
        Ok(extraction)
    }

    fn version(&self) -> &'static str {
        "geo-header 0.1.0"
    }
}

// ---------------------------------------------------------------------------

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_text_and_metadata() {
        let pdf = b"%PDF-1.4\n1 0 obj << /Title (Sample Doc) /Author (A. Writer) >> endobj\n\
                    2 0 obj << /Type /Page >> endobj\n\
                    BT (Hello) Tj ( world) Tj ET\n%%EOF";
        let mut backend = PdfBackend;
        let e = backend.extract(Path::new("x.pdf"), pdf).unwrap();
        assert_eq!(e.title.as_deref(), Some("Sample Doc"));
        assert_eq!(e.author.as_deref(), Some("A. Writer"));
        assert_eq!(e.page_count, 1);
        assert_eq!(e.text, "Hello world");
        assert_eq!(e.word_count(), 2);
    }

    #[test]
    fn pdf_pages_excludes_page_tree_node() {
        let pdf = b"%PDF-1.4 << /Type /Pages /Kids [] >> << /Type /Page >> << /Type /Page >>";
        assert_eq!(count_pdf_pages(pdf), 2);
    }

    #[test]
    fn wav_duration_from_fmt_and_data() {
        // 44.1kHz stereo 16-bit = 176400 bytes/sec; 1 second of data
        let mut wav = b"RIFF".to_vec();
        wav.extend_from_slice(&0u32.to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // pcm
        wav.extend_from_slice(&2u16.to_le_bytes()); // channels
        wav.extend_from_slice(&44100u32.to_le_bytes());
        wav.extend_from_slice(&176400u32.to_le_bytes());
        wav.extend_from_slice(&4u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&176400u32.to_le_bytes());
        // Chunk sizes only are inspected; payload bytes are irrelevant here
        let mut backend = AvBackend::new(ContentKind::Audio);
        let e = backend.extract(Path::new("x.wav"), &wav).unwrap();
        assert!((e.duration_sec - 1.0).abs() < 1e-9);
        assert_eq!(e.streams.len(), 1);
    }

    #[test]
    fn mp4_duration_and_streams() {
        let mut mp4 = Vec::new();
        mp4.extend_from_slice(&[0, 0, 0, 0x20]);
        mp4.extend_from_slice(b"ftypisom");
        mp4.extend_from_slice(&[0u8; 16]);
        // mvhd v0: 12 bytes pre-timescale, timescale 1000, duration 90000
        mp4.extend_from_slice(&[0, 0, 0, 0x6C]);
        mp4.extend_from_slice(b"mvhd");
        mp4.push(0);
        mp4.extend_from_slice(&[0u8; 11]);
        mp4.extend_from_slice(&1000u32.to_be_bytes());
        mp4.extend_from_slice(&90_000u32.to_be_bytes());
        // hdlr with a subtitle handler
        mp4.extend_from_slice(&[0, 0, 0, 0x20]);
        mp4.extend_from_slice(b"hdlr");
        mp4.extend_from_slice(&[0u8; 8]);
        mp4.extend_from_slice(b"sbtl");
        let mut backend = AvBackend::new(ContentKind::Video);
        let e = backend.extract(Path::new("x.mp4"), &mp4).unwrap();
        assert!((e.duration_sec - 90.0).abs() < 1e-9);
        assert_eq!(e.streams[0].stream_type, "subtitle");
    }

    #[test]
    fn strip_markup_collapses_whitespace() {
        assert_eq!(
            strip_markup("<p>Hello <b>there</b>,\n  world</p>"),
            "Hello there , world"
        );
    }

    #[test]
    fn geo_header_metadata() {
        let mut backend = GeoBackend;
        let grib = b"GRIB\x00\x00\x00\x02rest of message";
        let e = backend.extract(Path::new("x.grib"), grib).unwrap();
        assert!(e
            .metadata
            .iter()
            .any(|(k, v)| k == "grib-edition" && v == "2"));
    }

    #[test]
    fn epub_zip_walk() {
        // Stored (method 0) single-entry zip: mimetype
        let name = b"mimetype";
        let body = b"application/epub+zip";
        let mut zip = Vec::new();
        // local header: sig, versions/flags/method/time/date, crc, sizes, name/extra len
        zip.extend_from_slice(&[0x50, 0x4B, 0x03, 0x04]);
        zip.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        zip.extend_from_slice(&0u32.to_le_bytes()); // crc
        zip.extend_from_slice(&(body.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(body.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());
        zip.extend_from_slice(name);
        zip.extend_from_slice(body);
        let cdir_offset = zip.len() as u32;
        // central directory entry (46 fixed bytes + name)
        zip.extend_from_slice(&[0x50, 0x4B, 0x01, 0x02]);
        zip.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        zip.extend_from_slice(&0u32.to_le_bytes()); // crc
        zip.extend_from_slice(&(body.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(body.len() as u32).to_le_bytes());
        zip.extend_from_slice(&(name.len() as u16).to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes()); // extra len
        zip.extend_from_slice(&0u16.to_le_bytes()); // comment len
        zip.extend_from_slice(&0u16.to_le_bytes()); // disk start
        zip.extend_from_slice(&0u16.to_le_bytes()); // internal attrs
        zip.extend_from_slice(&0u32.to_le_bytes()); // external attrs
        zip.extend_from_slice(&0u32.to_le_bytes()); // local offset
        zip.extend_from_slice(name);
        let cdir_len = zip.len() as u32 - cdir_offset;
        // EOCD
        zip.extend_from_slice(&[0x50, 0x4B, 0x05, 0x06]);
        zip.extend_from_slice(&[0u8; 4]);
        zip.extend_from_slice(&1u16.to_le_bytes());
        zip.extend_from_slice(&1u16.to_le_bytes());
        zip.extend_from_slice(&cdir_len.to_le_bytes());
        zip.extend_from_slice(&cdir_offset.to_le_bytes());
        zip.extend_from_slice(&0u16.to_le_bytes());

        let entries = zip_entries(&zip).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "mimetype");
        let data = zip_entry_data(&zip, &entries[0]).unwrap();
        assert_eq!(data, body);
    }
}
