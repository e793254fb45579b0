//! Extraction serialization
//!
//! Serializes one document's extraction into the CLI-selected format. The
//! same serializers produce both the per-document extraction file and the
//! single-line summary records appended to the shards.

use crate::abi::OutputFormat;
use crate::parser::Extraction;
use crate::Result;
use anyhow::Context;
use std::io::Write;
use std::path::Path;

/// Write the full extraction file for one document
pub fn write_extraction(
    output: &Path,
    format: OutputFormat,
    input: &Path,
    extraction: &Extraction,
    content_hash: &str,
    mime: &str,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output dir: {}", parent.display()))?;
    }
    let file = std::fs::File::create(output)
        .with_context(|| format!("Failed to create output file: {}", output.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    match format {
        OutputFormat::Scheme => write_scheme(&mut writer, input, extraction, content_hash, mime)?,
        OutputFormat::Json => write_json(&mut writer, input, extraction, content_hash, mime)?,
        OutputFormat::Csv => write_csv(&mut writer, input, extraction, content_hash, mime)?,
    }
    writer
        .flush()
        .with_context(|| format!("Failed to flush output file: {}", output.display()))?;
    Ok(())
}

/// One-line summary record for the shard streams, no trailing newline
pub fn summary_record(
    format: OutputFormat,
    input: &Path,
    extraction: &Extraction,
    content_hash: &str,
    mime: &str,
) -> String {
    match format {
        OutputFormat::Scheme => format!(
            "(doc (path {}) (sha256 \"{}\") (mime \"{}\") (words {}) (pages {}))",
            scheme_string(&input.display().to_string()),
            content_hash,
            mime,
            extraction.word_count(),
            extraction.page_count,
        ),
        OutputFormat::Json => serde_json::json!({
            "path": input.display().to_string(),
            "sha256": content_hash,
            "mime": mime,
            "words": extraction.word_count(),
            "pages": extraction.page_count,
        })
        .to_string(),
        OutputFormat::Csv => format!(
            "{},{},{},{},{}",
            csv_field(&input.display().to_string()),
            content_hash,
            mime,
            extraction.word_count(),
            extraction.page_count,
        ),
    }
}

/// Header row for csv shard files
pub fn csv_summary_header() -> &'static str {
    "path,sha256,mime,words,pages"
}

fn write_scheme<W: Write>(
    w: &mut W,
    input: &Path,
    e: &Extraction,
    hash: &str,
    mime: &str,
) -> Result<()> {
    writeln!(w, "(document")?;
    writeln!(w, "  (source {})", scheme_string(&input.display().to_string()))?;
    writeln!(w, "  (sha256 \"{}\")", hash)?;
    writeln!(w, "  (mime \"{}\")", mime)?;
    if let Some(ref t) = e.title {
        writeln!(w, "  (title {})", scheme_string(t))?;
    }
    if let Some(ref a) = e.author {
        writeln!(w, "  (author {})", scheme_string(a))?;
    }
    writeln!(w, "  (pages {})", e.page_count)?;
    writeln!(w, "  (words {})", e.word_count())?;
    if e.duration_sec > 0.0 {
        writeln!(w, "  (duration {})", e.duration_sec)?;
    }
    if !e.metadata.is_empty() {
        writeln!(w, "  (metadata")?;
        for (k, v) in &e.metadata {
            writeln!(w, "    ({} {})", k, scheme_string(v))?;
        }
        writeln!(w, "  )")?;
    }
    if !e.streams.is_empty() {
        writeln!(w, "  (streams")?;
        for s in &e.streams {
            writeln!(w, "    ({} {})", s.stream_type, scheme_string(&s.codec))?;
        }
        writeln!(w, "  )")?;
    }
    writeln!(w, "  (text {})", scheme_string(&e.text))?;
    writeln!(w, ")")?;
    Ok(())
}

fn write_json<W: Write>(
    w: &mut W,
    input: &Path,
    e: &Extraction,
    hash: &str,
    mime: &str,
) -> Result<()> {
    let value = serde_json::json!({
        "source": input.display().to_string(),
        "sha256": hash,
        "mime": mime,
        "title": e.title,
        "author": e.author,
        "pages": e.page_count,
        "words": e.word_count(),
        "chars": e.char_count(),
        "duration_sec": e.duration_sec,
        "metadata": e.metadata.iter().cloned().collect::<std::collections::BTreeMap<String, String>>(),
        "streams": e.streams,
        "text": e.text,
    });
    serde_json::to_writer_pretty(&mut *w, &value).context("Failed to serialize extraction")?;
    writeln!(w)?;
    Ok(())
}

fn write_csv<W: Write>(
    w: &mut W,
    input: &Path,
    e: &Extraction,
    hash: &str,
    mime: &str,
) -> Result<()> {
    writeln!(
        w,
        "source,sha256,mime,title,author,pages,words,duration_sec,text"
    )?;
    writeln!(
        w,
        "{},{},{},{},{},{},{},{},{}",
        csv_field(&input.display().to_string()),
        hash,
        mime,
        csv_field(e.title.as_deref().unwrap_or("")),
        csv_field(e.author.as_deref().unwrap_or("")),
        e.page_count,
        e.word_count(),
        e.duration_sec,
        csv_field(&e.text),
    )?;
    Ok(())
}

/// Quote a string for the S-expression output
fn scheme_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Quote a field for csv when it contains separators or quotes
fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}
