//! Media, preservation, and optional-backend stages
//!
//! The OCR and ML stages are thin calls across the optional-adapter boundary:
//! when the corresponding dynamic library was not discovered at startup they
//! emit `not_available` without failing the document. PREMIS, subtitles, and
//! format-convert are always computable from the extraction.

use super::results::{put_str16, put_str8, put_str_list, StageStatus};
use super::{StageContext, StageOutcome};
use crate::abi::ContentKind;

/// PREMIS preservation event for the extraction itself.
/// Payload: str16 format designation, str16 agent, str8 event outcome.
pub fn premis(ctx: &StageContext<'_>) -> StageOutcome {
    let mut out = Vec::new();
    put_str16(&mut out, ctx.parse.mime_type());
    put_str16(
        &mut out,
        concat!("docex/", env!("CARGO_PKG_VERSION")),
    );
    put_str8(&mut out, "success");
    StageOutcome::Field(StageStatus::Ok, out)
}

/// Subtitle stream listing from the container parse.
/// Payload: u16 count + str16 "type/codec" descriptors.
pub fn subtitles(ctx: &StageContext<'_>) -> StageOutcome {
    if ctx.kind != ContentKind::Video {
        return StageOutcome::DependencyUnmet;
    }
    let streams: Vec<String> = ctx
        .extraction
        .map(|e| {
            e.streams
                .iter()
                .filter(|s| s.stream_type == "subtitle" || s.stream_type == "text")
                .map(|s| format!("{}/{}", s.stream_type, s.codec))
                .collect()
        })
        .unwrap_or_default();
    let mut out = Vec::new();
    put_str_list(&mut out, &streams);
    StageOutcome::Field(StageStatus::Ok, out)
}

/// Records the conversion the parse performed when writing the extraction
/// file. Payload: str8 target extension, u8 success flag.
pub fn format_convert(ctx: &StageContext<'_>) -> StageOutcome {
    let mut out = Vec::new();
    put_str8(&mut out, ctx.output_format.extension());
    out.push(1);
    StageOutcome::Field(StageStatus::Ok, out)
}

/// OCR confidence over an image or rasterizable PDF, via the GPU OCR adapter.
/// Payload: f64 confidence in 0..1.
pub fn ocr_confidence(ctx: &StageContext<'_>) -> StageOutcome {
    if !matches!(ctx.kind, ContentKind::Image | ContentKind::Pdf) {
        return StageOutcome::DependencyUnmet;
    }
    if !ctx.optional.gpu_ocr_available() {
        return StageOutcome::Field(StageStatus::NotAvailable, Vec::new());
    }
    match ctx
        .optional
        .gpu_ocr_infer("confidence", &ctx.source_path.display().to_string())
        .and_then(|lines| lines.first()?.parse::<f64>().ok())
    {
        Some(conf) => {
            let mut out = Vec::new();
            super::results::put_f64(&mut out, conf.clamp(0.0, 1.0));
            StageOutcome::Field(StageStatus::Ok, out)
        }
        None => StageOutcome::Field(StageStatus::Failed, Vec::new()),
    }
}

/// Multi-language OCR script detection via the GPU OCR adapter.
/// Payload: u16 count + str16 language codes.
pub fn multilang_ocr(ctx: &StageContext<'_>) -> StageOutcome {
    if !matches!(ctx.kind, ContentKind::Image | ContentKind::Pdf) {
        return StageOutcome::DependencyUnmet;
    }
    if !ctx.optional.gpu_ocr_available() {
        return StageOutcome::Field(StageStatus::NotAvailable, Vec::new());
    }
    list_field(
        ctx.optional
            .gpu_ocr_infer("languages", &ctx.source_path.display().to_string()),
    )
}

/// Handwriting OCR via the GPU OCR adapter. Payload: str16 recognized text.
pub fn handwriting_ocr(ctx: &StageContext<'_>) -> StageOutcome {
    if !matches!(ctx.kind, ContentKind::Image | ContentKind::Pdf) {
        return StageOutcome::DependencyUnmet;
    }
    if !ctx.optional.gpu_ocr_available() {
        return StageOutcome::Field(StageStatus::NotAvailable, Vec::new());
    }
    text_field(
        ctx.optional
            .gpu_ocr_infer("handwriting", &ctx.source_path.display().to_string()),
    )
}

/// Whisper transcription of the audio track via the ML adapter.
/// Payload: str16 transcript.
pub fn whisper(ctx: &StageContext<'_>) -> StageOutcome {
    if !matches!(ctx.kind, ContentKind::Audio | ContentKind::Video) {
        return StageOutcome::DependencyUnmet;
    }
    if !ctx.optional.ml_available() {
        return StageOutcome::Field(StageStatus::NotAvailable, Vec::new());
    }
    text_field(
        ctx.optional
            .ml_infer("whisper", &ctx.source_path.display().to_string()),
    )
}

/// Image classification labels via the ML adapter.
/// Payload: u16 count + str16 labels.
pub fn image_classify(ctx: &StageContext<'_>) -> StageOutcome {
    if ctx.kind != ContentKind::Image {
        return StageOutcome::DependencyUnmet;
    }
    if !ctx.optional.ml_available() {
        return StageOutcome::Field(StageStatus::NotAvailable, Vec::new());
    }
    list_field(
        ctx.optional
            .ml_infer("classify", &ctx.source_path.display().to_string()),
    )
}

/// Page layout analysis via the ML adapter.
/// Payload: u16 count + str16 region descriptors.
pub fn layout_analysis(ctx: &StageContext<'_>) -> StageOutcome {
    if !matches!(ctx.kind, ContentKind::Pdf | ContentKind::Image) {
        return StageOutcome::DependencyUnmet;
    }
    if !ctx.optional.ml_available() {
        return StageOutcome::Field(StageStatus::NotAvailable, Vec::new());
    }
    list_field(
        ctx.optional
            .ml_infer("layout", &ctx.source_path.display().to_string()),
    )
}

/// Text-input ML stages (named-entity recognition). Requires extracted text
/// and the ML adapter. Payload: u16 count + str16 items.
pub fn ml_text_stage(ctx: &StageContext<'_>, task: &str) -> StageOutcome {
    if ctx.parse.word_count == 0 {
        return StageOutcome::DependencyUnmet;
    }
    if !ctx.optional.ml_available() {
        return StageOutcome::Field(StageStatus::NotAvailable, Vec::new());
    }
    let text = ctx.extraction.map(|e| e.text.as_str()).unwrap_or("");
    list_field(ctx.optional.ml_infer(task, text))
}

fn list_field(lines: Option<Vec<String>>) -> StageOutcome {
    match lines {
        Some(items) => {
            let mut out = Vec::new();
            put_str_list(&mut out, &items);
            StageOutcome::Field(StageStatus::Ok, out)
        }
        None => StageOutcome::Field(StageStatus::Failed, Vec::new()),
    }
}

fn text_field(lines: Option<Vec<String>>) -> StageOutcome {
    match lines {
        Some(items) => {
            let mut out = Vec::new();
            put_str16(&mut out, &items.join("\n"));
            StageOutcome::Field(StageStatus::Ok, out)
        }
        None => StageOutcome::Field(StageStatus::Failed, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{OutputFormat, ParseResult, ParseStatus};
    use crate::parser::{Extraction, OptionalBackends, StreamDesc};
    use std::path::Path;

    fn ctx_for<'a>(
        parse: &'a ParseResult,
        extraction: Option<&'a Extraction>,
        kind: ContentKind,
        optional: &'a OptionalBackends,
    ) -> StageContext<'a> {
        StageContext {
            parse,
            extraction,
            data: b"bytes",
            content_hash: "ab",
            kind,
            optional,
            source_path: Path::new("/data/doc"),
            output_format: OutputFormat::Json,
        }
    }

    #[test]
    fn premis_carries_mime_and_agent() {
        let mut parse = ParseResult::new(ParseStatus::Ok, ContentKind::Pdf);
        parse.set_mime_type("application/pdf");
        let optional = OptionalBackends::absent();
        let ctx = ctx_for(&parse, None, ContentKind::Pdf, &optional);
        match premis(&ctx) {
            StageOutcome::Field(StageStatus::Ok, payload) => {
                let mut at = 0;
                let mime = crate::stages::results::get_str16(&payload, &mut at).unwrap();
                let agent = crate::stages::results::get_str16(&payload, &mut at).unwrap();
                assert_eq!(mime, "application/pdf");
                assert!(agent.starts_with("docex/"));
            }
            _ => panic!("premis should always produce a field"),
        }
    }

    #[test]
    fn subtitles_only_for_video() {
        let parse = ParseResult::new(ParseStatus::Ok, ContentKind::Audio);
        let optional = OptionalBackends::absent();
        let ctx = ctx_for(&parse, None, ContentKind::Audio, &optional);
        assert!(matches!(subtitles(&ctx), StageOutcome::DependencyUnmet));

        let extraction = Extraction {
            streams: vec![
                StreamDesc {
                    stream_type: "video".into(),
                    codec: "vide".into(),
                },
                StreamDesc {
                    stream_type: "subtitle".into(),
                    codec: "sbtl".into(),
                },
            ],
            ..Default::default()
        };
        let ctx = ctx_for(&parse, Some(&extraction), ContentKind::Video, &optional);
        match subtitles(&ctx) {
            StageOutcome::Field(StageStatus::Ok, payload) => {
                let mut at = 0;
                let list = crate::stages::results::get_str_list(&payload, &mut at).unwrap();
                assert_eq!(list, vec!["subtitle/sbtl"]);
            }
            _ => panic!("expected subtitle field"),
        }
    }

    #[test]
    fn ocr_confidence_unavailable_without_gpu() {
        let parse = ParseResult::new(ParseStatus::Ok, ContentKind::Image);
        let optional = OptionalBackends::absent();
        let ctx = ctx_for(&parse, None, ContentKind::Image, &optional);
        assert!(matches!(
            ocr_confidence(&ctx),
            StageOutcome::Field(StageStatus::NotAvailable, _)
        ));
        // Audio never qualifies regardless of adapters
        let ctx = ctx_for(&parse, None, ContentKind::Audio, &optional);
        assert!(matches!(ocr_confidence(&ctx), StageOutcome::DependencyUnmet));
    }

    #[test]
    fn format_convert_reports_target_extension() {
        let parse = ParseResult::new(ParseStatus::Ok, ContentKind::Pdf);
        let optional = OptionalBackends::absent();
        let ctx = ctx_for(&parse, None, ContentKind::Pdf, &optional);
        match format_convert(&ctx) {
            StageOutcome::Field(StageStatus::Ok, payload) => {
                let mut at = 0;
                assert_eq!(
                    crate::stages::results::get_str8(&payload, &mut at).unwrap(),
                    "json"
                );
                assert_eq!(payload[at], 1);
            }
            _ => panic!("expected format-convert field"),
        }
    }
}
