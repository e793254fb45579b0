//! Stage pipeline
//!
//! Given a parse result and a requested [`StageMask`], the pipeline iterates
//! the 20 stage slots in fixed bit order and invokes each enabled stage with
//! the parsed text/metadata and the source file bytes. Stage failures are
//! isolated: a failing stage contributes a zero-value field with a non-ok
//! status and later stages still run. Dependency-unmet stages clear their bit
//! in the executed mask; optional-backend stages whose adapter is absent emit
//! `not_available` instead.
//!
//! The pipeline holds no shared mutable state; everything it reads arrives in
//! the per-document [`StageContext`].

pub mod hash;
pub mod media;
pub mod results;
pub mod text;

pub use results::{StageRecord, StageStatus};

use crate::abi::{ContentKind, OutputFormat, ParseResult, Stage, StageMask};
use crate::parser::{Extraction, OptionalBackends};
use std::path::Path;

/// Everything a stage may read for one document
pub struct StageContext<'a> {
    pub parse: &'a ParseResult,
    pub extraction: Option<&'a Extraction>,
    /// Full source file bytes, for the image/hash stages
    pub data: &'a [u8],
    /// Authoritative content hash (64 hex)
    pub content_hash: &'a str,
    pub kind: ContentKind,
    pub optional: &'a OptionalBackends,
    /// Source document path, handed to the optional adapters
    pub source_path: &'a Path,
    /// Format the extraction file was written in
    pub output_format: OutputFormat,
}

impl<'a> StageContext<'a> {
    fn text(&self) -> &str {
        self.extraction.map(|e| e.text.as_str()).unwrap_or("")
    }

    fn has_text(&self) -> bool {
        self.parse.word_count > 0
    }
}

/// Outcome of one stage slot
pub enum StageOutcome {
    /// Dependency unmet: clear the bit, no field
    DependencyUnmet,
    /// Field with a status and (possibly empty) payload
    Field(StageStatus, Vec<u8>),
}

/// Run the requested stages over one document
///
/// The returned record's mask is always a subset of `requested`; cleared bits
/// correspond to stages skipped for dependency reasons.
pub fn run_pipeline(requested: StageMask, ctx: &StageContext<'_>) -> StageRecord {
    let mut record = StageRecord::new();
    for stage in requested.stages() {
        match run_stage(stage, ctx) {
            StageOutcome::DependencyUnmet => {}
            StageOutcome::Field(status, payload) => record.push(stage, status, payload),
        }
    }
    record
}

fn run_stage(stage: Stage, ctx: &StageContext<'_>) -> StageOutcome {
    // Dependency rules first: text stages need words, media stages need the
    // right kind, ML stages need the adapter.
    match stage {
        Stage::Language => text_stage(ctx, text::language),
        Stage::Readability => text_stage(ctx, text::readability),
        Stage::Keywords => text_stage(ctx, text::keywords),
        Stage::Citations => text_stage(ctx, text::citations),
        Stage::Toc => text_stage(ctx, text::toc),
        Stage::NearDedup => text_stage(ctx, |t| hash::near_dedup(t)),

        Stage::OcrConfidence => media::ocr_confidence(ctx),
        Stage::PerceptualHash => hash::perceptual_hash(ctx),
        Stage::Merkle => hash::merkle_root(ctx),
        Stage::ExactDedup => hash::exact_dedup(ctx),
        Stage::Coordinates => text::coordinates(ctx),
        Stage::Premis => media::premis(ctx),
        Stage::Subtitles => media::subtitles(ctx),
        Stage::FormatConvert => media::format_convert(ctx),

        Stage::MultilangOcr => media::multilang_ocr(ctx),
        Stage::Ner => media::ml_text_stage(ctx, "ner"),
        Stage::Whisper => media::whisper(ctx),
        Stage::ImageClassify => media::image_classify(ctx),
        Stage::LayoutAnalysis => media::layout_analysis(ctx),
        Stage::HandwritingOcr => media::handwriting_ocr(ctx),
    }
}

/// Shared gate for the pure text-analysis stages: they require `word_count > 0`
fn text_stage(
    ctx: &StageContext<'_>,
    run: impl Fn(&str) -> Result<Vec<u8>, String>,
) -> StageOutcome {
    if !ctx.has_text() {
        return StageOutcome::DependencyUnmet;
    }
    match run(ctx.text()) {
        Ok(payload) => StageOutcome::Field(StageStatus::Ok, payload),
        Err(_) => StageOutcome::Field(StageStatus::Failed, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{ParseStatus, StageMask};
    use crate::parser::Extraction;

    fn sample_extraction(t: &str) -> Extraction {
        Extraction {
            text: t.to_string(),
            ..Default::default()
        }
    }

    fn sample_parse(extraction: &Extraction) -> ParseResult {
        let mut p = ParseResult::new(ParseStatus::Ok, ContentKind::Pdf);
        p.word_count = extraction.word_count();
        p.char_count = extraction.char_count();
        p.set_sha256(&"ab".repeat(32));
        p.set_mime_type("application/pdf");
        p
    }

    #[test]
    fn executed_mask_is_subset_of_requested() {
        let extraction = sample_extraction("The archive holds many documents. They are old.");
        let parse = sample_parse(&extraction);
        let optional = OptionalBackends::absent();
        let ctx = StageContext {
            parse: &parse,
            extraction: Some(&extraction),
            data: b"%PDF-1.4 irrelevant",
            content_hash: &"ab".repeat(32),
            kind: ContentKind::Pdf,
            optional: &optional,
            source_path: Path::new("/data/doc.pdf"),
            output_format: OutputFormat::Json,
        };
        let record = run_pipeline(StageMask::ALL, &ctx);
        assert!(record.executed_mask().is_subset_of(StageMask::ALL));
        // Image-only stages were dependency-cleared for a pdf
        assert!(record.field(Stage::PerceptualHash).is_none());
        // Text stages ran
        assert!(record.field(Stage::Language).is_some());
        assert_eq!(record.field(Stage::Merkle).unwrap().status, StageStatus::Ok);
    }

    #[test]
    fn fast_preset_on_text_document_runs_all_fast_bits() {
        let extraction = sample_extraction(
            "Researchers archive documents. Documents describe findings. See 10.1234/abcd.5678 for details.",
        );
        let parse = sample_parse(&extraction);
        let optional = OptionalBackends::absent();
        let ctx = StageContext {
            parse: &parse,
            extraction: Some(&extraction),
            data: b"%PDF-1.4 body",
            content_hash: &"ab".repeat(32),
            kind: ContentKind::Pdf,
            optional: &optional,
            source_path: Path::new("/data/doc.pdf"),
            output_format: OutputFormat::Json,
        };
        let record = run_pipeline(StageMask::FAST, &ctx);
        assert_eq!(record.executed_mask(), StageMask::FAST);
        for field in record.fields() {
            assert_eq!(field.status, StageStatus::Ok, "stage {:?}", field.stage);
        }
    }

    #[test]
    fn textless_document_clears_text_bits() {
        let extraction = sample_extraction("");
        let mut parse = sample_parse(&extraction);
        parse.word_count = 0;
        let optional = OptionalBackends::absent();
        let ctx = StageContext {
            parse: &parse,
            extraction: Some(&extraction),
            data: &[0x89, b'H', b'D', b'F'],
            content_hash: &"cd".repeat(32),
            kind: ContentKind::Geospatial,
            optional: &optional,
            source_path: Path::new("/data/raster.grib"),
            output_format: OutputFormat::Json,
        };
        let record = run_pipeline(StageMask::FAST, &ctx);
        assert!(record.field(Stage::Language).is_none());
        assert!(record.field(Stage::Keywords).is_none());
        // Byte-level stages still run
        assert!(record.field(Stage::Merkle).is_some());
        assert!(record.field(Stage::ExactDedup).is_some());
        assert!(record.field(Stage::Premis).is_some());
    }

    #[test]
    fn ml_stages_report_not_available_without_adapter() {
        let extraction = sample_extraction("words exist here");
        let parse = sample_parse(&extraction);
        let optional = OptionalBackends::absent();
        let ctx = StageContext {
            parse: &parse,
            extraction: Some(&extraction),
            data: b"%PDF-1.4",
            content_hash: &"ab".repeat(32),
            kind: ContentKind::Pdf,
            optional: &optional,
            source_path: Path::new("/data/doc.pdf"),
            output_format: OutputFormat::Json,
        };
        let record = run_pipeline(StageMask(Stage::Ner.bit() | Stage::LayoutAnalysis.bit()), &ctx);
        assert_eq!(
            record.field(Stage::Ner).unwrap().status,
            StageStatus::NotAvailable
        );
        assert_eq!(
            record.field(Stage::LayoutAnalysis).unwrap().status,
            StageStatus::NotAvailable
        );
    }
}
