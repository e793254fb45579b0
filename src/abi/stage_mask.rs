//! Stage selection bitmask
//!
//! Bits 0..19 of a 64-bit mask select the analytical stages to run on a parsed
//! document. Stage extensibility is positional: adding a stage appends a new
//! bit, existing bits are never renumbered.

use std::fmt;
use std::str::FromStr;

/// One analytical stage slot
///
/// The discriminant is the bit position in [`StageMask`] and the positional
/// field ID in the stage-results record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Language = 0,
    Readability = 1,
    Keywords = 2,
    Citations = 3,
    OcrConfidence = 4,
    PerceptualHash = 5,
    Toc = 6,
    MultilangOcr = 7,
    Subtitles = 8,
    Premis = 9,
    Merkle = 10,
    ExactDedup = 11,
    NearDedup = 12,
    Coordinates = 13,
    Ner = 14,
    Whisper = 15,
    ImageClassify = 16,
    LayoutAnalysis = 17,
    HandwritingOcr = 18,
    FormatConvert = 19,
}

impl Stage {
    /// All stages in fixed pipeline order (bit order)
    pub const ALL: [Stage; 20] = [
        Stage::Language,
        Stage::Readability,
        Stage::Keywords,
        Stage::Citations,
        Stage::OcrConfidence,
        Stage::PerceptualHash,
        Stage::Toc,
        Stage::MultilangOcr,
        Stage::Subtitles,
        Stage::Premis,
        Stage::Merkle,
        Stage::ExactDedup,
        Stage::NearDedup,
        Stage::Coordinates,
        Stage::Ner,
        Stage::Whisper,
        Stage::ImageClassify,
        Stage::LayoutAnalysis,
        Stage::HandwritingOcr,
        Stage::FormatConvert,
    ];

    #[inline]
    pub fn bit(self) -> u64 {
        1u64 << (self as u8)
    }

    #[inline]
    pub fn field_id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Language => "language",
            Stage::Readability => "readability",
            Stage::Keywords => "keywords",
            Stage::Citations => "citations",
            Stage::OcrConfidence => "ocr-confidence",
            Stage::PerceptualHash => "perceptual-hash",
            Stage::Toc => "toc",
            Stage::MultilangOcr => "multilang-ocr",
            Stage::Subtitles => "subtitles",
            Stage::Premis => "premis",
            Stage::Merkle => "merkle",
            Stage::ExactDedup => "exact-dedup",
            Stage::NearDedup => "near-dedup",
            Stage::Coordinates => "coordinates",
            Stage::Ner => "ner",
            Stage::Whisper => "whisper",
            Stage::ImageClassify => "image-classify",
            Stage::LayoutAnalysis => "layout-analysis",
            Stage::HandwritingOcr => "handwriting-ocr",
            Stage::FormatConvert => "format-convert",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 64-bit stage selection bitfield
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StageMask(pub u64);

impl StageMask {
    /// No stages
    pub const NONE: StageMask = StageMask(0);

    /// `fast` preset: language, readability, keywords, citations, PREMIS,
    /// Merkle proof, exact dedup
    pub const FAST: StageMask = StageMask(
        (1 << 0) | (1 << 1) | (1 << 2) | (1 << 3) | (1 << 9) | (1 << 10) | (1 << 11),
    );

    /// `analysis` preset: `fast` plus OCR confidence, perceptual hash, TOC,
    /// subtitles, near dedup, coordinates
    pub const ANALYSIS: StageMask = StageMask(
        Self::FAST.0 | (1 << 4) | (1 << 5) | (1 << 6) | (1 << 8) | (1 << 12) | (1 << 13),
    );

    /// All 20 known stages
    pub const ALL: StageMask = StageMask((1 << 20) - 1);

    #[inline]
    pub fn contains(self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    #[inline]
    pub fn with(self, stage: Stage) -> Self {
        StageMask(self.0 | stage.bit())
    }

    #[inline]
    pub fn without(self, stage: Stage) -> Self {
        StageMask(self.0 & !stage.bit())
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True when every bit of `self` is also set in `other`
    pub fn is_subset_of(self, other: StageMask) -> bool {
        self.0 & !other.0 == 0
    }

    /// Stages selected by this mask, in fixed pipeline order
    pub fn stages(self) -> impl Iterator<Item = Stage> {
        Stage::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl FromStr for StageMask {
    type Err = anyhow::Error;

    /// Parse a named preset or an explicit mask (`0x...` hex or decimal)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(StageMask::NONE),
            "fast" => Ok(StageMask::FAST),
            "analysis" => Ok(StageMask::ANALYSIS),
            "all" => Ok(StageMask::ALL),
            other => {
                let raw = if let Some(hex) = other.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16)
                } else {
                    other.parse::<u64>()
                }
                .map_err(|_| anyhow::anyhow!("invalid stage mask: {}", other))?;
                if raw & !StageMask::ALL.0 != 0 {
                    anyhow::bail!("stage mask {:#x} sets bits above the known 20 stages", raw);
                }
                Ok(StageMask(raw))
            }
        }
    }
}

impl fmt::Display for StageMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#07x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_preset_bits() {
        let bits: Vec<u8> = StageMask::FAST.stages().map(|s| s.field_id()).collect();
        assert_eq!(bits, vec![0, 1, 2, 3, 9, 10, 11]);
    }

    #[test]
    fn analysis_is_superset_of_fast() {
        assert!(StageMask::FAST.is_subset_of(StageMask::ANALYSIS));
        assert!(StageMask::ANALYSIS.is_subset_of(StageMask::ALL));
        for s in [
            Stage::OcrConfidence,
            Stage::PerceptualHash,
            Stage::Toc,
            Stage::Subtitles,
            Stage::NearDedup,
            Stage::Coordinates,
        ] {
            assert!(StageMask::ANALYSIS.contains(s));
        }
        assert!(!StageMask::ANALYSIS.contains(Stage::Whisper));
    }

    #[test]
    fn all_covers_exactly_twenty_bits() {
        assert_eq!(StageMask::ALL.0, 0xF_FFFF);
        assert_eq!(StageMask::ALL.stages().count(), 20);
    }

    #[test]
    fn parse_presets_and_explicit_masks() {
        assert_eq!("fast".parse::<StageMask>().unwrap(), StageMask::FAST);
        assert_eq!("none".parse::<StageMask>().unwrap(), StageMask::NONE);
        assert_eq!("0xf".parse::<StageMask>().unwrap(), StageMask(0xf));
        assert_eq!("7".parse::<StageMask>().unwrap(), StageMask(7));
        assert!("0x100000".parse::<StageMask>().is_err());
        assert!("bogus".parse::<StageMask>().is_err());
    }

    #[test]
    fn stage_order_matches_bits() {
        for (i, s) in Stage::ALL.iter().enumerate() {
            assert_eq!(s.field_id() as usize, i);
            assert_eq!(s.bit(), 1u64 << i);
        }
    }
}
