//! Text-analysis stages
//!
//! Language detection, Flesch-Kincaid readability, keyword extraction,
//! citation mining, table-of-contents extraction, and coordinate
//! normalization. All of these work from the extracted text alone.

use super::results::{put_f64, put_str8, put_str_list};
use super::{StageContext, StageOutcome, StageStatus};
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

/// Maximum keywords returned by the keywords stage
const MAX_KEYWORDS: usize = 20;

/// Maximum TOC entries retained
const MAX_TOC_ENTRIES: usize = 100;

// ---------------------------------------------------------------------------
// Language detection
// ---------------------------------------------------------------------------

/// Stopword inventories for the supported languages. Ratio-of-hits scoring:
/// cheap, deterministic, and good enough to route downstream NLP.
static LANGUAGE_PROFILES: [(&str, &[&str]); 5] = [
    (
        "en",
        &["the", "and", "of", "to", "in", "is", "that", "for", "with", "are"],
    ),
    (
        "de",
        &["der", "die", "das", "und", "ist", "nicht", "mit", "ein", "von", "den"],
    ),
    (
        "fr",
        &["le", "la", "les", "et", "des", "est", "dans", "que", "pour", "une"],
    ),
    (
        "es",
        &["el", "la", "los", "las", "y", "es", "en", "que", "por", "una"],
    ),
    (
        "it",
        &["il", "la", "di", "che", "e", "un", "per", "sono", "con", "del"],
    ),
];

/// Payload: str8 language code, f64 confidence
pub fn language(text: &str) -> Result<Vec<u8>, String> {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return Err("no words".into());
    }

    let mut best = ("und", 0usize);
    for (code, stopwords) in LANGUAGE_PROFILES {
        let hits = words.iter().filter(|w| stopwords.contains(&w.as_str())).count();
        if hits > best.1 {
            best = (code, hits);
        }
    }
    let confidence = (best.1 as f64 / words.len() as f64).min(1.0);

    let mut out = Vec::new();
    put_str8(&mut out, best.0);
    put_f64(&mut out, confidence);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Readability
// ---------------------------------------------------------------------------

/// Flesch-Kincaid grade level with the standard coefficients.
/// Payload: f64 grade
pub fn readability(text: &str) -> Result<Vec<u8>, String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return Err("no words".into());
    }
    let sentences = text
        .chars()
        .filter(|c| matches!(c, '.' | '!' | '?'))
        .count()
        .max(1);
    let syllables: usize = words.iter().map(|w| syllable_count(w)).sum();

    let grade = 0.39 * (words.len() as f64 / sentences as f64)
        + 11.8 * (syllables as f64 / words.len() as f64)
        - 15.59;

    let mut out = Vec::new();
    put_f64(&mut out, grade);
    Ok(out)
}

/// Vowel-group syllable estimate; every word counts at least one
fn syllable_count(word: &str) -> usize {
    let mut count = 0;
    let mut prev_vowel = false;
    for c in word.to_lowercase().chars() {
        let vowel = matches!(c, 'a' | 'e' | 'i' | 'o' | 'u' | 'y');
        if vowel && !prev_vowel {
            count += 1;
        }
        prev_vowel = vowel;
    }
    count.max(1)
}

// ---------------------------------------------------------------------------
// Keywords
// ---------------------------------------------------------------------------

static STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "his", "has", "have", "this", "that", "with", "from", "they", "been",
    "were", "which", "their", "would", "there", "what", "about", "when", "into", "than", "then",
    "them", "these", "some", "will", "your", "more", "other", "over", "such", "only", "also",
];

/// Up to 20 tokens sorted by frequency descending, then lexicographic
/// ascending. Payload: u16 count + str16 list
pub fn keywords(text: &str) -> Result<Vec<u8>, String> {
    let mut freq: HashMap<String, u64> = HashMap::new();
    for raw in text.split_whitespace() {
        let token: String = raw
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if token.len() < 3 || STOPWORDS.contains(&token.as_str()) {
            continue;
        }
        *freq.entry(token).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, u64)> = freq.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top: Vec<String> = ranked
        .into_iter()
        .take(MAX_KEYWORDS)
        .map(|(w, _)| w)
        .collect();

    let mut out = Vec::new();
    put_str_list(&mut out, &top);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Citations
// ---------------------------------------------------------------------------

fn citation_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"10\.\d{4,9}/[-._;()/:A-Za-z0-9]+").unwrap(),
            Regex::new(r"arXiv:\d{4}\.\d{4,5}(v\d+)?").unwrap(),
            Regex::new(r"ISBN[- ]?(?:1[03])?:?\s?[0-9][0-9Xx -]{8,16}[0-9Xx]").unwrap(),
        ]
    })
}

/// DOI, arXiv, and ISBN references found in the text, de-duplicated in order
/// of first appearance. Payload: u16 count + str16 list
pub fn citations(text: &str) -> Result<Vec<u8>, String> {
    let mut found = Vec::new();
    for pattern in citation_patterns() {
        for m in pattern.find_iter(text) {
            let hit = m.as_str().trim_end_matches(['.', ',', ';']).to_string();
            if !found.contains(&hit) {
                found.push(hit);
            }
        }
    }
    let mut out = Vec::new();
    put_str_list(&mut out, &found);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Table of contents
// ---------------------------------------------------------------------------

fn heading_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*\d+(\.\d+)*[.)]?\s+\S").unwrap())
}

/// Heading-like lines: numbered sections, or short all-caps lines.
/// Payload: u16 count + str16 list
pub fn toc(text: &str) -> Result<Vec<u8>, String> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.len() > 120 {
            continue;
        }
        let numbered = heading_pattern().is_match(trimmed);
        let caps = trimmed.len() >= 4
            && trimmed.chars().any(|c| c.is_alphabetic())
            && trimmed
                .chars()
                .filter(|c| c.is_alphabetic())
                .all(|c| c.is_uppercase());
        if numbered || caps {
            entries.push(trimmed.to_string());
            if entries.len() >= MAX_TOC_ENTRIES {
                break;
            }
        }
    }
    let mut out = Vec::new();
    put_str_list(&mut out, &entries);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Coordinates
// ---------------------------------------------------------------------------

fn decimal_pair_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(-?\d{1,2}\.\d{3,8})\s*[,;]\s*(-?\d{1,3}\.\d{3,8})").unwrap()
    })
}

fn dms_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(\d{1,3})°\s*(\d{1,2})[′']\s*(\d{1,2}(?:\.\d+)?)?[″"]?\s*([NSEW])"#).unwrap()
    })
}

/// Latitude/longitude mentions normalized to WGS84 decimal degrees.
///
/// Runs for geospatial rasters (from metadata) and for any document whose
/// text mentions coordinates. Payload: u16 count, then per point f64 lat,
/// f64 lon.
pub fn coordinates(ctx: &StageContext<'_>) -> StageOutcome {
    let text = ctx
        .extraction
        .map(|e| {
            let mut t = e.text.clone();
            for (k, v) in &e.metadata {
                t.push(' ');
                t.push_str(k);
                t.push('=');
                t.push_str(v);
            }
            t
        })
        .unwrap_or_default();
    if text.is_empty() && ctx.kind != crate::abi::ContentKind::Geospatial {
        return StageOutcome::DependencyUnmet;
    }

    let mut points: Vec<(f64, f64)> = Vec::new();
    for cap in decimal_pair_pattern().captures_iter(&text) {
        let lat: f64 = cap[1].parse().unwrap_or(f64::NAN);
        let lon: f64 = cap[2].parse().unwrap_or(f64::NAN);
        if lat.abs() <= 90.0 && lon.abs() <= 180.0 && lat.is_finite() && lon.is_finite() {
            points.push((lat, lon));
        }
    }

    // DMS values pair up in reading order: N/S fixes a latitude, E/W a longitude
    let mut pending_lat: Option<f64> = None;
    for cap in dms_pattern().captures_iter(&text) {
        let degrees: f64 = cap[1].parse().unwrap_or(0.0);
        let minutes: f64 = cap[2].parse().unwrap_or(0.0);
        let seconds: f64 = cap.get(3).map_or(0.0, |s| s.as_str().parse().unwrap_or(0.0));
        let value = degrees + minutes / 60.0 + seconds / 3600.0;
        match &cap[4] {
            "N" => pending_lat = Some(value),
            "S" => pending_lat = Some(-value),
            hemi => {
                if let Some(lat) = pending_lat.take() {
                    let lon = if hemi == "W" { -value } else { value };
                    if lat.abs() <= 90.0 && lon.abs() <= 180.0 {
                        points.push((lat, lon));
                    }
                }
            }
        }
    }

    let mut out = Vec::new();
    out.extend_from_slice(&(points.len().min(u16::MAX as usize) as u16).to_le_bytes());
    for (lat, lon) in points.iter().take(u16::MAX as usize) {
        put_f64(&mut out, *lat);
        put_f64(&mut out, *lon);
    }
    StageOutcome::Field(StageStatus::Ok, out)
}
