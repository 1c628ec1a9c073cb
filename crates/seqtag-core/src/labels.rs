//! # Tag Sets for Span Tagging
//!
//! Builds the label inventory from declared entity types under the BIOUL
//! (or plain BIO) encoding, and encodes which label transitions are legal.
//! The START and END pseudo-labels occupy the two indices after the real
//! labels in every transition matrix.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Tagging scheme declared by `model.tagging_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaggingScheme {
    #[serde(rename = "BIO")]
    Bio,
    #[serde(rename = "BIOUL")]
    Bioul,
}

impl TaggingScheme {
    /// Prefixes contributed by every entity type, in label order.
    pub fn entity_prefixes(self) -> &'static [TagPrefix] {
        match self {
            Self::Bio => &[TagPrefix::Begin, TagPrefix::Inside],
            Self::Bioul => &[
                TagPrefix::Begin,
                TagPrefix::Inside,
                TagPrefix::Last,
                TagPrefix::Unit,
            ],
        }
    }
}

impl FromStr for TaggingScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BIO" | "IOB2" => Ok(Self::Bio),
            "BIOUL" | "BILOU" | "IOBES" => Ok(Self::Bioul),
            other => Err(ConfigError::invalid(
                "model.tagging_type",
                format!("unsupported tagging scheme `{other}`"),
            )),
        }
    }
}

/// The positional part of a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TagPrefix {
    Begin,
    Inside,
    Outside,
    Last,
    Unit,
}

impl TagPrefix {
    pub fn as_char(self) -> char {
        match self {
            Self::Begin => 'B',
            Self::Inside => 'I',
            Self::Outside => 'O',
            Self::Last => 'L',
            Self::Unit => 'U',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'B' => Some(Self::Begin),
            'I' => Some(Self::Inside),
            'O' => Some(Self::Outside),
            'L' | 'E' => Some(Self::Last),
            'U' | 'S' => Some(Self::Unit),
            _ => None,
        }
    }

    /// Tags with this prefix close the current span (or never open one).
    fn closes_span(self) -> bool {
        matches!(self, Self::Outside | Self::Last | Self::Unit)
    }
}

/// A single tag such as `B-MATERIAL` or `O`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BioulTag {
    pub prefix: TagPrefix,
    pub entity: Option<String>,
}

impl BioulTag {
    pub fn outside() -> Self {
        Self {
            prefix: TagPrefix::Outside,
            entity: None,
        }
    }

    pub fn new(prefix: TagPrefix, entity: impl Into<String>) -> Self {
        Self {
            prefix,
            entity: Some(entity.into()),
        }
    }

    /// Parse `O`, `B-PER`, `U-MATERIAL`, ... (`E-`/`S-` accepted as `L-`/`U-`).
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw == "O" {
            return Some(Self::outside());
        }
        let (prefix, entity) = raw.split_once('-')?;
        let mut chars = prefix.chars();
        let prefix = TagPrefix::from_char(chars.next()?)?;
        if chars.next().is_some() || entity.is_empty() || prefix == TagPrefix::Outside {
            return None;
        }
        Some(Self::new(prefix, entity))
    }

    /// Check if the `from` → `to` transition is legal.
    ///
    /// A span opened by `B-T` can only continue with `I-T` or close with
    /// `L-T`; every other tag may be followed by `O`, `B-*` or `U-*`. For
    /// BIO tag sets (no `L`/`U` present) a span may also end implicitly.
    pub fn is_valid_transition(from: &BioulTag, to: &BioulTag, scheme: TaggingScheme) -> bool {
        match scheme {
            TaggingScheme::Bioul => match from.prefix {
                TagPrefix::Begin | TagPrefix::Inside => {
                    matches!(to.prefix, TagPrefix::Inside | TagPrefix::Last)
                        && from.entity == to.entity
                }
                _ => matches!(
                    to.prefix,
                    TagPrefix::Outside | TagPrefix::Begin | TagPrefix::Unit
                ),
            },
            TaggingScheme::Bio => match to.prefix {
                TagPrefix::Inside => {
                    matches!(from.prefix, TagPrefix::Begin | TagPrefix::Inside)
                        && from.entity == to.entity
                }
                _ => true,
            },
        }
    }

    fn can_start(&self, scheme: TaggingScheme) -> bool {
        match scheme {
            TaggingScheme::Bioul => matches!(
                self.prefix,
                TagPrefix::Outside | TagPrefix::Begin | TagPrefix::Unit
            ),
            TaggingScheme::Bio => self.prefix != TagPrefix::Inside,
        }
    }

    fn can_end(&self, scheme: TaggingScheme) -> bool {
        match scheme {
            TaggingScheme::Bioul => self.prefix.closes_span(),
            TaggingScheme::Bio => true,
        }
    }
}

impl fmt::Display for BioulTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            None => write!(f, "O"),
            Some(entity) => write!(f, "{}-{}", self.prefix.as_char(), entity),
        }
    }
}

/// A labelled span, `start` and `end` inclusive token positions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub entity: String,
    pub start: usize,
    pub end: usize,
}

/// The ordered label inventory of a tagger.
///
/// Index 0 is always `O`; each entity type then contributes its prefixes
/// in declaration order (`B, I, L, U` for BIOUL).
#[derive(Debug, Clone)]
pub struct LabelSet {
    scheme: TaggingScheme,
    entity_types: Vec<String>,
    tags: Vec<BioulTag>,
    index: HashMap<String, usize>,
}

impl LabelSet {
    pub fn new(scheme: TaggingScheme, entity_types: &[String]) -> Result<Self> {
        let mut tags = vec![BioulTag::outside()];
        for (i, entity) in entity_types.iter().enumerate() {
            let entity = entity.trim();
            if entity.is_empty() || entity.contains(char::is_whitespace) {
                return Err(ConfigError::invalid(
                    "dataset.column_names",
                    format!("entity type #{i} `{entity}` must be a non-empty word"),
                )
                .into());
            }
            if entity_types[..i].iter().any(|prev| prev.trim() == entity) {
                return Err(ConfigError::invalid(
                    "dataset.column_names",
                    format!("entity type `{entity}` declared twice"),
                )
                .into());
            }
            for &prefix in scheme.entity_prefixes() {
                tags.push(BioulTag::new(prefix, entity));
            }
        }

        let index = tags
            .iter()
            .enumerate()
            .map(|(i, tag)| (tag.to_string(), i))
            .collect();

        Ok(Self {
            scheme,
            entity_types: entity_types.iter().map(|e| e.trim().to_string()).collect(),
            tags,
            index,
        })
    }

    /// BIOUL label set: `4 * |types| + 1` labels.
    pub fn bioul(entity_types: &[String]) -> Result<Self> {
        Self::new(TaggingScheme::Bioul, entity_types)
    }

    pub fn scheme(&self) -> TaggingScheme {
        self.scheme
    }

    pub fn entity_types(&self) -> &[String] {
        &self.entity_types
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Index of the START pseudo-label in transition matrices.
    pub fn start_index(&self) -> usize {
        self.tags.len()
    }

    /// Index of the END pseudo-label in transition matrices.
    pub fn end_index(&self) -> usize {
        self.tags.len() + 1
    }

    pub fn index_of(&self, tag: &str) -> Option<usize> {
        self.index.get(tag.trim()).copied()
    }

    pub fn tag(&self, idx: usize) -> Option<&BioulTag> {
        self.tags.get(idx)
    }

    pub fn tags(&self) -> &[BioulTag] {
        &self.tags
    }

    /// Map tag strings to label ids, failing on tags outside the set.
    pub fn encode<S: AsRef<str>>(&self, tags: &[S]) -> Result<Vec<u32>> {
        tags.iter()
            .map(|tag| {
                self.index_of(tag.as_ref()).map(|i| i as u32).ok_or_else(|| {
                    ConfigError::invalid(
                        "dataset.column_names",
                        format!("tag `{}` is not part of the label set", tag.as_ref()),
                    )
                    .into()
                })
            })
            .collect()
    }

    pub fn decode(&self, ids: &[usize]) -> Vec<String> {
        ids.iter()
            .map(|&id| {
                self.tags
                    .get(id)
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "O".to_string())
            })
            .collect()
    }

    /// Legal transitions as an `(L + 2) x (L + 2)` matrix including START/END.
    pub fn allowed_transitions(&self) -> Vec<Vec<bool>> {
        let n = self.tags.len();
        let (start, end) = (self.start_index(), self.end_index());
        let mut allowed = vec![vec![false; n + 2]; n + 2];

        for (i, from) in self.tags.iter().enumerate() {
            for (j, to) in self.tags.iter().enumerate() {
                allowed[i][j] = BioulTag::is_valid_transition(from, to, self.scheme);
            }
            allowed[start][i] = from.can_start(self.scheme);
            allowed[i][end] = from.can_end(self.scheme);
        }

        allowed
    }

    /// Whether a complete label sequence obeys the scheme.
    pub fn is_valid_sequence(&self, ids: &[usize]) -> bool {
        let allowed = self.allowed_transitions();
        let mut prev = self.start_index();
        for &id in ids {
            if id >= self.len() || !allowed[prev][id] {
                return false;
            }
            prev = id;
        }
        allowed[prev][self.end_index()]
    }

    /// Extract typed spans from a label id sequence.
    ///
    /// Malformed fragments (an `I`/`L` without its opening tag) are dropped.
    pub fn spans(&self, ids: &[usize]) -> Vec<Span> {
        let mut spans = Vec::new();
        let mut open: Option<(String, usize)> = None;

        for (pos, tag) in ids.iter().map(|&id| self.tags.get(id)).enumerate() {
            let Some(tag) = tag else {
                open = None;
                continue;
            };
            let same_entity = |open: &Option<(String, usize)>| {
                open.as_ref().map(|(e, _)| Some(e)) == Some(tag.entity.as_ref())
            };

            match tag.prefix {
                TagPrefix::Outside => {
                    if self.scheme == TaggingScheme::Bio {
                        close_bio_span(&mut spans, &mut open, pos);
                    }
                    open = None;
                }
                TagPrefix::Begin => {
                    if self.scheme == TaggingScheme::Bio {
                        close_bio_span(&mut spans, &mut open, pos);
                    }
                    open = tag.entity.clone().map(|e| (e, pos));
                }
                TagPrefix::Inside => {
                    if !same_entity(&open) {
                        if self.scheme == TaggingScheme::Bio {
                            close_bio_span(&mut spans, &mut open, pos);
                        }
                        open = None;
                    }
                }
                TagPrefix::Last => {
                    if same_entity(&open) {
                        if let Some((entity, start)) = open.take() {
                            spans.push(Span {
                                entity,
                                start,
                                end: pos,
                            });
                        }
                    }
                    open = None;
                }
                TagPrefix::Unit => {
                    open = None;
                    if let Some(entity) = tag.entity.clone() {
                        spans.push(Span {
                            entity,
                            start: pos,
                            end: pos,
                        });
                    }
                }
            }
        }

        if self.scheme == TaggingScheme::Bio {
            close_bio_span(&mut spans, &mut open, ids.len());
        }
        spans
    }
}

fn close_bio_span(spans: &mut Vec<Span>, open: &mut Option<(String, usize)>, pos: usize) {
    if let Some((entity, start)) = open.take() {
        spans.push(Span {
            entity,
            start,
            end: pos - 1,
        });
    }
}

/// Convert a BIO (IOB2 or IOB1) tag sequence to BIOUL.
///
/// Tags that already carry `L`/`U` prefixes pass through unchanged, so
/// BIOUL input is a fixed point. Unparseable tags are returned as `O`.
pub fn bio_to_bioul<S: AsRef<str>>(tags: &[S]) -> Vec<String> {
    let parsed: Vec<BioulTag> = tags
        .iter()
        .map(|t| BioulTag::parse(t.as_ref()).unwrap_or_else(BioulTag::outside))
        .collect();

    parsed
        .iter()
        .enumerate()
        .map(|(i, tag)| {
            let Some(entity) = tag.entity.as_ref() else {
                return "O".to_string();
            };
            if matches!(tag.prefix, TagPrefix::Last | TagPrefix::Unit) {
                return tag.to_string();
            }

            let continues_prev = i > 0
                && parsed[i - 1].entity.as_ref() == Some(entity)
                && matches!(parsed[i - 1].prefix, TagPrefix::Begin | TagPrefix::Inside);
            let starts = tag.prefix == TagPrefix::Begin || !continues_prev;
            let continues = parsed.get(i + 1).is_some_and(|next| {
                next.entity.as_ref() == Some(entity)
                    && matches!(next.prefix, TagPrefix::Inside | TagPrefix::Last)
            });

            let prefix = match (starts, continues) {
                (true, true) => TagPrefix::Begin,
                (true, false) => TagPrefix::Unit,
                (false, true) => TagPrefix::Inside,
                (false, false) => TagPrefix::Last,
            };
            BioulTag::new(prefix, entity.clone()).to_string()
        })
        .collect()
}
