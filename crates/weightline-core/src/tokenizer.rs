//! Tokenizer source description
//!
//! A `TokenizerSource` is the converter's view of a tokenizer: its piece
//! table, an optional merge list, special tokens and normalizer flags. What
//! the tokenizer can provide is resolved once into `TokenizerCapabilities`
//! instead of being probed at each use.

use serde::{Deserialize, Serialize};

/// How vocabulary pieces are spelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceEncoding {
    /// Pieces are plain text (sentencepiece style)
    #[default]
    Text,
    /// Pieces use the byte-to-printable-character table
    ByteLevel,
    /// Pieces already are the raw bytes they stand for
    RawBytes,
}

/// Capability descriptor, resolved once per tokenizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerCapabilities {
    pub has_scores: bool,
    pub has_merges: bool,
    pub piece_encoding: PieceEncoding,
}

/// Piece table in source insertion order
#[derive(Debug, Clone, PartialEq)]
pub enum Vocabulary {
    /// (piece, id, score)
    Scored(Vec<(Vec<u8>, u32, f32)>),
    /// (piece, id)
    Mapped(Vec<(Vec<u8>, u32)>),
}

impl Vocabulary {
    pub fn len(&self) -> usize {
        match self {
            Vocabulary::Scored(v) => v.len(),
            Vocabulary::Mapped(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (piece, id) pairs in insertion order
    pub fn pieces(&self) -> Box<dyn Iterator<Item = (&[u8], u32)> + '_> {
        match self {
            Vocabulary::Scored(v) => Box::new(v.iter().map(|(p, id, _)| (p.as_slice(), *id))),
            Vocabulary::Mapped(v) => Box::new(v.iter().map(|(p, id)| (p.as_slice(), *id))),
        }
    }
}

/// BPE merges in rank order, stored as the merged piece
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeList(Vec<Vec<u8>>);

impl MergeList {
    pub fn from_pairs<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: AsRef<[u8]>,
        B: AsRef<[u8]>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(a, b)| [a.as_ref(), b.as_ref()].concat())
                .collect(),
        )
    }

    /// Parse `"a b"` merge lines
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(lines.into_iter().map(|l| l.as_ref().replace(' ', "").into_bytes()).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.0.iter().map(Vec::as_slice)
    }
}

/// Document-structural tokens of a tokenizer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    /// Every special token, in declaration order
    pub tokens: Vec<String>,
    /// Ids parallel to `tokens`
    pub ids: Vec<u32>,
    pub bos: Option<String>,
    pub eos: Option<String>,
    pub unk: Option<String>,
    pub pad: Option<String>,
}

impl SpecialTokens {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The bos/eos/unk/pad tokens that are set
    pub fn canonical(&self) -> impl Iterator<Item = &str> {
        [&self.bos, &self.eos, &self.unk, &self.pad].into_iter().filter_map(|t| t.as_deref())
    }

    /// Append a token unless it is already listed
    pub fn push(&mut self, token: impl Into<String>, id: u32) {
        let token = token.into();
        if !self.tokens.contains(&token) {
            self.tokens.push(token);
            self.ids.push(id);
        }
    }
}

/// Sentencepiece normalizer switches forwarded to the runtime
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizerFlags {
    pub add_dummy_prefix: bool,
    pub remove_extra_whitespaces: bool,
}

/// Everything the converter needs from a tokenizer
#[derive(Debug, Clone, PartialEq)]
pub struct TokenizerSource {
    pub vocab: Vocabulary,
    pub merges: Option<MergeList>,
    pub piece_encoding: PieceEncoding,
    pub special: SpecialTokens,
    pub normalizer: Option<NormalizerFlags>,
}

impl TokenizerSource {
    pub fn new(vocab: Vocabulary) -> Self {
        Self {
            vocab,
            merges: None,
            piece_encoding: PieceEncoding::default(),
            special: SpecialTokens::default(),
            normalizer: None,
        }
    }

    /// Score-bearing piece table
    pub fn scored<S: Into<Vec<u8>>>(pieces: impl IntoIterator<Item = (S, u32, f32)>) -> Self {
        Self::new(Vocabulary::Scored(
            pieces.into_iter().map(|(p, id, s)| (p.into(), id, s)).collect(),
        ))
    }

    /// Plain piece-to-id mapping
    pub fn mapped<S: Into<Vec<u8>>>(pieces: impl IntoIterator<Item = (S, u32)>) -> Self {
        Self::new(Vocabulary::Mapped(pieces.into_iter().map(|(p, id)| (p.into(), id)).collect()))
    }

    pub fn with_merges(mut self, merges: MergeList) -> Self {
        self.merges = Some(merges);
        self
    }

    pub fn with_piece_encoding(mut self, encoding: PieceEncoding) -> Self {
        self.piece_encoding = encoding;
        self
    }

    pub fn with_special_tokens(mut self, special: SpecialTokens) -> Self {
        self.special = special;
        self
    }

    pub fn with_normalizer(mut self, flags: NormalizerFlags) -> Self {
        self.normalizer = Some(flags);
        self
    }

    pub fn capabilities(&self) -> TokenizerCapabilities {
        TokenizerCapabilities {
            has_scores: matches!(self.vocab, Vocabulary::Scored(_)),
            has_merges: self.merges.is_some(),
            piece_encoding: self.piece_encoding,
        }
    }

    /// Id of a piece or special token spelled exactly as `token`
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.special
            .tokens
            .iter()
            .position(|t| t == token)
            .map(|i| self.special.ids[i])
            .or_else(|| {
                self.vocab.pieces().find(|(p, _)| *p == token.as_bytes()).map(|(_, id)| id)
            })
    }

    /// Replace every score with `score`, keeping insertion order
    pub fn set_uniform_score(&mut self, score: f32) {
        let pieces: Vec<(Vec<u8>, u32)> = match &mut self.vocab {
            Vocabulary::Scored(v) => std::mem::take(v).into_iter().map(|(p, id, _)| (p, id)).collect(),
            Vocabulary::Mapped(v) => std::mem::take(v),
        };
        self.vocab =
            Vocabulary::Scored(pieces.into_iter().map(|(p, id)| (p, id, score)).collect());
    }
}
