//! Vocabulary encoder
//!
//! Flattens a tokenizer's piece table into the ordered entry list the native
//! runtime ingests one call at a time.

use crate::byte_level::ByteLevelCodec;
use crate::error::{Error, Result};
use crate::tokenizer::{PieceEncoding, TokenizerSource, Vocabulary};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Score of a piece that appears in no merge
pub const UNMERGED_SCORE: f32 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabEntry {
    pub bytes: Vec<u8>,
    pub id: u32,
    pub score: f32,
}

/// Encode every piece of `source`, in source insertion order.
///
/// Scores come from the piece table when it carries them, otherwise from
/// the merge rank (`-rank`, unmerged pieces score `1.0`). Byte-level pieces
/// are decoded to their true bytes.
pub fn encode_vocabulary(source: &TokenizerSource) -> Result<Vec<VocabEntry>> {
    let caps = source.capabilities();
    if !caps.has_scores && !caps.has_merges && caps.piece_encoding == PieceEncoding::Text {
        return Err(Error::AmbiguousEncoding(
            "tokenizer has no scores, no merges and text pieces".into(),
        ));
    }

    let ranks: HashMap<&[u8], usize> = match &source.merges {
        Some(merges) => {
            let mut ranks = HashMap::with_capacity(merges.len());
            for (rank, merged) in merges.iter().enumerate() {
                ranks.entry(merged).or_insert(rank);
            }
            ranks
        }
        None => HashMap::new(),
    };
    let codec = match caps.piece_encoding {
        PieceEncoding::ByteLevel => Some(ByteLevelCodec::new()),
        _ => None,
    };

    let mut seen = HashSet::with_capacity(source.vocab.len());
    let mut entries = Vec::with_capacity(source.vocab.len());
    let mut push = |piece: &[u8], id: u32, score: f32| -> Result<()> {
        if !seen.insert(id) {
            return Err(Error::AmbiguousEncoding(format!(
                "token id {} is assigned to more than one piece",
                id
            )));
        }
        let bytes = match &codec {
            Some(codec) => codec.decode(&String::from_utf8_lossy(piece)),
            None => piece.to_vec(),
        };
        entries.push(VocabEntry { bytes, id, score });
        Ok(())
    };

    match &source.vocab {
        Vocabulary::Scored(pieces) => {
            for (piece, id, score) in pieces {
                push(piece, *id, *score)?;
            }
        }
        Vocabulary::Mapped(pieces) => {
            for (piece, id) in pieces {
                let score = ranks
                    .get(piece.as_slice())
                    .map(|&rank| -(rank as f32))
                    .unwrap_or(UNMERGED_SCORE);
                push(piece, *id, score)?;
            }
        }
    }

    log::debug!("Encoded {} vocabulary entries ({:?})", entries.len(), caps.piece_encoding);
    Ok(entries)
}
