//! Special-token table
//!
//! Special tokens cross the boundary as one concatenated byte string plus
//! parallel arrays of byte lengths and ids.

use crate::config::TemplateStrings;
use crate::error::{Error, Result};
use crate::tokenizer::SpecialTokens;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokenSet {
    pub text: Vec<u8>,
    pub lengths: Vec<u32>,
    pub ids: Vec<u32>,
}

impl SpecialTokenSet {
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S], ids: &[u32]) -> Result<Self> {
        if tokens.len() != ids.len() {
            return Err(Error::ShapeMismatch(format!(
                "{} special tokens but {} ids",
                tokens.len(),
                ids.len()
            )));
        }
        let mut text = Vec::new();
        let mut lengths = Vec::with_capacity(tokens.len());
        for token in tokens {
            let bytes = token.as_ref().as_bytes();
            let len = u32::try_from(bytes.len()).map_err(|_| {
                Error::InvalidArgument(format!("special token of {} bytes", bytes.len()))
            })?;
            lengths.push(len);
            text.extend_from_slice(bytes);
        }
        Ok(Self { text, lengths, ids: ids.to_vec() })
    }

    pub fn from_special(special: &SpecialTokens) -> Result<Self> {
        Self::from_tokens(&special.tokens, &special.ids)
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Cut `text` by successive lengths
    pub fn split(&self) -> Result<Vec<&[u8]>> {
        let mut out = Vec::with_capacity(self.lengths.len());
        let mut rest = self.text.as_slice();
        for &len in &self.lengths {
            let len = len as usize;
            if len > rest.len() {
                return Err(Error::ShapeMismatch(format!(
                    "special token length {} overruns {} remaining bytes",
                    len,
                    rest.len()
                )));
            }
            let (head, tail) = rest.split_at(len);
            out.push(head);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(Error::ShapeMismatch(format!(
                "{} trailing bytes after special tokens",
                rest.len()
            )));
        }
        Ok(out)
    }
}

/// Whether the special-token list should be registered with the runtime.
///
/// True when the list is non-empty and either some special token appears
/// literally in a template string, or some special token is not one of the
/// canonical bos/eos/unk/pad tokens.
pub fn should_register(special: &SpecialTokens, templates: &TemplateStrings) -> bool {
    if special.is_empty() {
        return false;
    }
    let in_template = special
        .tokens
        .iter()
        .any(|token| templates.present().any(|template| template.contains(token.as_str())));
    if in_template {
        return true;
    }
    let canonical: Vec<&str> = special.canonical().collect();
    special.tokens.iter().any(|token| !canonical.contains(&token.as_str()))
}
