//! Byte-level piece codec
//!
//! Byte-level BPE tokenizers store every byte as a printable character so
//! that pieces are valid text. This module holds the standard 256-entry
//! table and maps pieces back to the bytes they stand for.

use std::collections::HashMap;

/// Bidirectional byte/character table
#[derive(Debug, Clone)]
pub struct ByteLevelCodec {
    encoder: [char; 256],
    decoder: HashMap<char, u8>,
}

impl Default for ByteLevelCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteLevelCodec {
    pub fn new() -> Self {
        let mut encoder = ['\0'; 256];
        let mut shifted = 0u32;
        for b in 0..=255u8 {
            let printable = matches!(b, b'!'..=b'~' | 0xA1..=0xAC | 0xAE..=0xFF);
            let code = if printable {
                b as u32
            } else {
                shifted += 1;
                255 + shifted
            };
            encoder[b as usize] = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
        }
        let decoder = encoder.iter().enumerate().map(|(b, &c)| (c, b as u8)).collect();
        Self { encoder, decoder }
    }

    /// Printable stand-in for one byte
    pub fn encode_byte(&self, byte: u8) -> char {
        self.encoder[byte as usize]
    }

    pub fn encode(&self, bytes: &[u8]) -> String {
        bytes.iter().map(|&b| self.encode_byte(b)).collect()
    }

    /// Bytes a piece stands for.
    ///
    /// Characters outside the table contribute their own UTF-8 encoding.
    pub fn decode(&self, piece: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(piece.len());
        for c in piece.chars() {
            match self.decoder.get(&c) {
                Some(&b) => out.push(b),
                None => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
            }
        }
        out
    }
}
