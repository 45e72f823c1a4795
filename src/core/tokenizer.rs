//! Marian tokenizers
//!
//! OPUS-MT repositories publish SentencePiece models (`source.spm`,
//! `target.spm`) plus a `vocab.json` mapping pieces to model ids. Models
//! converted for the `tokenizers` library ship JSON tokenizers instead.

use sentencepiece::SentencePieceProcessor;
use std::collections::HashMap;
use std::path::Path;
use tokenizers::Tokenizer;

use crate::core::errors::{Result, TranslationError};

const UNK: &str = "<unk>";
const SPECIAL_PIECES: [&str; 3] = ["</s>", UNK, "<pad>"];

fn tokenization_error(message: impl std::fmt::Display) -> TranslationError {
    TranslationError::Tokenization {
        message: message.to_string(),
    }
}

/// Piece <-> id mapping from a Marian `vocab.json`
#[derive(Debug, Clone)]
pub struct Vocab {
    ids: HashMap<String, u32>,
    pieces: HashMap<u32, String>,
    unk: u32,
}

impl Vocab {
    /// Parse a `vocab.json` object of `{piece: id}`
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let ids: HashMap<String, u32> = serde_json::from_slice(bytes)?;
        let unk = *ids
            .get(UNK)
            .ok_or_else(|| tokenization_error("vocabulary has no <unk> entry"))?;
        let pieces = ids.iter().map(|(piece, id)| (*id, piece.clone())).collect();
        Ok(Self { ids, pieces, unk })
    }

    /// Id of a piece, `<unk>` for pieces outside the vocabulary
    pub fn id(&self, piece: &str) -> u32 {
        self.ids.get(piece).copied().unwrap_or(self.unk)
    }

    /// Pieces for generated ids, leaving out special tokens
    pub fn pieces(&self, ids: &[u32]) -> Vec<&str> {
        ids.iter()
            .filter_map(|id| self.pieces.get(id))
            .map(String::as_str)
            .filter(|piece| !SPECIAL_PIECES.contains(piece))
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the vocabulary is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Split a leading target-language token such as `>>fra<<` off the text.
///
/// Multilingual target models select their output language this way; the
/// token is a single vocabulary entry and must not reach SentencePiece.
pub fn split_language_token(text: &str) -> (Option<&str>, &str) {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix(">>") {
        if let Some(end) = rest.find("<<") {
            let token_len = 2 + end + 2;
            return (Some(&trimmed[..token_len]), trimmed[token_len..].trim_start());
        }
    }
    (None, text)
}

/// Source and target tokenizers of one model
pub enum MarianTokenizer {
    /// SentencePiece models sharing one vocabulary
    SentencePiece {
        /// Splits source text into pieces
        source: SentencePieceProcessor,
        /// Joins target pieces back into text
        target: SentencePieceProcessor,
        /// Maps pieces to model ids
        vocab: Vocab,
    },
    /// `tokenizers` JSON files
    Json {
        /// Encoder-side tokenizer
        source: Tokenizer,
        /// Decoder-side tokenizer
        target: Tokenizer,
    },
}

impl MarianTokenizer {
    /// Load `source.spm`, `target.spm` and `vocab.json` style files
    pub fn sentencepiece(source: &Path, target: &Path, vocab: &Path) -> Result<Self> {
        let open = |path: &Path| {
            SentencePieceProcessor::open(path)
                .map_err(|e| tokenization_error(format!("failed to load {}: {}", path.display(), e)))
        };

        Ok(Self::SentencePiece {
            source: open(source)?,
            target: open(target)?,
            vocab: Vocab::from_json(&std::fs::read(vocab)?)?,
        })
    }

    /// Load `tokenizers` JSON files; `target` may be the same file as `source`
    pub fn json(source: &Path, target: &Path) -> Result<Self> {
        let load = |path: &Path| {
            Tokenizer::from_file(path)
                .map_err(|e| tokenization_error(format!("failed to load {}: {}", path.display(), e)))
        };

        let source_tokenizer = load(source)?;
        let target_tokenizer = if target == source {
            source_tokenizer.clone()
        } else {
            load(target)?
        };

        Ok(Self::Json {
            source: source_tokenizer,
            target: target_tokenizer,
        })
    }

    /// Source-side ids, without the EOS terminator
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        match self {
            Self::SentencePiece { source, vocab, .. } => {
                let (language, rest) = split_language_token(text);
                let mut ids: Vec<u32> = language.map(|token| vocab.id(token)).into_iter().collect();
                let pieces = source.encode(rest).map_err(tokenization_error)?;
                ids.extend(pieces.iter().map(|piece| vocab.id(&piece.piece)));
                Ok(ids)
            }
            Self::Json { source, .. } => {
                let encoding = source.encode(text, true).map_err(tokenization_error)?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    /// Text for generated ids, skipping special tokens
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        let text = match self {
            Self::SentencePiece { target, vocab, .. } => {
                let pieces = vocab.pieces(ids);
                target
                    .decode_pieces(pieces.as_slice())
                    .map_err(tokenization_error)?
            }
            Self::Json { target, .. } => target.decode(ids, true).map_err(tokenization_error)?,
        };
        Ok(text.trim().to_string())
    }
}
