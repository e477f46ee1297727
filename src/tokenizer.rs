use std::path::Path;

use thiserror::Error;
use tracing::instrument;

/// Canary string round-tripped through both tokenizers of a speculative
/// pair to check that they agree.
const TOKENIZER_CANARY: &str = "Could you please tell me something about continuous batching?";

/// `Tokenizer` - Deterministic text/token-id conversion plus the special
/// token ids the engine needs for stopping decisions.
///
/// Thin wrapper over the `tokenizers` crate; the engine itself only ever
/// calls `encode`, `decode` and the special-id getters.
pub struct Tokenizer {
    /// The wrapped tokenizer
    tokenizer: tokenizers::Tokenizer,
    /// End-of-sequence token id
    eos_token_id: Option<u32>,
    /// Beginning-of-sequence token id
    bos_token_id: Option<u32>,
    /// Padding token id
    pad_token_id: Option<u32>,
}

impl Tokenizer {
    /// Constructor
    pub fn new(
        tokenizer: tokenizers::Tokenizer,
        eos_token_id: Option<u32>,
        bos_token_id: Option<u32>,
        pad_token_id: Option<u32>,
    ) -> Self {
        Self {
            tokenizer,
            eos_token_id,
            bos_token_id,
            pad_token_id,
        }
    }

    /// Loads a tokenizer from a `tokenizer.json` file.
    ///
    /// A missing or malformed file is an explicit construction error;
    /// there is no fallback tokenizer.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        eos_token_id: Option<u32>,
        bos_token_id: Option<u32>,
        pad_token_id: Option<u32>,
    ) -> Result<Self, TokenizerError> {
        let tokenizer = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| TokenizerError::LoadError(e.to_string()))?;
        Ok(Self::new(tokenizer, eos_token_id, bos_token_id, pad_token_id))
    }

    /// Encodes a string into token ids.
    #[instrument(skip_all)]
    pub fn encode(&self, input: &str) -> Result<Vec<u32>, TokenizerError> {
        let encoding = self
            .tokenizer
            .encode(input, true)
            .map_err(|e| TokenizerError::EncodeError(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decodes token ids back into a string.
    #[instrument(skip_all)]
    pub fn decode(&self, token_ids: &[u32]) -> Result<String, TokenizerError> {
        self.tokenizer
            .decode(token_ids, true)
            .map_err(|e| TokenizerError::DecodeError(e.to_string()))
    }

    /// Getter for `eos_token_id`
    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    /// Getter for `bos_token_id`
    pub fn bos_token_id(&self) -> Option<u32> {
        self.bos_token_id
    }

    /// Getter for `pad_token_id`
    pub fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }
}

/// Checks that two tokenizers agree, by round-tripping a canary string and
/// comparing the encoded shapes and the special token ids.
///
/// The speculative coordinator refuses construction when the main and the
/// draft model disagree here: accepted draft tokens would otherwise mean
/// different text on each side.
pub fn are_tokenizers_equal(lhs: &Tokenizer, rhs: &Tokenizer) -> Result<bool, TokenizerError> {
    let encoded_lhs = lhs.encode(TOKENIZER_CANARY)?;
    let encoded_rhs = rhs.encode(TOKENIZER_CANARY)?;
    Ok(encoded_lhs.len() == encoded_rhs.len()
        && lhs.eos_token_id() == rhs.eos_token_id()
        && lhs.bos_token_id() == rhs.bos_token_id()
        && lhs.pad_token_id() == rhs.pad_token_id())
}

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("Failed to load tokenizer: `{0}`")]
    LoadError(String),
    #[error("Failed to encode input: `{0}`")]
    EncodeError(String),
    #[error("Failed to decode token ids: `{0}`")]
    DecodeError(String),
}
