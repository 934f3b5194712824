use std::path::Path;

use tokenizers::Tokenizer;

use crate::error::ServiceError;

/// Read-only façade over a `tokenizer.json` vocabulary.
pub struct TokenizerAdapter {
    inner: Tokenizer,
}

impl TokenizerAdapter {
    pub fn from_file(path: &Path) -> Result<Self, ServiceError> {
        if !path.is_file() {
            return Err(ServiceError::VocabularyNotFound(path.to_path_buf()));
        }
        let inner = Tokenizer::from_file(path).map_err(|e| {
            ServiceError::Tokenizer(format!("cannot load {}: {e}", path.display()))
        })?;
        Ok(Self { inner })
    }

    pub fn from_inner(inner: Tokenizer) -> Self {
        Self { inner }
    }

    /// Encodes `text` without injecting any special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>, ServiceError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decodes `ids`, dropping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
        self.inner
            .decode(ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    pub fn special_token(&self, name: &str) -> Result<u32, ServiceError> {
        self.inner.token_to_id(name).ok_or_else(|| {
            ServiceError::Tokenizer(format!("special token {name:?} is not in the vocabulary"))
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> TokenizerAdapter {
        let json = include_str!("../tests/fixtures/tokenizer.json");
        TokenizerAdapter::from_inner(json.parse().unwrap())
    }

    #[test]
    fn ascii_round_trip() {
        let tokenizer = fixture();
        for text in ["hello world", "rust is fast", "the model writes a story"] {
            let ids = tokenizer.encode(text).unwrap();
            assert!(!ids.is_empty());
            assert_eq!(tokenizer.decode(&ids).unwrap(), text);
        }
    }

    #[test]
    fn encode_adds_no_special_tokens() {
        let tokenizer = fixture();
        let bos = tokenizer.special_token("<s>").unwrap();
        let eos = tokenizer.special_token("</s>").unwrap();
        let ids = tokenizer.encode("你好").unwrap();
        assert_eq!(ids.len(), 1);
        assert!(!ids.contains(&bos) && !ids.contains(&eos));
    }

    #[test]
    fn decode_skips_special_tokens() {
        let tokenizer = fixture();
        let bos = tokenizer.special_token("<s>").unwrap();
        let mut ids = tokenizer.encode("hello").unwrap();
        ids.push(bos);
        ids.extend(tokenizer.encode("world").unwrap());
        assert_eq!(tokenizer.decode(&ids).unwrap(), "hello world");
    }

    #[test]
    fn unknown_special_token_is_an_error() {
        let err = fixture().special_token("<bos>").unwrap_err();
        assert!(matches!(err, ServiceError::Tokenizer(_)));
    }

    #[test]
    fn missing_vocabulary_file() {
        let err = TokenizerAdapter::from_file(Path::new("no/such/tokenizer.json"))
            .err()
            .unwrap();
        assert!(matches!(err, ServiceError::VocabularyNotFound(_)));
    }
}
