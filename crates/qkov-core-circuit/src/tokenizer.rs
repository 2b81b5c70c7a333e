use log::warn;
use std::collections::HashMap;
use std::path::Path;

use crate::error::Result;

/// What the analysis needs from a tokenizer.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u32>;
    fn decode_tokens_bytes(&self, ids: &[u32]) -> Vec<Vec<u8>>;
    fn vocab_size(&self) -> usize;
}

/// Vocabulary-list tokenizer: greedy longest match over raw bytes.
///
/// Not a BPE implementation; it covers checkpoints that ship a flat token
/// list and single-token queries where the merge order does not matter.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    tokens: Vec<Vec<u8>>,
    lookup: HashMap<Vec<u8>, u32>,
    max_len: usize,
}

impl VocabTokenizer {
    pub fn new(tokens: Vec<String>) -> Self {
        let tokens: Vec<Vec<u8>> = tokens.into_iter().map(String::into_bytes).collect();
        let mut lookup = HashMap::with_capacity(tokens.len());
        for (id, t) in tokens.iter().enumerate() {
            // first id wins on duplicates
            lookup.entry(t.clone()).or_insert(id as u32);
        }
        let max_len = tokens.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            tokens,
            lookup,
            max_len,
        }
    }

    /// JSON array of token strings, index = token id.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let tokens: Vec<String> = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(Self::new(tokens))
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        let bytes = text.as_bytes();
        let mut ids = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let longest = (1..=self.max_len.min(bytes.len() - pos))
                .rev()
                .find_map(|len| self.lookup.get(&bytes[pos..pos + len]).map(|&id| (id, len)));
            match longest {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    warn!("no token covers byte 0x{:02x} at offset {}", bytes[pos], pos);
                    pos += 1;
                }
            }
        }
        ids
    }

    fn decode_tokens_bytes(&self, ids: &[u32]) -> Vec<Vec<u8>> {
        ids.iter()
            .map(|&id| match self.tokens.get(id as usize) {
                Some(t) => t.clone(),
                None => format!("<unk:{id}>").into_bytes(),
            })
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok() -> VocabTokenizer {
        VocabTokenizer::new(
            [" per", "fect", " perfect", "p", "e", "r", " ", "<|start|>"]
                .map(String::from)
                .to_vec(),
        )
    }

    #[test]
    fn test_longest_match_wins() {
        let t = tok();
        assert_eq!(t.encode(" perfect"), vec![2]);
        assert_eq!(t.encode(" perper"), vec![0, 3, 4, 5]);
    }

    #[test]
    fn test_unknown_bytes_skipped() {
        assert_eq!(tok().encode("x p"), vec![6, 3]);
    }

    #[test]
    fn test_decode() {
        let t = tok();
        assert_eq!(t.vocab_size(), 8);
        assert_eq!(
            t.decode_tokens_bytes(&[1, 99]),
            vec![b"fect".to_vec(), b"<unk:99>".to_vec()]
        );
    }
}
