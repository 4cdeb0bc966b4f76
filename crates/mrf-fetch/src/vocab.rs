//! Vocabulary index (spec §3, §4.6, §6): a process-wide, read-only set of valid CPT4/HCPCS codes
//! loaded once from an OHDSI Athena-style gzipped TSV (`dim/CONCEPT.csv.gz`).

use flate2::read::GzDecoder;
use mrf_core::{Error, Result};
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

const RELEVANT_VOCABULARIES: [&str; 2] = ["CPT4", "HCPCS"];

#[derive(Debug, Clone)]
pub struct VocabularyIndex {
    codes: HashSet<String>,
}

impl VocabularyIndex {
    /// Loads the gzipped TSV at `path`, keeping only `concept_code` values whose `vocabulary_id`
    /// is CPT4 or HCPCS. Every worker process calls this independently on startup (spec §5's
    /// deliberate memory-isolation trade).
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| Error::Io(e.to_string()))?;
        let mut decoder = GzDecoder::new(file);
        let mut contents = String::new();
        decoder
            .read_to_string(&mut contents)
            .map_err(|e| Error::Io(format!("failed to decompress {}: {e}", path.display())))?;
        Self::from_tsv(&contents)
    }

    fn from_tsv(contents: &str) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_reader(contents.as_bytes());

        let headers = reader
            .headers()
            .map_err(|e| Error::ParserError(e.to_string()))?
            .clone();
        let code_idx = headers
            .iter()
            .position(|h| h == "concept_code")
            .ok_or_else(|| Error::ParserError("missing concept_code column".to_string()))?;
        let vocab_idx = headers
            .iter()
            .position(|h| h == "vocabulary_id")
            .ok_or_else(|| Error::ParserError("missing vocabulary_id column".to_string()))?;

        let mut codes = HashSet::new();
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(_) => continue,
            };
            let Some(vocab) = record.get(vocab_idx) else {
                continue;
            };
            if !RELEVANT_VOCABULARIES.contains(&vocab) {
                continue;
            }
            if let Some(code) = record.get(code_idx) {
                codes.insert(code.to_string());
            }
        }
        Ok(Self { codes })
    }

    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn from_codes(codes: impl IntoIterator<Item = String>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }
}
