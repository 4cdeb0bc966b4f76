//! Format extractors (spec §4.3). Every extractor produces the uniform four-column intermediate
//! table (`vocabulary_id, concept_code, gross, cash`) and never applies vocabulary filtering or
//! de-duplication — that is the normalizer's job.

pub mod csv_extractor;
pub mod json_extractor;
pub mod xlsx_extractor;
pub mod zip_extractor;

pub use csv_extractor::extract_csv;
pub use json_extractor::extract_json;
pub use xlsx_extractor::extract_xlsx;
pub use zip_extractor::extract_zip;
