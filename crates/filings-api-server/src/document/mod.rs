pub mod chunker;
pub mod extractor;

pub use chunker::TextChunker;
pub use extractor::{ExtractError, TextExtractor};
