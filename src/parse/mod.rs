//! 模型输出解析与降级合成

pub mod fallback;
pub mod parser;

pub use fallback::FallbackSynthesizer;
pub use parser::{extract_json, ParseError, ParseFailure, StructuredResultParser, RAW_EXCERPT_CHARS};
