//! 文本处理：清洗、分片、编码探测。

pub mod chunker;
pub mod clean;
pub mod encoding;
