//! 输入文件解码：编码探测 + GB18030 兜底 + 最终有损解码。

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, GB18030, UTF_8};
use tracing::{debug, warn};

/// 逐块喂给探测器，模拟按行探测的增量行为。
const DETECT_FEED_CHUNK: usize = 8 * 1024;

pub fn detect_encoding(bytes: &[u8]) -> &'static Encoding {
    let mut detector = EncodingDetector::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let end = (offset + DETECT_FEED_CHUNK).min(bytes.len());
        let last = end == bytes.len();
        detector.feed(&bytes[offset..end], last);
        offset = end;
    }
    detector.guess(None, true)
}

/// 读入并解码小说文本。
///
/// 顺序：显式指定的编码 → 探测到的编码 → GB18030 → 有损解码。
pub fn decode_input_file(path: &Path, encoding_override: Option<&str>) -> Result<String> {
    let bytes = fs::read(path).with_context(|| format!("读取文件失败: {}", path.display()))?;
    Ok(decode_bytes(&bytes, encoding_override, path))
}

pub fn decode_bytes(bytes: &[u8], encoding_override: Option<&str>, origin: &Path) -> String {
    let primary: &'static Encoding = match encoding_override {
        Some(label) if !label.trim().is_empty() => {
            Encoding::for_label(label.trim().as_bytes()).unwrap_or_else(|| {
                warn!("未知编码 '{label}'，改用自动探测");
                detect_encoding(bytes)
            })
        }
        _ => detect_encoding(bytes),
    };
    debug!("文件 {} 编码: {}", origin.display(), primary.name());

    let (decoded, _, had_errors) = primary.decode(bytes);
    if !had_errors {
        return decoded.into_owned();
    }

    if primary != GB18030 {
        let (decoded, _, had_errors) = GB18030.decode(bytes);
        if !had_errors {
            warn!(
                "文件 {} 用 {} 解码失败，GB18030 兜底成功",
                origin.display(),
                primary.name()
            );
            return decoded.into_owned();
        }
    }

    warn!("文件 {} 无法无损解码，按替换字符处理", origin.display());
    let fallback = if primary == UTF_8 { GB18030 } else { primary };
    fallback.decode(bytes).0.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn utf8_roundtrip() {
        let text = "第一章 测试\n正文内容。";
        let out = decode_bytes(text.as_bytes(), None, &PathBuf::from("t.txt"));
        assert_eq!(out, text);
    }

    #[test]
    fn gb18030_fallback() {
        // 足够长的样本，避免探测器在短输入上摇摆
        let text = "第一章 修炼之路漫漫，少年负剑前行，山风猎猎。".repeat(50);
        let (encoded, _, _) = GB18030.encode(&text);
        let out = decode_bytes(&encoded, None, &PathBuf::from("t.txt"));
        assert!(out.contains("第一章"));
    }

    #[test]
    fn explicit_encoding_wins() {
        let (encoded, _, _) = GB18030.encode("中文");
        let out = decode_bytes(&encoded, Some("gb18030"), &PathBuf::from("t.txt"));
        assert_eq!(out, "中文");
    }
}
