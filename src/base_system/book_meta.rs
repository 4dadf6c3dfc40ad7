//! 书名/作者信息：规范文件名的生成与解析。
//!
//! 规范文件名：
//! `<英文书名> by <英文作者> (<罗马音作者>) - <原书名> by <原作者>.txt`

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

/// 已重命名文件的匹配规则。
pub fn canonical_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^.+ by .+ \(.+\) - .+ by .+\.txt$").unwrap())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleParts {
    pub english_title: String,
    pub english_author: String,
    pub original_title: String,
    pub original_author: String,
}

/// 从文件名里拆出双语书名/作者。
///
/// 未重命名的文件没有 ` - ` 分隔段，此时整个文件名视为原书名，
/// 英文侧回落为 "n.d."（not determined）。
pub fn split_bilingual_filename(path: &Path) -> TitleParts {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    // 去掉罗马音括号段，规范名中它跟在英文作者后面
    let stem = strip_roman_suffix(&stem);

    let mut english_title = "n.d.".to_string();
    let mut english_author = "n.d.".to_string();
    let original_part;

    if let Some((translated, original)) = stem.split_once(" - ") {
        if let Some((t, a)) = translated.split_once(" by ") {
            english_title = t.trim().to_string();
            english_author = a.trim().to_string();
        } else if !translated.trim().is_empty() {
            english_title = translated.trim().to_string();
        }
        original_part = original.to_string();
    } else {
        original_part = stem;
    }

    let (original_title, original_author) = match original_part.split_once(" by ") {
        Some((t, a)) => (t.trim().to_string(), a.trim().to_string()),
        None => (original_part.trim().to_string(), "n.d.".to_string()),
    };

    TitleParts {
        english_title,
        english_author,
        original_title,
        original_author,
    }
}

fn strip_roman_suffix(stem: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r" \([^)]*\)( - )").unwrap());
    re.replace(stem, "$1").to_string()
}
