//! 把中文长文本切成翻译分片（chunk）。
//!
//! 两种段落检测方式：
//! - `paragraph`：按空行（双换行）切段；
//! - `punctuation`：逐字符扫描中文标点，按句末标点 + 新段触发符切段。
//!
//! 分片在段落边界累积，单段超限时整段独立成片，绝不从段落中间切开。

use std::sync::OnceLock;

use regex::Regex;

use super::clean::{clean, clean_adverts, collapse_repeated_chars};

/// 句末标点。
const SENTENCE_ENDING: [char; 8] = ['。', '！', '？', '…', '.', ';', '；', '．'];
/// 右引号/右括号类，跟在句末标点后时一起收尾。
const CLOSING_QUOTES: [char; 4] = ['」', '”', '】', '》'];
/// 不触发断段的标点。
const NON_BREAKING: [char; 2] = ['，', '、'];
/// 段落分隔字符（各种换行与 Unicode 段分隔符）。
const PARAGRAPH_DELIMITERS: [char; 9] = [
    '\n', '\u{0b}', '\u{0c}', '\u{1c}', '\u{1d}', '\u{1e}', '\u{85}', '\u{2028}', '\u{2029}',
];
/// 出现在标点之后时意味着新段开始的字符。
const PARAGRAPH_START_TRIGGERS: [char; 5] = ['\n', '“', '【', '《', '「'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMethod {
    Paragraph,
    Punctuation,
}

impl SplitMethod {
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("punctuation") {
            SplitMethod::Punctuation
        } else {
            SplitMethod::Paragraph
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    Paragraphs,
    SplitPoints,
}

impl SplitMode {
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("SPLIT_POINTS") {
            SplitMode::SplitPoints
        } else {
            SplitMode::Paragraphs
        }
    }
}

/// 按空行切段。每段末尾补回 `\n\n` 以便无损拼接。
pub fn split_by_paragraphs(text: &str) -> Vec<String> {
    static PARA_BREAK: OnceLock<Regex> = OnceLock::new();
    let re = PARA_BREAK.get_or_init(|| Regex::new(r"\n\s*\n").unwrap());

    let text = clean_adverts(text);
    let text = clean(&text)
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .replace('\u{2029}', "\n\n")
        .replace('\u{2028}', "\n");

    let mut paragraphs = Vec::new();
    for raw in re.split(&text) {
        let para = raw.trim();
        if para.is_empty() {
            continue;
        }
        let mut para = collapse_spaces(para);
        para.push_str("\n\n");
        paragraphs.push(para);
    }
    paragraphs
}

/// 逐字符扫描标点切段（旧式排版的兜底方式）。
pub fn split_on_punctuation(text: &str) -> Vec<String> {
    let text = clean_adverts(text);
    let text = clean(&text).replace("\r\n", "\n").replace('\r', "\n");
    let text = collapse_spaces(&text);

    let mut repeat_set: Vec<char> = Vec::new();
    repeat_set.extend(SENTENCE_ENDING);
    repeat_set.extend(CLOSING_QUOTES);
    repeat_set.extend(NON_BREAKING);
    repeat_set.extend(PARAGRAPH_DELIMITERS);
    let text = collapse_repeated_chars(&text, &repeat_set);

    let chars: Vec<char> = text.chars().collect();
    let mut paragraphs = Vec::new();
    let mut buffer = String::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        let after_next = chars.get(i + 2).copied();

        if PARAGRAPH_DELIMITERS.contains(&ch) {
            buffer.push(ch);
            flush_paragraph(&mut buffer, &mut paragraphs);
            i += 1;
            continue;
        }

        if SENTENCE_ENDING.contains(&ch) {
            buffer.push(ch);
            if starts_new_paragraph(next, after_next) {
                flush_paragraph(&mut buffer, &mut paragraphs);
            }
            i += 1;
            continue;
        }

        if CLOSING_QUOTES.contains(&ch) {
            let follows_sentence_end = buffer
                .chars()
                .last()
                .map(|c| SENTENCE_ENDING.contains(&c))
                .unwrap_or(false);
            buffer.push(ch);
            if follows_sentence_end && starts_new_paragraph(next, after_next) {
                flush_paragraph(&mut buffer, &mut paragraphs);
            }
            i += 1;
            continue;
        }

        // 顿号/逗号以及普通字符都不断段
        buffer.push(ch);
        i += 1;
    }

    if !clean(&buffer).trim().is_empty() {
        let mut tail = collapse_spaces(clean(&buffer));
        tail.push_str("\n\n");
        paragraphs.push(tail);
    }

    paragraphs
}

fn starts_new_paragraph(next: Option<char>, after_next: Option<char>) -> bool {
    match next {
        Some(c) if PARAGRAPH_START_TRIGGERS.contains(&c) => true,
        Some(' ') => after_next
            .map(|c| PARAGRAPH_START_TRIGGERS.contains(&c))
            .unwrap_or(false),
        _ => false,
    }
}

fn flush_paragraph(buffer: &mut String, paragraphs: &mut Vec<String>) {
    let trimmed = clean(buffer).trim_matches(|c: char| PARAGRAPH_DELIMITERS.contains(&c));
    if !trimmed.trim().is_empty() {
        let mut para = collapse_spaces(trimmed);
        para.push_str("\n\n");
        paragraphs.push(para);
    }
    buffer.clear();
}

fn collapse_spaces(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r" +").unwrap());
    re.replace_all(text, " ").into_owned()
}

/// 把段落序列装进不超过 `max_chars` 字符的分片。
///
/// 单段超出预算时独立成片（绝不拆段）；空输入返回 `[""]`。
pub fn split_into_chunks(text: &str, max_chars: usize, method: SplitMethod) -> Vec<String> {
    let paragraphs = match method {
        SplitMethod::Punctuation => split_on_punctuation(text),
        SplitMethod::Paragraph => split_by_paragraphs(text),
    };

    if paragraphs.is_empty() || paragraphs.iter().all(|p| p.trim().is_empty()) {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut buffer = String::new();
    let mut buffer_chars = 0usize;

    for para in &paragraphs {
        let para_chars = para.chars().count();
        if buffer_chars + para_chars > max_chars && !buffer.is_empty() {
            chunks.push(std::mem::take(&mut buffer));
            buffer_chars = 0;
        }
        buffer.push_str(para);
        buffer_chars += para_chars;
    }

    if !buffer.is_empty() {
        chunks.push(buffer);
    }

    chunks
}

/// SPLIT_POINTS 模式：在章节标题行或字符预算处硬切。
pub fn split_at_chapter_points(text: &str, max_chars: usize) -> Vec<String> {
    static CHAPTER_LINE: OnceLock<Regex> = OnceLock::new();
    let re = CHAPTER_LINE.get_or_init(|| Regex::new(r"(?m)^第[0-9一二三四五六七八九十百千]+章").unwrap());

    let text = clean_adverts(text);
    if text.trim().is_empty() {
        return vec![String::new()];
    }

    // 候选切点：每个章节标题行的起始字节
    let mut cut_offsets: Vec<usize> = re.find_iter(&text).map(|m| m.start()).collect();
    cut_offsets.push(text.len());

    let mut chunks = Vec::new();
    let mut start = 0usize;
    for cut in cut_offsets {
        if cut <= start {
            continue;
        }
        let mut segment = &text[start..cut];
        // 段内仍超预算时按字符数硬切
        while segment.chars().count() > max_chars {
            let split_at = segment
                .char_indices()
                .nth(max_chars)
                .map(|(idx, _)| idx)
                .unwrap_or(segment.len());
            chunks.push(segment[..split_at].to_string());
            segment = &segment[split_at..];
        }
        if !segment.is_empty() {
            chunks.push(segment.to_string());
        }
        start = cut;
    }

    if chunks.is_empty() {
        vec![String::new()]
    } else {
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn para(n: usize, fill: char) -> String {
        // 48 个字符 + 段尾两个换行 = 存储长度 50
        let mut s: String = std::iter::repeat(fill).take(n).collect();
        s.push_str("\n\n");
        s
    }

    #[test]
    fn empty_input_yields_single_empty_chunk() {
        assert_eq!(
            split_into_chunks("", 11_999, SplitMethod::Paragraph),
            vec![String::new()]
        );
        assert_eq!(
            split_into_chunks("   \n\n  ", 11_999, SplitMethod::Paragraph),
            vec![String::new()]
        );
    }

    #[test]
    fn three_paragraphs_fill_two_chunks() {
        let text = format!("{}\n\n{}\n\n{}", "甲".repeat(48), "乙".repeat(48), "丙".repeat(48));
        let chunks = split_into_chunks(&text, 100, SplitMethod::Paragraph);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains('甲') && chunks[0].contains('乙'));
        assert!(chunks[1].contains('丙'));
    }

    #[test]
    fn oversize_paragraph_is_not_split() {
        let big = "汉".repeat(300);
        let text = format!("{}\n\nshort", big);
        let chunks = split_into_chunks(&text, 100, SplitMethod::Paragraph);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].chars().count() > 100);
        assert!(chunks[1].contains("short"));
    }

    #[test]
    fn multi_paragraph_chunks_stay_under_budget() {
        let text: Vec<String> = (0..20).map(|_| para(48, '字')).collect();
        let joined = text.join("");
        let chunks = split_into_chunks(&joined, 173, SplitMethod::Paragraph);
        for chunk in &chunks {
            let paras = chunk.matches("\n\n").count();
            if paras > 1 {
                assert!(chunk.chars().count() < 173, "chunk len {}", chunk.chars().count());
            }
        }
    }

    #[test]
    fn punctuation_split_breaks_on_sentence_end_before_quote_open() {
        let text = "他说完了。“新的一段开始了，不是吗？”然后结束。";
        let paras = split_on_punctuation(text);
        assert_eq!(paras.len(), 2);
        assert!(paras[0].starts_with("他说完了。"));
        assert!(paras[1].starts_with('“'));
    }

    #[test]
    fn punctuation_split_keeps_non_breaking() {
        let text = "一，二、三。四";
        let paras = split_on_punctuation(text);
        assert_eq!(paras.len(), 1);
    }

    #[test]
    fn closing_quote_binds_to_sentence_end() {
        let text = "他喊道：“住手！”「又一段」";
        let paras = split_on_punctuation(text);
        assert_eq!(paras.len(), 2);
        assert!(paras[0].ends_with("”\n\n"));
    }

    #[test]
    fn split_points_cut_at_chapter_heads() {
        let text = format!("第1章 开始\n{}\n第2章 继续\n{}", "内容甲。", "内容乙。");
        let chunks = split_at_chapter_points(&text, 11_999);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("第1章"));
        assert!(chunks[1].starts_with("第2章"));
    }

    #[test]
    fn adverts_removed_before_chunking() {
        let text = "正文开始。吉米小说网 (www.jimixs.com) txt电子书下载\n\n正文继续。";
        let chunks = split_into_chunks(text, 11_999, SplitMethod::Paragraph);
        let joined = chunks.join("");
        assert!(!joined.contains("jimixs"));
    }
}
