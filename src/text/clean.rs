//! 文本清洗：广告剔除、空行/空格归一、重复标点折叠。

use std::sync::OnceLock;

use regex::Regex;

/// 网站广告清洗规则（对原始中文文本逐条应用，忽略大小写）。
const ADVERT_PATTERNS: [&str; 9] = [
    r"吉米小说网\s*[（(]www\.(34gc|jimixs)\.(net|com)[）)]\s*txt电子书下载",
    r"吉米小说网\s*[（(]Www\.(34gc|jimixs)\.(net|com)[）)]\s*免费TXT小说下载",
    r"吉米小说网\s*[（(]www\.jimixs\.com[）)]\s*免费电子书下载",
    r"本电子书由果茶小说网\s*[（(]www\.34gc\.(net|com)[）)]\s*网友上传分享，网址:http://www\.34gc\.net",
    r"(本电子书由){0,1}[吉米小说网果茶]{4,6}\s*[（(]www\.(34gc|jimixs)\.(net|com)[）)]\s*[tx电子书下载网友上传分免费小说在线阅读说下载享]{4,10}",
    r"[,;.]{0,1}\s*网址:www\.(34gc|jimixs)\.(net|com)",
    r"吉米小说网\s*[（(]www\.(34gc|jimixs)\.(net|com)[）)]",
    r"本电子书由果茶小说网",
    r"(http://){0,1}www\.(34g|jimixs)\.(net|com)",
];

fn advert_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        ADVERT_PATTERNS
            .iter()
            .map(|p| {
                regex::RegexBuilder::new(p)
                    .case_insensitive(true)
                    .build()
                    .expect("advert pattern must compile")
            })
            .collect()
    })
}

/// 去掉首尾的空格字符（保留换行等控制字符）。
pub fn clean(text: &str) -> &str {
    text.trim_matches(' ')
}

/// 删除正文里的网站广告。必须在分片之前无条件执行。
pub fn clean_adverts(text: &str) -> String {
    let mut out = text.to_string();
    for re in advert_res() {
        out = re.replace_all(&out, " ").into_owned();
    }
    // 全角括号统一为半角，广告残留里常见
    out.replace('（', "(").replace('）', ")")
}

/// 连续 4 个以上换行压成 3 个（保留最多两个空行）。
pub fn normalize_empty_lines(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\n{4,}").unwrap());
    re.replace_all(text, "\n\n\n").into_owned()
}

/// 连续 5 个以上换行压成 4 个。翻译输出允许稍松的留白。
pub fn cap_blank_runs(text: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\n{5,}").unwrap());
    re.replace_all(text, "\n\n\n\n").into_owned()
}

/// 每行内部的连续空白压成单个空格，空行保持为空。
pub fn normalize_spaces(text: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    for line in text.split('\n') {
        let stripped = line.trim();
        if stripped.is_empty() {
            lines.push(String::new());
        } else {
            lines.push(stripped.split_whitespace().collect::<Vec<_>>().join(" "));
        }
    }
    lines.join("\n")
}

/// 把 `chars` 里任意字符的连续重复折叠为一个。
pub fn collapse_repeated_chars(text: &str, chars: &[char]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut prev: Option<char> = None;
    for ch in text.chars() {
        if prev == Some(ch) && chars.contains(&ch) {
            continue;
        }
        out.push(ch);
        prev = Some(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_adverts() {
        let text = "Some text. 吉米小说网 (www.jimixs.com) txt电子书下载 More text.";
        let cleaned = clean_adverts(text);
        assert!(!cleaned.contains("吉米小说网"));
        assert!(!cleaned.contains("www.jimixs.com"));
        assert!(cleaned.contains("Some text."));
        assert!(cleaned.contains("More text."));

        let cleaned2 = clean_adverts("Another example 网址:www.34gc.net end.");
        assert!(!cleaned2.contains("www.34gc.net"));
    }

    #[test]
    fn newline_runs_are_bounded() {
        let text = "a\n\n\n\n\n\nb\n\n\nc";
        let out = normalize_empty_lines(text);
        assert_eq!(out, "a\n\n\nb\n\n\nc");
        assert!(!out.contains("\n\n\n\n"));
        // 恰好三个换行保持不变
        assert!(out.contains("\n\n\n"));
    }

    #[test]
    fn cap_blank_runs_allows_four() {
        assert_eq!(cap_blank_runs("a\n\n\n\n\n\n\nb"), "a\n\n\n\nb");
        assert_eq!(cap_blank_runs("a\n\n\n\nb"), "a\n\n\n\nb");
    }

    #[test]
    fn spaces_collapse_per_line() {
        assert_eq!(normalize_spaces("  a   b  \n\n c\td "), "a b\n\nc d");
    }

    #[test]
    fn repeated_punctuation_collapses() {
        assert_eq!(
            collapse_repeated_chars("怒！！！！了。。。", &['！', '。']),
            "怒！了。"
        );
        assert_eq!(collapse_repeated_chars("aaa", &['！']), "aaa");
    }
}
