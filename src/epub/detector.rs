//! 英文章节标题识别与多部章节子编号。
//!
//! 识别 `Chapter 7` / `Chapter VII` / `Chapter Seven`（1–9999 的英文数词）、
//! `Part/Section/Book N`、`§ N` 以及行首 `N.` 式标题；对话里出现的
//! "chapter" 一词通过位置/引号校验排除。

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

/// 行数超过该值时启用两段式加速（先做廉价子串过滤，再跑正则）。
const FAST_SCAN_THRESHOLD: usize = 100_000;

const WORD_NUMS: &str = "one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve|\
thirteen|fourteen|fifteen|sixteen|seventeen|eighteen|nineteen|\
twenty|thirty|forty|fifty|sixty|seventy|eighty|ninety|hundred|thousand";

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(
            r"^[^\w]*\s*(?:(?:chapter|ch\.?|chap\.?)\s*(?:(?P<num_d>\d+[a-z]?)|(?P<num_r>[ivxlcdm]+)|(?P<num_w>(?:{w})(?:[-\s](?:{w}))*))|(?:part|section|book)\s+(?:(?P<part_d>\d+)|(?P<part_r>[ivxlcdm]+)|(?P<part_w>(?:{w})(?:[-\s](?:{w}))*))|§\s*(?P<sec_d>\d+)|(?P<hash_d>\d+)\s*(?:\.|\)|:|-)?)\b(?P<rest>.*)$",
            w = WORD_NUMS
        );
        RegexBuilder::new(&pattern)
            .case_insensitive(true)
            .build()
            .expect("heading pattern must compile")
    })
}

// ── 数词解析 ──────────────────────────────────────────────────

pub fn roman_to_int(s: &str) -> Option<i64> {
    let mut total = 0i64;
    let mut prev = 0i64;
    for ch in s.to_lowercase().chars().rev() {
        let val = match ch {
            'i' => 1,
            'v' => 5,
            'x' => 10,
            'l' => 50,
            'c' => 100,
            'd' => 500,
            'm' => 1000,
            _ => return None,
        };
        if val < prev {
            total -= val;
        } else {
            total += val;
        }
        prev = val;
    }
    Some(total)
}

fn single_word(tok: &str) -> Option<i64> {
    Some(match tok {
        "zero" => 0,
        "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        "thirteen" => 13,
        "fourteen" => 14,
        "fifteen" => 15,
        "sixteen" => 16,
        "seventeen" => 17,
        "eighteen" => 18,
        "nineteen" => 19,
        _ => return None,
    })
}

fn tens_word(tok: &str) -> Option<i64> {
    Some(match tok {
        "twenty" => 20,
        "thirty" => 30,
        "forty" => 40,
        "fifty" => 50,
        "sixty" => 60,
        "seventy" => 70,
        "eighty" => 80,
        "ninety" => 90,
        _ => return None,
    })
}

pub fn words_to_int(text: &str) -> Option<i64> {
    let mut total = 0i64;
    let mut curr = 0i64;
    let mut any = false;
    for tok in text
        .to_lowercase()
        .split(|c: char| c == ' ' || c == '\t' || c == '-')
        .filter(|t| !t.is_empty())
    {
        any = true;
        if let Some(v) = single_word(tok) {
            curr += v;
        } else if let Some(v) = tens_word(tok) {
            curr += v;
        } else if tok == "hundred" {
            curr = curr.max(1) * 100;
        } else if tok == "thousand" {
            curr = curr.max(1) * 1000;
            total += curr;
            curr = 0;
        } else {
            return None;
        }
    }
    if any { Some(total + curr) } else { None }
}

/// 解析标题里捕获的编号：十进制（可带字母后缀）、罗马数字或英文数词。
pub fn parse_num(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let first = raw.chars().next()?;
    if first.is_ascii_digit() {
        let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
        return digits.parse().ok();
    }
    if raw.chars().all(|c| "ivxlcdmIVXLCDM".contains(c)) {
        return roman_to_int(raw);
    }
    words_to_int(raw)
}

// ── 误报抑制 ──────────────────────────────────────────────────

const ALLOWED_PREFIX_CHARS: &str = "#*>§[](){}|-–—•~/";

/// "chapter" 一词只在行首或仅被符号前缀时才算标题；引号里的不算。
pub fn is_valid_chapter_line(line: &str) -> bool {
    let stripped = line.trim();
    let lower = stripped.to_lowercase();

    if (stripped.starts_with('"') || stripped.starts_with('\'')) && lower.contains("chapter") {
        let quote = stripped.chars().next().unwrap_or('"');
        if let Some(end) = stripped.char_indices().skip(1).find(|(_, c)| *c == quote)
            && stripped[..end.0].to_lowercase().contains("chapter")
        {
            return false; // 标题词被引号括住
        }
    }

    let Some(pos) = lower.find("chapter") else {
        return true; // 没有 chapter 一词，交给正则判断
    };
    if pos == 0 {
        return true;
    }

    let before = lower[..pos].trim();
    if !before.is_empty()
        && before
            .chars()
            .all(|c| ALLOWED_PREFIX_CHARS.contains(c) || c.is_whitespace())
    {
        return true;
    }
    false
}

// ── 部件标记检测 ──────────────────────────────────────────────

/// 标题是否带 "第 N 部分" 式的部件标记（`1/3`、`(2 of 5)`、`Part 1`、
/// `pt. 2`、末尾 `- 3`、`Part II` 等）。孤立的末尾罗马数字不算。
pub fn has_part_notation(title: &str) -> bool {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    let res = RES.get_or_init(|| {
        let word = format!("(?:{WORD_NUMS})");
        [
            r"\d+\s*/\s*\d+".to_string(),
            r"\(\s*\d+\s+(?:of|out\s+of)\s+\d+\s*\)".to_string(),
            format!(r"\bpart\s+(?:\d+|[ivxlcdm]+\b|{word}\b)"),
            format!(r"\bpt\.?\s*(?:\d+|[ivxlcdm]+\b|{word}\b)"),
            r"-\s*\d+\s*$".to_string(),
            r"-\s*[ivxlcdm]+\s*$".to_string(),
        ]
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .expect("part pattern must compile")
        })
        .collect()
    });
    !title.is_empty() && res.iter().any(|re| re.is_match(title))
}

// ── 章节切分 ──────────────────────────────────────────────────

struct RawChapter {
    title: String,
    content: String,
    num: Option<i64>,
}

/// 把全文切成 (标题, 正文) 块并给出章节序号串。
///
/// `detect_headings=false` 时整体作为一个 "Content" 块返回。
pub fn split_chapters(text: &str, detect_headings: bool) -> (Vec<(String, String)>, Vec<i64>) {
    if !detect_headings {
        return (vec![("Content".to_string(), text.to_string())], Vec::new());
    }

    let lines: Vec<&str> = text.lines().collect();
    let fast_scan = lines.len() > FAST_SCAN_THRESHOLD;

    let mut raw_chapters: Vec<RawChapter> = Vec::new();
    let mut seq: Vec<i64> = Vec::new();
    let mut buf: Vec<&str> = Vec::new();
    let mut cur_title: Option<String> = None;
    let mut cur_num: Option<i64> = None;
    let mut front_done = false;
    let mut last_num: Option<i64> = None;
    let mut blank_only = true;

    // 近期标题跟踪：4 行窗口内的重复抑制
    let mut last_heading_line: isize = -10;
    let mut last_heading_text: Option<String> = None;

    for (line_idx, &line) in lines.iter().enumerate() {
        // 大文件先用廉价过滤器筛掉绝大多数行，正则只跑候选行
        if fast_scan && !quick_candidate(line) {
            buf.push(line);
            if !line.trim().is_empty() {
                blank_only = false;
            }
            continue;
        }

        let Some(caps) = heading_re().captures(line.trim()) else {
            buf.push(line);
            if !line.trim().is_empty() {
                blank_only = false;
            }
            continue;
        };

        if line.to_lowercase().contains("chapter") && !is_valid_chapter_line(line) {
            // 对话或句中出现的 chapter，按普通文本处理
            buf.push(line);
            blank_only = false;
            continue;
        }

        let num_str = ["num_d", "num_r", "num_w", "part_d", "part_r", "part_w", "sec_d", "hash_d"]
            .iter()
            .find_map(|g| caps.name(g).map(|m| m.as_str()));
        let Some(num) = num_str.and_then(parse_num) else {
            buf.push(line);
            blank_only = false;
            continue;
        };

        let lines_since_last = line_idx as isize - last_heading_line;
        let current_text = line.trim().to_string();

        // 4 行内完全相同的标题行视为重复，忽略
        if lines_since_last <= 4 && Some(&current_text) == last_heading_text.as_ref() {
            buf.push(line);
            blank_only = false;
            continue;
        }
        // 4 行内同号不同副标题：保留（多部章节，由子编号处理）

        last_heading_line = line_idx as isize;
        last_heading_text = Some(current_text);

        // 与上个标题之间只有空行时按重复标题丢弃
        if last_num == Some(num) && blank_only {
            buf.clear();
            continue;
        }
        last_num = Some(num);
        blank_only = true;

        if !front_done {
            if !buf.is_empty() {
                let content = buf.join("\n").trim().to_string();
                if !content.is_empty() {
                    raw_chapters.push(RawChapter {
                        title: "Front Matter".to_string(),
                        content,
                        num: None,
                    });
                }
                buf.clear();
            }
            front_done = true;
        }

        if let Some(title) = cur_title.take() {
            raw_chapters.push(RawChapter {
                title,
                content: buf.join("\n").trim().to_string(),
                num: cur_num,
            });
            buf.clear();
        }

        let subtitle = normalize_subtitle(caps.name("rest").map(|m| m.as_str()).unwrap_or(""));
        cur_title = Some(if subtitle.is_empty() {
            format!("Chapter {num}")
        } else {
            format!("Chapter {num}: {subtitle}")
        });
        cur_num = Some(num);
        seq.push(num);
    }

    if let Some(title) = cur_title {
        raw_chapters.push(RawChapter {
            title,
            content: buf.join("\n").trim().to_string(),
            num: cur_num,
        });
    } else if !buf.is_empty() {
        raw_chapters.push(RawChapter {
            title: "Content".to_string(),
            content: buf.join("\n").trim().to_string(),
            num: None,
        });
    }

    (apply_sub_numbering(raw_chapters), seq)
}

/// 同号章节出现 K>1 次时按首见顺序改写为 `Chapter N.1…N.K`。
fn apply_sub_numbering(raw_chapters: Vec<RawChapter>) -> Vec<(String, String)> {
    static SUBTITLE_RE: OnceLock<Regex> = OnceLock::new();
    let subtitle_re = SUBTITLE_RE
        .get_or_init(|| Regex::new(r"^Chapter \d+[a-z]?\s*[–:]\s*(.+)$").unwrap());

    let mut counts: HashMap<i64, usize> = HashMap::new();
    for ch in &raw_chapters {
        if let Some(num) = ch.num
            && ch.title.starts_with("Chapter ")
        {
            *counts.entry(num).or_insert(0) += 1;
        }
    }

    let mut part_counters: HashMap<i64, usize> = HashMap::new();
    raw_chapters
        .into_iter()
        .map(|ch| {
            let Some(num) = ch.num else {
                return (ch.title, ch.content);
            };
            if !ch.title.starts_with("Chapter ") || counts.get(&num).copied().unwrap_or(1) == 1 {
                return (ch.title, ch.content);
            }
            let counter = part_counters.entry(num).or_insert(0);
            *counter += 1;
            let part = *counter;
            let new_title = match subtitle_re.captures(&ch.title) {
                Some(caps) => format!("Chapter {num}.{part}: {}", &caps[1]),
                None => format!("Chapter {num}.{part}"),
            };
            (new_title, ch.content)
        })
        .collect()
}

/// 去掉副标题前面粘着的分隔符残渣（`: Part 1` → `Part 1`）。
fn normalize_subtitle(rest: &str) -> String {
    rest.trim()
        .trim_start_matches([':', '–', '—', '-', '.', ')', ']'])
        .trim()
        .to_string()
}

/// 两段式加速的第一段：廉价判断某行是否可能是标题。
fn quick_candidate(line: &str) -> bool {
    let t = line.trim_start_matches(|c: char| {
        c.is_whitespace() || (ALLOWED_PREFIX_CHARS.contains(c) && c != '§')
    });
    if t.starts_with('§') {
        return true;
    }
    let head: String = t.chars().take(8).collect::<String>().to_lowercase();
    head.starts_with("chapter")
        || head.starts_with("chap")
        || head.starts_with("ch.")
        || head.starts_with("ch ")
        || head.starts_with("part")
        || head.starts_with("section")
        || head.starts_with("book")
        || head.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeral_forms_parse() {
        assert_eq!(parse_num("7"), Some(7));
        assert_eq!(parse_num("14a"), Some(14));
        assert_eq!(parse_num("vii"), Some(7));
        assert_eq!(parse_num("XIV"), Some(14));
        assert_eq!(parse_num("seven"), Some(7));
        assert_eq!(parse_num("twenty-one"), Some(21));
        assert_eq!(parse_num("one hundred"), Some(100));
        assert_eq!(parse_num("two thousand three"), Some(2003));
        assert_eq!(parse_num("nonsense"), None);
    }

    #[test]
    fn sequential_chapters_round_trip() {
        let text = (1..=12)
            .map(|i| format!("Chapter {i}\nbody of chapter {i}\n"))
            .collect::<Vec<_>>()
            .join("\n");
        let (chapters, seq) = split_chapters(&text, true);
        assert_eq!(seq, (1..=12).collect::<Vec<i64>>());
        assert_eq!(chapters.len(), 12);
        assert_eq!(chapters[0].0, "Chapter 1");
        assert!(chapters[4].1.contains("body of chapter 5"));
    }

    #[test]
    fn heading_variants_recognized() {
        for line in [
            "Chapter 3",
            "Ch. 3",
            "Chap 3",
            "Chapter III",
            "Chapter Three",
            "Part 3",
            "Section 3",
            "§ 3",
            "3. The Beginning",
        ] {
            let text = format!("{line}\nsome body\n");
            let (_, seq) = split_chapters(&text, true);
            assert_eq!(seq, vec![3], "failed for {line:?}");
        }
    }

    #[test]
    fn quoted_chapter_is_not_a_heading() {
        let text = "Chapter 1\nShe whispered, \"Chapter 2 is my favorite.\"\nmore text\nChapter 2\nbody";
        let (chapters, seq) = split_chapters(&text, true);
        assert_eq!(seq, vec![1, 2]);
        assert_eq!(chapters.len(), 2);
        assert!(chapters[0].1.contains("my favorite"));
    }

    #[test]
    fn mid_sentence_chapter_rejected() {
        assert!(!is_valid_chapter_line("He finished the chapter 3 days later"));
        assert!(is_valid_chapter_line("Chapter 3"));
        assert!(is_valid_chapter_line("# Chapter 3"));
        assert!(is_valid_chapter_line("> Chapter 3"));
        assert!(!is_valid_chapter_line("\"Chapter 3 is done,\" she said"));
    }

    #[test]
    fn duplicate_heading_within_window_is_ignored() {
        let text = "Chapter 1\nChapter 1\nbody text\nChapter 2\nbody two";
        let (chapters, seq) = split_chapters(&text, true);
        assert_eq!(seq, vec![1, 2]);
        assert_eq!(chapters.len(), 2);
    }

    #[test]
    fn multi_part_chapters_get_sub_numbers() {
        let text = "Chapter 5: Part 1\ncontent one\n\nChapter 5: Part 2\ncontent two\n\nChapter 5: Part 3\ncontent three";
        let (chapters, seq) = split_chapters(&text, true);
        assert_eq!(seq, vec![5, 5, 5]);
        assert_eq!(chapters[0].0, "Chapter 5.1: Part 1");
        assert_eq!(chapters[1].0, "Chapter 5.2: Part 2");
        assert_eq!(chapters[2].0, "Chapter 5.3: Part 3");
    }

    #[test]
    fn sequential_numbers_with_part_markers_unchanged() {
        let text = "Chapter 5: The War Part 1\ncontent\n\nChapter 6: The War Part 2\ncontent\n\nChapter 7: The War Part 3\ncontent";
        let (chapters, _) = split_chapters(&text, true);
        assert_eq!(chapters[0].0, "Chapter 5: The War Part 1");
        assert_eq!(chapters[1].0, "Chapter 6: The War Part 2");
        assert_eq!(chapters[2].0, "Chapter 7: The War Part 3");
    }

    #[test]
    fn letter_suffix_chapters_share_a_number() {
        let text = "Chapter 14a: The First Battle\ncontent a\n\nChapter 14b: The First Battle Continues\ncontent b\n\nChapter 14c: The First Battle Ends\ncontent c";
        let (chapters, seq) = split_chapters(&text, true);
        assert_eq!(seq, vec![14, 14, 14]);
        assert!(chapters[0].0.contains(".1"));
        assert!(chapters[1].0.contains(".2"));
        assert!(chapters[2].0.contains(".3"));
    }

    #[test]
    fn mixed_regular_and_multi_part_chapters() {
        let text = "Chapter 1: Introduction\nContent\n\nChapter 2: Beginning\nContent\n\nChapter 3: The Attack! 1/3\nContent\n\nChapter 3: The Attack! 2/3\nContent\n\nChapter 3: The Attack! 3/3\nContent\n\nChapter 4: Recovery\nContent";
        let (chapters, _) = split_chapters(&text, true);
        assert_eq!(chapters.len(), 6);
        assert_eq!(chapters[0].0, "Chapter 1: Introduction");
        assert_eq!(chapters[1].0, "Chapter 2: Beginning");
        assert!(chapters[2].0.contains("3.1"));
        assert!(chapters[3].0.contains("3.2"));
        assert!(chapters[4].0.contains("3.3"));
        assert_eq!(chapters[5].0, "Chapter 4: Recovery");
    }

    #[test]
    fn front_matter_is_preserved() {
        let text = "Some introduction text\nby the author\n\nChapter 1\nbody";
        let (chapters, seq) = split_chapters(&text, true);
        assert_eq!(seq, vec![1]);
        assert_eq!(chapters[0].0, "Front Matter");
        assert!(chapters[0].1.contains("introduction"));
    }

    #[test]
    fn no_headings_yields_single_content_block() {
        let (chapters, seq) = split_chapters("just some text\nwithout chapters", true);
        assert!(seq.is_empty());
        assert_eq!(chapters.len(), 1);
        assert_eq!(chapters[0].0, "Content");
    }

    #[test]
    fn part_notation_positive_cases() {
        for t in [
            "Chapter 5: The War 1/3",
            "Chapter 5: The War [2/3]",
            "Chapter 5: The War (3 of 5)",
            "Chapter 5: The War (1 out of 3)",
            "Chapter 5: The War - Part 1",
            "Chapter 5: The War - part one",
            "Chapter 5: The War pt. 2",
            "Chapter 5: The War Pt 3",
            "Chapter 5: The War - 1",
            "Chapter 5: The War Part I",
            "Chapter 5: The War - II",
        ] {
            assert!(has_part_notation(t), "expected part notation in {t:?}");
        }
    }

    #[test]
    fn part_notation_negative_cases() {
        for t in [
            "",
            "Chapter 5: The War",
            "Chapter 5: Victory",
            "Chapter 5: Year 2023",
            "Chapter 5: 100 Days Later",
            "Chapter 5: World War II History",
            "Chapter 5: Louis XIV",
            "Chapter 5: The War I",
        ] {
            assert!(!has_part_notation(t), "unexpected part notation in {t:?}");
        }
    }

    #[test]
    fn fast_scan_matches_slow_scan() {
        // 超过阈值的行数触发两段式扫描，结果必须与常规扫描一致
        let mut text = String::new();
        for i in 1..=3 {
            text.push_str(&format!("Chapter {i}\n"));
            for _ in 0..40_000 {
                text.push_str("filler line of prose\n");
            }
        }
        let (chapters, seq) = split_chapters(&text, true);
        assert_eq!(seq, vec![1, 2, 3]);
        assert_eq!(chapters.len(), 3);
    }
}
