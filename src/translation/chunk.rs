//! 单个分片的翻译编排：一遍或两遍（精修）翻译。
//!
//! 二遍翻译把第一遍的产出塞进精修提示词重新过一轮，目标是清除残留
//! 汉字并把直引号换成弯引号。每一遍之后都会剥离模型爱加的
//! “翻译标记”水印并收紧空行。

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};
use tracing::debug;

use super::client::TranslateApi;
use super::retry::{RetryExhausted, RetryPolicy};
use crate::text::clean::{cap_blank_runs, clean, normalize_spaces};

/// 模型输出里需要剥离的标记关键词（带各种括号/井号变体）。
const MARKER_KEYWORDS: [&str; 13] = [
    "DECLARATION",
    "TRANSLATION",
    "TRANSLATED TEXT",
    "ENGLISH TEXT",
    "REVISED TEXT",
    "CORRECTED TEXT",
    "TRANSLATED IN ENGLISH",
    "TEXT TRANSLATED IN ENGLISH",
    "FIXED TEXT",
    "ENGLISH TRANSLATED TEXT",
    "ENGLISH TRANSLATION",
    "ENGLISH VERSION",
    "TRANSLATED VERSION",
];

/// 自由文本形式的标记（"End of translation" 等）。
const FREEFORM_MARKERS: [&str; 3] = ["End of translation", "Start of translation", "English Translation"];

pub struct ChunkTranslator<'a> {
    api: &'a dyn TranslateApi,
    retry: &'a RetryPolicy,
    double_pass: bool,
}

impl<'a> ChunkTranslator<'a> {
    pub fn new(api: &'a dyn TranslateApi, retry: &'a RetryPolicy, double_pass: bool) -> Self {
        Self {
            api,
            retry,
            double_pass,
        }
    }

    /// 翻译一个分片，返回整理后的英文文本。
    pub fn translate(&self, chunk: &str, is_last_chunk: bool) -> Result<String, RetryExhausted> {
        debug!("翻译分片（double_pass={}）", self.double_pass);
        let chunk = cap_blank_runs(chunk);

        let prompt1 = format!("{}\n\n{}\n\n", self.api.first_pass_prompt(), chunk);
        let first = self
            .retry
            .run("first pass", || self.api.translate_messages(&prompt1, is_last_chunk))?;
        let first = strip_translation_markers(&first);

        if !self.double_pass {
            return Ok(first);
        }

        debug!("执行第二遍精修翻译");
        let prompt2 = format!(
            "{}[*INPUT TEXT TO CORRECT*]\n\n{}\n\n",
            self.api.second_pass_prompt(),
            first
        );
        let refined = self
            .retry
            .run("refinement pass", || {
                self.api.translate_messages(&prompt2, is_last_chunk)
            })?;
        Ok(strip_translation_markers(&refined))
    }
}

fn freeform_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        FREEFORM_MARKERS
            .iter()
            .map(|marker| {
                let pattern = format!(
                    r"[\[\(\-\*\s]*[-]*{}[\.\-\)\]\s]*[\.\-]*[\)\]\*\s]*",
                    regex::escape(marker)
                );
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("marker pattern must compile")
            })
            .collect()
    })
}

fn keyword_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        MARKER_KEYWORDS
            .iter()
            .map(|keyword| {
                let k = regex::escape(keyword);
                let pattern =
                    format!(r"(</?{k}>|\[/?{k}\]|\{{/?{k}\}}|\(/?{k}\)|##{k}##)");
                RegexBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("keyword pattern must compile")
            })
            .collect()
    })
}

/// 去掉译文里的标记水印，并归一空格/空行。
pub fn strip_translation_markers(text: &str) -> String {
    let mut out = text.to_string();
    for re in freeform_res() {
        out = re.replace_all(&out, "").into_owned();
    }
    for re in keyword_res() {
        out = re.replace_all(&out, "").into_owned();
    }
    let out = normalize_spaces(&out);
    let out = cap_blank_runs(&out);
    clean(&out).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::client::TranslationError;
    use std::sync::Mutex;

    /// 按脚本回复的假端点。
    struct ScriptedApi {
        replies: Mutex<Vec<Result<String, TranslationError>>>,
        prompts_seen: Mutex<Vec<String>>,
    }

    impl ScriptedApi {
        fn new(replies: Vec<Result<String, TranslationError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                prompts_seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl TranslateApi for ScriptedApi {
        fn translate_messages(
            &self,
            prompt: &str,
            _is_last_chunk: bool,
        ) -> Result<String, TranslationError> {
            self.prompts_seen.lock().unwrap().push(prompt.to_string());
            self.replies.lock().unwrap().remove(0)
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn is_remote(&self) -> bool {
            false
        }

        fn first_pass_prompt(&self) -> &str {
            "FIRST:"
        }

        fn second_pass_prompt(&self) -> &str {
            "SECOND:"
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            wall_clock_budget: std::time::Duration::from_secs(10),
            wait_base: 0.0,
            wait_min: 0.0,
            wait_max: 0.0,
        }
    }

    #[test]
    fn single_pass_returns_first_translation() {
        let api = ScriptedApi::new(vec![Ok("The translation.".to_string())]);
        let retry = quick_retry();
        let out = ChunkTranslator::new(&api, &retry, false)
            .translate("原文", false)
            .unwrap();
        assert_eq!(out, "The translation.");
        assert_eq!(api.prompts_seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn double_pass_feeds_first_output_into_refinement() {
        let api = ScriptedApi::new(vec![
            Ok("draft with 汉字".to_string()),
            Ok("polished text".to_string()),
        ]);
        let retry = quick_retry();
        let out = ChunkTranslator::new(&api, &retry, true)
            .translate("原文", false)
            .unwrap();
        assert_eq!(out, "polished text");
        let prompts = api.prompts_seen.lock().unwrap();
        assert!(prompts[0].starts_with("FIRST:"));
        assert!(prompts[1].starts_with("SECOND:"));
        assert!(prompts[1].contains("draft with 汉字"));
    }

    #[test]
    fn rejections_then_success() {
        // S5：两次非拉丁被拒后第三次成功
        let api = ScriptedApi::new(vec![
            Err(TranslationError::Transient("not latin".into())),
            Err(TranslationError::Transient("not latin".into())),
            Ok("A Latin response".to_string()),
        ]);
        let retry = quick_retry();
        let out = ChunkTranslator::new(&api, &retry, false)
            .translate("这是中文", true)
            .unwrap();
        assert_eq!(out, "A Latin response");
    }

    #[test]
    fn markers_are_stripped() {
        let raw = "[English Translation]\nReal text here.\n\n[End of translation]";
        let out = strip_translation_markers(raw);
        assert_eq!(out, "Real text here.");

        let tagged = "##TRANSLATION##Body text.[/REVISED TEXT]";
        assert_eq!(strip_translation_markers(tagged), "Body text.");
    }

    #[test]
    fn marker_strip_caps_blank_runs() {
        let raw = "para one\n\n\n\n\n\n\npara two";
        let out = strip_translation_markers(raw);
        assert!(!out.contains("\n\n\n\n\n"));
    }
}
