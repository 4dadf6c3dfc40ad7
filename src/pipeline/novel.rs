//! 单本小说的翻译阶段：解码 → 分片 → 续传扫描 → 逐片翻译 → 合并。
//!
//! 分片 i+1 必须等分片 i 落盘后才开始；重试耗尽时输出结构化致命错误
//! 并以退出码 1 终止——绝不产出残缺的书。

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::base_system::book_meta::{TitleParts, split_bilingual_filename};
use crate::base_system::context::{Config, sanitize_filename};
use crate::text::chunker::{SplitMethod, SplitMode, split_at_chapter_points, split_into_chunks};
use crate::text::clean::{clean_adverts, normalize_empty_lines};
use crate::text::encoding::decode_input_file;
use crate::translation::chunk::ChunkTranslator;
use crate::translation::client::TranslateApi;
use crate::translation::cost::CostTracker;
use crate::translation::retry::RetryPolicy;

/// 分片级重试的最长等待。
const MAX_RETRY_WAIT_SECONDS: u64 = 60;

#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub book_id: String,
    pub book_dir: PathBuf,
    pub combined_path: PathBuf,
    pub chunk_total: usize,
    pub translated_now: usize,
}

pub struct NovelTranslator<'a> {
    config: &'a Config,
    api: &'a dyn TranslateApi,
    retry: RetryPolicy,
    cost: CostTracker,
}

impl<'a> NovelTranslator<'a> {
    pub fn new(config: &'a Config, api: &'a dyn TranslateApi, cost: CostTracker) -> Self {
        Self {
            config,
            api,
            retry: RetryPolicy::from_config(config),
            cost,
        }
    }

    /// 翻译一个文件；`resume` 时扫描已有分片文件并只补缺。
    pub fn translate_file(&self, path: &Path, resume: bool) -> Result<TranslationOutcome> {
        info!("开始导入小说: {}", path.display());
        let encoding = (!self.config.default_encoding.trim().is_empty())
            .then_some(self.config.default_encoding.as_str());
        let content = decode_input_file(path, encoding)?;
        let content = normalize_empty_lines(&clean_adverts(&content));

        let parts = split_bilingual_filename(path);
        let (title, author) = effective_names(&parts);
        let book_dir = path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(sanitize_filename(&format!("{title} by {author}")));
        fs::create_dir_all(&book_dir)
            .with_context(|| format!("创建书目录失败: {}", book_dir.display()))?;

        let max_chars = self.config.clamped_max_chars();
        if self.config.max_chars != max_chars {
            warn!(
                "max_chars={} 超出上限，收紧为 {}",
                self.config.max_chars, max_chars
            );
        }
        let chunks = match SplitMode::parse(&self.config.split_mode) {
            SplitMode::SplitPoints => split_at_chapter_points(&content, max_chars),
            SplitMode::Paragraphs => split_into_chunks(
                &content,
                max_chars,
                SplitMethod::parse(&self.config.split_method),
            ),
        };
        let total = chunks.len();
        info!("共 {total} 个分片，字符数 {}", content.chars().count());

        let existing = if resume {
            let found = scan_existing_chunks(&book_dir, &title, &author)?;
            if found.is_empty() {
                info!("续传模式：未发现已翻译的分片");
            } else {
                info!("续传模式：检测到已翻译分片 {:?}", found);
            }
            found
        } else {
            BTreeSet::new()
        };

        let translator = ChunkTranslator::new(
            self.api,
            &self.retry,
            self.config.double_pass(self.api.is_remote()),
        );

        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::with_template("{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("##-"),
        );
        bar.set_prefix("分片翻译");

        let mut translated_now = 0usize;
        for (idx, chunk) in chunks.iter().enumerate() {
            let number = idx + 1;
            let chunk_path = book_dir.join(chunk_file_name(&title, &author, number));
            if existing.contains(&(number as u32)) && chunk_path.exists() {
                info!("跳过已翻译分片 {number:06}");
                bar.inc(1);
                continue;
            }
            let is_last = number == total;
            self.translate_one(
                &translator,
                chunk,
                number,
                total,
                is_last,
                &chunk_path,
                &title,
                &author,
            );
            translated_now += 1;
            bar.inc(1);
        }
        bar.finish_and_clear();

        // 按序拼接全部分片（分片之间留一个空行）
        let mut pieces = Vec::with_capacity(total);
        for number in 1..=total {
            let chunk_path = book_dir.join(chunk_file_name(&title, &author, number));
            let text = fs::read_to_string(&chunk_path)
                .with_context(|| format!("读取分片失败: {}", chunk_path.display()))?;
            pieces.push(format!("\n{text}\n"));
        }
        let full_text = normalize_empty_lines(&pieces.join("\n"));
        let combined_path = book_dir.join(format!("translated_{title} by {author}.txt"));
        fs::write(&combined_path, &full_text)
            .with_context(|| format!("写入合并译文失败: {}", combined_path.display()))?;
        info!("译文已保存: {}", combined_path.display());

        if self.api.is_remote() && self.cost.summary().request_count > 0 {
            self.write_cost_log(&book_dir, &title, &author, total)?;
        }

        Ok(TranslationOutcome {
            book_id: Uuid::new_v4().to_string(),
            book_dir,
            combined_path,
            chunk_total: total,
            translated_now,
        })
    }

    /// 翻译并落盘一个分片；空译文与写盘失败在这里重试。
    #[allow(clippy::too_many_arguments)]
    fn translate_one(
        &self,
        translator: &ChunkTranslator<'_>,
        chunk: &str,
        number: usize,
        total: usize,
        is_last: bool,
        out_path: &Path,
        title: &str,
        author: &str,
    ) {
        let max_attempts = self.config.max_chunk_retries.max(1);
        let mut last_error = String::from("unknown error");

        for attempt in 1..=max_attempts {
            info!("翻译分片 {number:06}/{total}（尝试 {attempt}/{max_attempts}）");

            match translator.translate(chunk, is_last) {
                Err(exhausted) => {
                    // 请求级重试打满预算也只算一次分片级失败，整个调用重来
                    last_error = exhausted.to_string();
                    warn!("分片 {number:06} 翻译失败（尝试 {attempt}/{max_attempts}）: {last_error}");
                }
                Ok(text) => {
                    if text.trim().is_empty() {
                        last_error =
                            "translation returned empty or whitespace-only text".to_string();
                        warn!("分片 {number:06} 译文为空，准备重试");
                    } else {
                        match fs::write(out_path, &text) {
                            Ok(()) => {
                                info!("分片 {number:06} 完成（第 {attempt} 次尝试）");
                                return;
                            }
                            Err(err) => {
                                last_error = format!("failed to save chunk: {err}");
                                warn!("分片 {number:06} 写盘失败: {err}");
                            }
                        }
                    }
                }
            }

            if attempt < max_attempts {
                let wait = chunk_retry_wait(attempt);
                info!("等待 {}s 后重试分片 {number:06}", wait.as_secs());
                thread::sleep(wait);
            }
        }

        let message = format_chunk_error_message(
            number,
            max_attempts,
            &last_error,
            title,
            author,
            out_path,
        );
        error!("{message}");
        eprintln!("{message}");
        std::process::exit(1);
    }

    fn write_cost_log(
        &self,
        book_dir: &Path,
        title: &str,
        author: &str,
        chunk_total: usize,
    ) -> Result<()> {
        let summary = self.cost.summary();
        let date = OffsetDateTime::now_utc()
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_default();

        let mut log = String::new();
        log.push_str("AI Translation Cost Log\n");
        log.push_str("======================\n\n");
        log.push_str(&format!("Novel: {title} by {author}\n"));
        log.push_str(&format!("Translation Date: {date}\n"));
        log.push_str(&format!("Model: {}\n\n", self.api.model_name()));
        log.push_str(&format!("Total Cost: ${:.6}\n", summary.total_cost));
        log.push_str(&format!("Total Requests: {}\n", summary.request_count));
        log.push_str(&format!("Total Tokens: {}\n", summary.total_tokens));
        log.push_str(&format!("  - Prompt Tokens: {}\n", summary.prompt_tokens));
        log.push_str(&format!(
            "  - Completion Tokens: {}\n",
            summary.completion_tokens
        ));
        if chunk_total > 0 {
            log.push_str(&format!(
                "Average Cost per Chunk: ${:.6}\n",
                summary.total_cost / chunk_total as f64
            ));
            log.push_str(&format!(
                "Average Tokens per Chunk: {}\n",
                summary.total_tokens / chunk_total as u64
            ));
        }
        log.push_str("\nRaw Data:\n---------\n");
        log.push_str(&format!("total_cost: {}\n", summary.total_cost));
        log.push_str(&format!("total_tokens: {}\n", summary.total_tokens));
        log.push_str(&format!("prompt_tokens: {}\n", summary.prompt_tokens));
        log.push_str(&format!(
            "completion_tokens: {}\n",
            summary.completion_tokens
        ));
        log.push_str(&format!("request_count: {}\n", summary.request_count));

        let log_path = book_dir.join(format!("translated_{title} by {author}_AI_COSTS.log"));
        fs::write(&log_path, log)?;
        info!("费用日志已保存: {}", log_path.display());
        Ok(())
    }
}

fn effective_names(parts: &TitleParts) -> (String, String) {
    let title = if parts.english_title == "n.d." {
        parts.original_title.clone()
    } else {
        parts.english_title.clone()
    };
    let author = if parts.english_author == "n.d." {
        "Unknown".to_string()
    } else {
        parts.english_author.clone()
    };
    (sanitize_filename(&title), sanitize_filename(&author))
}

/// 第 `attempt` 次分片级失败后的等待时长（2^attempt 秒，封顶 60）。
pub fn chunk_retry_wait(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt.min(31)).min(MAX_RETRY_WAIT_SECONDS))
}

/// 分片文件名：`<书名> by <作者> - Chunk_000001.txt`。
pub fn chunk_file_name(title: &str, author: &str, number: usize) -> String {
    format!("{title} by {author} - Chunk_{number:06}.txt")
}

/// 扫描书目录里已存在的分片编号。
pub fn scan_existing_chunks(
    book_dir: &Path,
    title: &str,
    author: &str,
) -> Result<BTreeSet<u32>> {
    static NUM_RE: OnceLock<Regex> = OnceLock::new();
    let re = NUM_RE.get_or_init(|| Regex::new(r"Chunk_(\d{6})\.txt$").unwrap());

    let mut found = BTreeSet::new();
    if !book_dir.is_dir() {
        return Ok(found);
    }
    let prefix = format!("{title} by {author} - Chunk_");
    for entry in fs::read_dir(book_dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }
        if let Some(caps) = re.captures(&name)
            && let Ok(num) = caps[1].parse::<u32>()
        {
            found.insert(num);
        }
    }
    Ok(found)
}

/// 分片翻译彻底失败时的结构化报错（含排障提示）。
pub fn format_chunk_error_message(
    chunk_number: usize,
    attempts: u32,
    last_error: &str,
    title: &str,
    author: &str,
    out_path: &Path,
) -> String {
    format!(
        "\n\nFATAL ERROR: Failed to translate chunk {chunk_number:06} after {attempts} attempts.\n\
Last error: {last_error}\n\
Book: {title} by {author}\n\
Chunk file would have been: {}\n\n\
Possible causes:\n\
- Translation API is unreachable or returning errors\n\
- Network connectivity issues\n\
- Insufficient disk space to save translated chunks\n\
- File permissions preventing file write\n\
- API quota exceeded or authentication issues\n\n\
Please check the logs above for more details and resolve the issue before retrying.\n\
To resume translation from this point, use the --resume flag.\n",
        out_path.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::client::{TranslateApi, TranslationError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingApi {
        calls: AtomicUsize,
    }

    impl CountingApi {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TranslateApi for CountingApi {
        fn translate_messages(
            &self,
            _prompt: &str,
            _is_last_chunk: bool,
        ) -> Result<String, TranslationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("Translated passage number {n}."))
        }

        fn model_name(&self) -> &str {
            "counting"
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

    fn small_config() -> Config {
        Config {
            max_chars: 60,
            ..Default::default()
        }
    }

    fn write_novel(dir: &Path) -> PathBuf {
        // 三个段落，每段存储长度 60（58 字 + 段尾两个换行），预算 60 → 三个分片
        let text = format!(
            "{}\n\n{}\n\n{}",
            "一".repeat(58),
            "二".repeat(58),
            "三".repeat(58)
        );
        let path = dir.join("Test Novel by Somebody (Mou Ren) - 测试 by 某人.txt");
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn chunk_files_are_densely_numbered() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_novel(dir.path());
        let config = small_config();
        let api = CountingApi::new();
        let outcome = NovelTranslator::new(&config, &api, CostTracker::new())
            .translate_file(&path, false)
            .unwrap();

        assert_eq!(outcome.chunk_total, 3);
        assert_eq!(outcome.translated_now, 3);
        let re = Regex::new(r"Chunk_\d{6}\.txt$").unwrap();
        for n in 1..=3 {
            let p = outcome
                .book_dir
                .join(chunk_file_name("Test Novel", "Somebody", n));
            assert!(p.exists(), "missing chunk {n}");
            assert!(re.is_match(p.file_name().unwrap().to_str().unwrap()));
        }
        assert!(outcome.combined_path.exists());
        let combined = fs::read_to_string(&outcome.combined_path).unwrap();
        assert!(combined.contains("Translated passage number 1."));
        assert!(combined.contains("Translated passage number 3."));
    }

    #[test]
    fn resume_translates_only_missing_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_novel(dir.path());
        let config = small_config();

        // 第一遍完整跑完
        let api = CountingApi::new();
        let outcome = NovelTranslator::new(&config, &api, CostTracker::new())
            .translate_file(&path, false)
            .unwrap();
        assert_eq!(api.calls.load(Ordering::SeqCst), 3);

        // 删掉第 2 个分片，续传应只重翻它
        let missing = outcome
            .book_dir
            .join(chunk_file_name("Test Novel", "Somebody", 2));
        fs::remove_file(&missing).unwrap();

        let api2 = CountingApi::new();
        let outcome2 = NovelTranslator::new(&config, &api2, CostTracker::new())
            .translate_file(&path, true)
            .unwrap();
        assert_eq!(api2.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome2.translated_now, 1);
        assert!(missing.exists());
    }

    /// 前 `failures` 次调用返回可重试错误，之后成功。
    struct FlakyApi {
        calls: AtomicUsize,
        failures: usize,
    }

    impl FlakyApi {
        fn new(failures: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures,
            }
        }
    }

    impl TranslateApi for FlakyApi {
        fn translate_messages(
            &self,
            _prompt: &str,
            _is_last_chunk: bool,
        ) -> Result<String, TranslationError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(TranslationError::Transient("connection reset".into()))
            } else {
                Ok("A full translated passage, finally delivered.".to_string())
            }
        }

        fn model_name(&self) -> &str {
            "flaky"
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

    #[test]
    fn exhausted_translations_are_retried_at_chunk_level() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("Flaky Novel by Author (Roman) - 断续 by 作者.txt");
        fs::write(&path, "很短的一段正文。").unwrap();

        // 请求级重试只给一次机会，前两次 translate() 都以 RetryExhausted 收场，
        // 必须靠分片级循环（max_chunk_retries）把整个调用重跑到成功。
        // 退避会真实睡 2s + 4s。
        let config = Config {
            max_retries: 1,
            max_chunk_retries: 5,
            ..Default::default()
        };
        let api = FlakyApi::new(2);
        let outcome = NovelTranslator::new(&config, &api, CostTracker::new())
            .translate_file(&path, false)
            .unwrap();

        assert_eq!(api.calls.load(Ordering::SeqCst), 3, "two failed attempts then one success");
        assert_eq!(outcome.chunk_total, 1);
        assert_eq!(outcome.translated_now, 1);
        let chunk = outcome
            .book_dir
            .join(chunk_file_name("Flaky Novel", "Author", 1));
        assert_eq!(
            fs::read_to_string(chunk).unwrap(),
            "A full translated passage, finally delivered."
        );
    }

    #[test]
    fn chunk_retry_wait_doubles_and_caps() {
        assert_eq!(chunk_retry_wait(1), Duration::from_secs(2));
        assert_eq!(chunk_retry_wait(2), Duration::from_secs(4));
        assert_eq!(chunk_retry_wait(5), Duration::from_secs(32));
        assert_eq!(chunk_retry_wait(6), Duration::from_secs(60));
        assert_eq!(chunk_retry_wait(30), Duration::from_secs(60));
    }

    #[test]
    fn fatal_message_contains_contract_fields() {
        let msg = format_chunk_error_message(
            7,
            10,
            "connection reset",
            "Test Novel",
            "Somebody",
            Path::new("/tmp/out/chunk.txt"),
        );
        assert!(msg.contains("chunk 000007"));
        assert!(msg.contains("after 10 attempts"));
        assert!(msg.contains("connection reset"));
        assert!(msg.contains("Test Novel by Somebody"));
        assert!(msg.contains("/tmp/out/chunk.txt"));
    }

    #[test]
    fn existing_chunk_scan_finds_numbers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("T by A - Chunk_000001.txt"),
            "x",
        )
        .unwrap();
        fs::write(
            dir.path().join("T by A - Chunk_000005.txt"),
            "y",
        )
        .unwrap();
        fs::write(dir.path().join("unrelated.txt"), "z").unwrap();
        let found = scan_existing_chunks(dir.path(), "T", "A").unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![1, 5]);
    }
}
