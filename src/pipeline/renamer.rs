//! 重命名阶段：读文件头部 → 元数据提取 LLM → 规范文件名。
//!
//! 批量模式用 crossbeam 工作池并行调用元数据 API。

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use crossbeam_channel as channel;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::base_system::book_meta::canonical_name_re;
use crate::base_system::context::{Config, sanitize_filename};
use crate::text::encoding::decode_bytes;
use crate::translation::client::TranslationError;
use crate::translation::prompts::SYSTEM_PROMPT_METADATA;

/// 头部预览的字符硬上限。
const PREVIEW_CHAR_LIMIT: usize = 1500;
/// 元数据请求的重试次数与退避区间。
const METADATA_MAX_ATTEMPTS: u32 = 3;
const METADATA_WAIT_MIN: Duration = Duration::from_secs(1);
const METADATA_WAIT_MAX: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct NovelMetadata {
    #[serde(default = "unknown")]
    pub novel_title_original: String,
    #[serde(default = "unknown")]
    pub novel_title_english: String,
    #[serde(default = "unknown")]
    pub author_name_original: String,
    #[serde(default = "unknown")]
    pub author_name_romanized: String,
    #[serde(default = "unknown")]
    pub author_name_english: String,
}

fn unknown() -> String {
    "Unknown".to_string()
}

#[derive(Debug, Clone)]
pub enum RenameOutcome {
    /// 已符合规范命名，跳过。
    AlreadyCanonical,
    /// 仅提取元数据，未改名。
    DryRun(NovelMetadata),
    /// 改名完成。
    Renamed {
        new_path: PathBuf,
        metadata: NovelMetadata,
    },
}

pub struct Renamer<'a> {
    config: &'a Config,
    api_key: String,
    client: reqwest::blocking::Client,
}

impl<'a> Renamer<'a> {
    pub fn new(config: &'a Config, api_key: String) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            config,
            api_key,
            client,
        })
    }

    /// 处理单个文件。规范名直接跳过；`dry_run` 时只返回提议的元数据。
    pub fn process_file(&self, path: &Path, dry_run: bool) -> Result<RenameOutcome> {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            anyhow::bail!("无法读取文件名: {}", path.display());
        };
        if canonical_name_re().is_match(name) {
            info!("文件已符合命名规范，跳过: {name}");
            return Ok(RenameOutcome::AlreadyCanonical);
        }

        let preview = self.read_preview(path)?;
        let metadata = self.extract_metadata(&preview)?;

        if dry_run {
            info!("[dry-run] {} 的提议元数据: {:?}", path.display(), metadata);
            return Ok(RenameOutcome::DryRun(metadata));
        }

        let new_path = rename_novel_file(path, &metadata)?;
        info!("已重命名 '{}' → '{}'", path.display(), new_path.display());
        Ok(RenameOutcome::Renamed { new_path, metadata })
    }

    /// 读取开头 `rename_kb_to_read` KB，解码并截到字符上限。
    fn read_preview(&self, path: &Path) -> Result<String> {
        let size = fs::metadata(path)
            .with_context(|| format!("无法读取文件信息: {}", path.display()))?
            .len();
        let min_bytes = self.config.rename_min_file_size_kb * 1024;
        if size < min_bytes {
            anyhow::bail!(
                "文件过小（{size} 字节 < {min_bytes} 字节），跳过重命名: {}",
                path.display()
            );
        }

        let to_read = (self.config.rename_kb_to_read * 1024).min(size) as usize;
        let mut buf = vec![0u8; to_read];
        let mut file = File::open(path)?;
        file.read_exact(&mut buf)?;

        let decoded = decode_bytes(&buf, None, path);
        Ok(truncate_chars(&decoded, PREVIEW_CHAR_LIMIT))
    }

    /// 调用元数据提取 API（HTTP/超时失败指数退避，最多 3 次）。
    fn extract_metadata(&self, content: &str) -> Result<NovelMetadata> {
        let mut wait = METADATA_WAIT_MIN;
        let mut last_error = String::new();

        for attempt in 1..=METADATA_MAX_ATTEMPTS {
            match self.request_metadata(content) {
                Ok(metadata) => return Ok(metadata),
                Err(TranslationError::Auth(msg)) => {
                    anyhow::bail!("元数据 API 认证失败: {msg}");
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!("元数据提取失败（第 {attempt}/{METADATA_MAX_ATTEMPTS} 次）: {last_error}");
                    if attempt < METADATA_MAX_ATTEMPTS {
                        thread::sleep(wait);
                        wait = (wait * 2).min(METADATA_WAIT_MAX);
                    }
                }
            }
        }
        anyhow::bail!("元数据提取重试耗尽: {last_error}")
    }

    fn request_metadata(&self, content: &str) -> Result<NovelMetadata, TranslationError> {
        let body = json!({
            "model": self.config.rename_model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT_METADATA },
                { "role": "user", "content": format!(
                    "Analyze this Chinese novel text and extract the metadata:\n\n{content}"
                ) },
            ],
            "temperature": 0.0,
            "response_format": { "type": "json_object" },
        });

        let resp = self
            .client
            .post(&self.config.rename_endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| TranslationError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TranslationError::Auth(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TranslationError::Transient(format!("HTTP {status}")));
        }

        let value: Value = resp
            .json()
            .map_err(|e| TranslationError::Transient(format!("json decode failed: {e}")))?;
        parse_metadata_reply(&value)
    }

    /// 批量处理：工作池并行，线程数 0 表示取 CPU 核心数。
    pub fn process_batch(&self, dir: &Path, dry_run: bool) -> Result<Vec<(PathBuf, Result<RenameOutcome>)>> {
        let min_bytes = self.config.rename_min_file_size_kb * 1024;
        let mut eligible: Vec<PathBuf> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !path.is_file() || name.starts_with('.') || !name.to_lowercase().ends_with(".txt") {
                continue;
            }
            if entry.metadata().map(|m| m.len()).unwrap_or(0) < min_bytes {
                continue;
            }
            eligible.push(path);
        }
        eligible.sort();

        if eligible.is_empty() {
            warn!("目录下没有符合条件的文本文件: {}", dir.display());
            return Ok(Vec::new());
        }

        let workers = if self.config.rename_workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        } else {
            self.config.rename_workers
        };
        info!("批量重命名 {} 个文件，{workers} 个工作线程", eligible.len());

        let (job_tx, job_rx) = channel::unbounded::<PathBuf>();
        let (result_tx, result_rx) = channel::unbounded::<(PathBuf, Result<RenameOutcome>)>();
        for path in &eligible {
            let _ = job_tx.send(path.clone());
        }
        drop(job_tx);

        thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                scope.spawn(move || {
                    while let Ok(path) = job_rx.recv() {
                        let outcome = self.process_file(&path, dry_run);
                        let _ = result_tx.send((path, outcome));
                    }
                });
            }
            drop(result_tx);
        });

        let mut results: Vec<(PathBuf, Result<RenameOutcome>)> = result_rx.iter().collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
        info!("批量重命名完成: {ok}/{} 成功", results.len());
        Ok(results)
    }
}

/// 从响应里解出元数据 JSON（choices[0].message.content 本身是 JSON 文本）。
pub fn parse_metadata_reply(value: &Value) -> Result<NovelMetadata, TranslationError> {
    let content = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| TranslationError::Transient("empty or malformed choices".to_string()))?;

    serde_json::from_str::<NovelMetadata>(content)
        .map_err(|e| TranslationError::Transient(format!("metadata json invalid: {e}")))
}

/// 组装规范文件名并保证唯一（冲突时追加 " (k)"）。
pub fn rename_novel_file(path: &Path, metadata: &NovelMetadata) -> Result<PathBuf> {
    let base = proposed_file_name(metadata);
    let parent = path.parent().unwrap_or_else(|| Path::new("."));

    let mut target = parent.join(&base);
    let mut counter = 1u32;
    while target.exists() {
        let stem = base.trim_end_matches(".txt");
        target = parent.join(format!("{stem} ({counter}).txt"));
        counter += 1;
    }

    fs::rename(path, &target)
        .with_context(|| format!("重命名失败: {} → {}", path.display(), target.display()))?;
    Ok(target)
}

/// `<英文书名> by <英文作者> (<罗马音作者>) - <原书名> by <原作者>.txt`
pub fn proposed_file_name(metadata: &NovelMetadata) -> String {
    let title_en = sanitize_filename(&metadata.novel_title_english);
    let author_en = sanitize_filename(&metadata.author_name_english);
    let author_roman = sanitize_filename(&metadata.author_name_romanized);
    let title_orig = sanitize_filename(&metadata.novel_title_original);
    let author_orig = sanitize_filename(&metadata.author_name_original);
    format!("{title_en} by {author_en} ({author_roman}) - {title_orig} by {author_orig}.txt")
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}
