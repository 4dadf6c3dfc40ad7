//! 三阶段编排：重命名 → 翻译 → EPUB，每本书带可续传的进度文件。
//!
//! 进度文件 `.{stem}_progress.yml` 与源文件同目录，只由本模块改写；
//! 三个阶段全部终态（completed/skipped）后删除。

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::novel::NovelTranslator;
use super::renamer::{RenameOutcome, Renamer};
use crate::base_system::book_meta::split_bilingual_filename;
use crate::base_system::context::{Config, sanitize_filename};
use crate::epub::builder::{EpubError, EpubOptions, create_epub_from_directory};
use crate::translation::client::TranslateApi;
use crate::translation::cost::CostTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for PhaseState {
    fn default() -> Self {
        Self {
            status: PhaseStatus::Pending,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phases {
    #[serde(default)]
    pub renaming: PhaseState,
    #[serde(default)]
    pub translation: PhaseState,
    #[serde(default)]
    pub epub: PhaseState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NovelProgress {
    pub original_file: String,
    pub phases: Phases,
}

impl NovelProgress {
    fn new(file: &Path) -> Self {
        Self {
            original_file: file.display().to_string(),
            phases: Phases {
                renaming: PhaseState::default(),
                translation: PhaseState::default(),
                epub: PhaseState::default(),
            },
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.phases.renaming.status.is_terminal()
            && self.phases.translation.status.is_terminal()
            && self.phases.epub.status.is_terminal()
    }
}

/// 每本书的进度文件位置：`.{stem}_progress.yml`，与源文件同目录。
pub fn progress_path(file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "novel".to_string());
    file.parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".{stem}_progress.yml"))
}

pub fn load_progress(path: &Path) -> Option<NovelProgress> {
    let raw = fs::read_to_string(path).ok()?;
    serde_yaml::from_str(&raw).ok()
}

fn save_progress(path: &Path, progress: &NovelProgress) -> Result<()> {
    let yaml = serde_yaml::to_string(progress)?;
    fs::write(path, yaml).with_context(|| format!("写进度文件失败: {}", path.display()))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseFlags {
    pub skip_renaming: bool,
    pub skip_translating: bool,
    pub skip_epub: bool,
    pub resume: bool,
}

pub struct Orchestrator<'a> {
    pub config: &'a Config,
    pub api: &'a dyn TranslateApi,
    pub cost: &'a CostTracker,
    pub flags: PhaseFlags,
    pub openai_api_key: Option<String>,
}

impl<'a> Orchestrator<'a> {
    /// 处理单个文件的三个阶段。返回 Ok(true) 表示全部启用阶段成功。
    pub fn process_novel(&self, file: &Path) -> Result<bool> {
        let progress_file = progress_path(file);
        let mut progress = if self.flags.resume && progress_file.exists() {
            load_progress(&progress_file).unwrap_or_else(|| NovelProgress::new(file))
        } else {
            NovelProgress::new(file)
        };

        // 重命名阶段已完成时沿用改名后的路径
        let mut current_path = file.to_path_buf();
        if progress.phases.renaming.status == PhaseStatus::Completed
            && let Some(renamed) = &progress.phases.renaming.result
        {
            let renamed = PathBuf::from(renamed);
            if renamed.exists() {
                info!("续传：使用已重命名文件 {}", renamed.display());
                current_path = renamed;
            }
        }

        // 阶段 1：重命名
        if !self.flags.skip_renaming
            && progress.phases.renaming.status != PhaseStatus::Completed
        {
            info!("阶段 1：重命名 {}", file.display());
            match self.run_renaming(&current_path) {
                Ok(Some(new_path)) => {
                    progress.phases.renaming.status = PhaseStatus::Completed;
                    progress.phases.renaming.result =
                        Some(new_path.display().to_string());
                    current_path = new_path;
                }
                Ok(None) => {
                    // 已符合规范或 dry-run：算完成，路径不变
                    progress.phases.renaming.status = PhaseStatus::Completed;
                    progress.phases.renaming.result =
                        Some(current_path.display().to_string());
                }
                Err(err) => {
                    error!("重命名失败: {err:#}");
                    progress.phases.renaming.status = PhaseStatus::Failed;
                    progress.phases.renaming.error = Some(err.to_string());
                    save_progress(&progress_file, &progress)?;
                    if !self.flags.resume {
                        return Ok(false);
                    }
                }
            }
            save_progress(&progress_file, &progress)?;
        }

        // 阶段 2：翻译
        if !self.flags.skip_translating
            && progress.phases.translation.status != PhaseStatus::Completed
        {
            info!("阶段 2：翻译 {}", current_path.display());
            let translator = NovelTranslator::new(self.config, self.api, self.cost.clone());
            match translator.translate_file(&current_path, self.flags.resume) {
                Ok(outcome) => {
                    progress.phases.translation.status = PhaseStatus::Completed;
                    progress.phases.translation.result = Some(outcome.book_id);
                    info!("翻译完成，共 {} 个分片", outcome.chunk_total);
                }
                Err(err) => {
                    error!("翻译失败: {err:#}");
                    progress.phases.translation.status = PhaseStatus::Failed;
                    progress.phases.translation.error = Some(err.to_string());
                    save_progress(&progress_file, &progress)?;
                    if !self.flags.resume {
                        return Ok(false);
                    }
                }
            }
            save_progress(&progress_file, &progress)?;
        }

        // 阶段 3：EPUB
        if !self.flags.skip_epub && progress.phases.epub.status != PhaseStatus::Completed {
            info!("阶段 3：生成 EPUB {}", current_path.display());
            match self.run_epub(&current_path) {
                Ok(Some(epub_path)) => {
                    progress.phases.epub.status = PhaseStatus::Completed;
                    progress.phases.epub.result = Some(epub_path.display().to_string());
                }
                Ok(None) => {
                    warn!("未找到翻译产物目录，跳过 EPUB 生成");
                    progress.phases.epub.status = PhaseStatus::Skipped;
                    progress.phases.epub.error = Some("no chapters found".to_string());
                }
                Err(err) => {
                    error!("EPUB 生成失败: {err:#}");
                    progress.phases.epub.status = PhaseStatus::Failed;
                    progress.phases.epub.error = Some(err.to_string());
                    save_progress(&progress_file, &progress)?;
                    if !self.flags.resume {
                        return Ok(false);
                    }
                }
            }
            save_progress(&progress_file, &progress)?;
        }

        if progress.all_terminal() && progress_file.exists() {
            let _ = fs::remove_file(&progress_file);
            info!("全部阶段完成，进度文件已删除");
        }

        Ok(!matches!(progress.phases.renaming.status, PhaseStatus::Failed)
            && !matches!(progress.phases.translation.status, PhaseStatus::Failed)
            && !matches!(progress.phases.epub.status, PhaseStatus::Failed))
    }

    /// 返回 Ok(Some(path)) 表示改了名；Ok(None) 表示无需改名。
    fn run_renaming(&self, path: &Path) -> Result<Option<PathBuf>> {
        let Some(api_key) = self.openai_api_key.clone() else {
            anyhow::bail!(
                "重命名需要 OpenAI API key（--openai-api-key 或 OPENAI_API_KEY 环境变量）"
            );
        };
        let renamer = Renamer::new(self.config, api_key)?;
        match renamer.process_file(path, false)? {
            RenameOutcome::Renamed { new_path, .. } => Ok(Some(new_path)),
            RenameOutcome::AlreadyCanonical | RenameOutcome::DryRun(_) => Ok(None),
        }
    }

    /// 在翻译产物目录上构建 EPUB。目录不存在时返回 Ok(None)。
    fn run_epub(&self, current_path: &Path) -> Result<Option<PathBuf>> {
        let parts = split_bilingual_filename(current_path);
        let title = if parts.english_title == "n.d." {
            current_path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "Untitled".to_string())
        } else {
            parts.english_title.clone()
        };
        let author = if parts.english_author == "n.d." {
            "Unknown".to_string()
        } else {
            parts.english_author.clone()
        };

        let parent = current_path.parent().unwrap_or_else(|| Path::new("."));
        let book_dir = parent.join(sanitize_filename(&format!("{title} by {author}")));
        if !book_dir.is_dir() {
            return Ok(None);
        }

        let epub_path = parent.join(format!("{}.epub", sanitize_filename(&title)));
        let options = EpubOptions {
            title: sanitize_filename(&title),
            author: author.clone(),
            language: self.config.epub_language.clone(),
            cover: (!self.config.epub_cover.trim().is_empty())
                .then(|| PathBuf::from(&self.config.epub_cover)),
            custom_css: read_custom_css(&self.config.epub_custom_css),
            extras: Default::default(),
            generate_toc: true,
            strict: self.config.epub_strict && !self.flags.resume,
        };

        match create_epub_from_directory(&book_dir, &epub_path, options) {
            Ok(issues) => {
                if !issues.is_empty() {
                    warn!("EPUB 带 {} 个校验警告生成", issues.len());
                }
                Ok(Some(epub_path))
            }
            Err(EpubError::StrictIssues(issues)) => {
                anyhow::bail!("章节序号校验未通过（{} 个问题）: {issues:?}", issues.len())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn read_custom_css(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }
    match fs::read_to_string(path) {
        Ok(css) => Some(css),
        Err(err) => {
            warn!("读取自定义 CSS 失败（{path}）: {err}，使用内置样式");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::client::TranslationError;

    struct EchoApi;

    impl TranslateApi for EchoApi {
        fn translate_messages(
            &self,
            _prompt: &str,
            _is_last_chunk: bool,
        ) -> Result<String, TranslationError> {
            Ok("Chapter 1\nA translated chapter body with plenty of text.".to_string())
        }

        fn model_name(&self) -> &str {
            "echo"
        }

        fn is_remote(&self) -> bool {
            false
        }

        fn first_pass_prompt(&self) -> &str {
            ""
        }

        fn second_pass_prompt(&self) -> &str {
            ""
        }
    }

    #[test]
    fn progress_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let novel = dir.path().join("测试小说.txt");
        fs::write(&novel, "正文").unwrap();

        let p = progress_path(&novel);
        assert_eq!(
            p.file_name().unwrap().to_str().unwrap(),
            ".测试小说_progress.yml"
        );

        let mut progress = NovelProgress::new(&novel);
        progress.phases.renaming.status = PhaseStatus::Completed;
        progress.phases.renaming.result = Some("renamed.txt".to_string());
        save_progress(&p, &progress).unwrap();

        let loaded = load_progress(&p).unwrap();
        assert_eq!(loaded.phases.renaming.status, PhaseStatus::Completed);
        assert_eq!(loaded.phases.renaming.result.as_deref(), Some("renamed.txt"));
        assert_eq!(loaded.phases.translation.status, PhaseStatus::Pending);
        assert!(!loaded.all_terminal());
    }

    #[test]
    fn enabled_phases_run_and_record_progress() {
        let dir = tempfile::tempdir().unwrap();
        let novel = dir
            .path()
            .join("Novel by Author (Roman) - 原名 by 原作者.txt");
        fs::write(&novel, "第一章 内容\n\n正文段落。").unwrap();

        let config = Config::default();
        let cost = CostTracker::new();
        let api = EchoApi;
        let orchestrator = Orchestrator {
            config: &config,
            api: &api,
            cost: &cost,
            flags: PhaseFlags {
                skip_renaming: true, // 已符合规范名，跳过避免走网络
                skip_translating: false,
                skip_epub: false,
                resume: false,
            },
            openai_api_key: None,
        };

        let ok = orchestrator.process_novel(&novel).unwrap();
        assert!(ok);

        // 翻译产物
        let book_dir = dir.path().join("Novel by Author");
        assert!(book_dir.is_dir());
        assert!(book_dir.join("Novel by Author - Chunk_000001.txt").exists());

        // EPUB 产物
        assert!(dir.path().join("Novel.epub").exists());

        // 用命令行跳过（而非完成）的阶段不算终态，进度文件保留
        let progress = load_progress(&progress_path(&novel)).unwrap();
        assert_eq!(progress.phases.translation.status, PhaseStatus::Completed);
        assert_eq!(progress.phases.epub.status, PhaseStatus::Completed);
        assert_eq!(progress.phases.renaming.status, PhaseStatus::Pending);
    }

    #[test]
    fn all_terminal_progress_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let novel = dir.path().join("done.txt");
        fs::write(&novel, "x").unwrap();
        let p = progress_path(&novel);

        let mut progress = NovelProgress::new(&novel);
        progress.phases.renaming.status = PhaseStatus::Completed;
        progress.phases.translation.status = PhaseStatus::Completed;
        progress.phases.epub.status = PhaseStatus::Skipped;
        assert!(progress.all_terminal());
        save_progress(&p, &progress).unwrap();
        assert!(p.exists());
    }
}
