//! 批量驱动：目录扫描、批次文件锁、逐文件重试上限、历史滚动。
//!
//! 同一工作目录同时只允许一个批次（`translation_batch.lock` 排他锁）。
//! 批次进度在每个文件前后都落盘；全部文件终态后整条记录追加到
//! `translations_chronology.yml` 并删除进度文件。

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{error, info, warn};

use super::orchestrator::Orchestrator;
use crate::translation::cost::CostTracker;

pub const LOCK_FILE: &str = "translation_batch.lock";
pub const PROGRESS_FILE: &str = "translation_batch_progress.yml";
pub const HISTORY_FILE: &str = "translations_chronology.yml";
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub path: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchProgress {
    pub created_at: String,
    pub input_folder: String,
    pub files: Vec<BatchEntry>,
}

impl BatchProgress {
    fn new(input_folder: &Path) -> Self {
        Self {
            created_at: now_rfc3339(),
            input_folder: input_folder.display().to_string(),
            files: Vec::new(),
        }
    }

    pub fn all_terminal(&self) -> bool {
        self.files
            .iter()
            .all(|f| matches!(f.status.as_str(), "completed" | "failed/skipped"))
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// 锁守卫：批次期间持有排他锁，出错/提前返回都会释放。
struct BatchLock {
    file: File,
    path: PathBuf,
}

impl BatchLock {
    fn acquire(work_dir: &Path) -> Result<Self> {
        let path = work_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("创建批次锁失败: {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!("另一个批次正在此目录运行（{} 被占用）", path.display());
        }
        Ok(Self { file, path })
    }
}

impl Drop for BatchLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// 加载或新建批次进度；首轮把目录下所有 `*.txt` 登记为 planned。
pub fn load_or_init_progress(work_dir: &Path, input_dir: &Path) -> Result<BatchProgress> {
    let progress_path = work_dir.join(PROGRESS_FILE);
    let mut progress = if progress_path.exists() {
        let raw = fs::read_to_string(&progress_path)?;
        serde_yaml::from_str(&raw).unwrap_or_else(|err| {
            warn!("批次进度文件损坏（{err}），重新开始");
            BatchProgress::new(input_dir)
        })
    } else {
        BatchProgress::new(input_dir)
    };

    if progress.files.is_empty() {
        let mut paths: Vec<PathBuf> = fs::read_dir(input_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .map(|e| e.eq_ignore_ascii_case("txt"))
                        .unwrap_or(false)
            })
            .collect();
        paths.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
        for path in paths {
            progress.files.push(BatchEntry {
                path: path.display().to_string(),
                status: "planned".to_string(),
                start_time: None,
                end_time: None,
                retry_count: 0,
                error: None,
            });
        }
    }

    Ok(progress)
}

fn persist(work_dir: &Path, progress: &BatchProgress) -> Result<()> {
    let path = work_dir.join(PROGRESS_FILE);
    let yaml = serde_yaml::to_string(progress)?;
    fs::write(&path, yaml).with_context(|| format!("写批次进度失败: {}", path.display()))
}

/// 批次终态时把记录滚进历史文件并删掉进度文件。
fn roll_over_if_done(work_dir: &Path, progress: &BatchProgress) -> Result<bool> {
    if !progress.all_terminal() || !work_dir.join(PROGRESS_FILE).exists() {
        return Ok(false);
    }
    let history_path = work_dir.join(HISTORY_FILE);
    let mut history = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&history_path)
        .with_context(|| format!("打开历史文件失败: {}", history_path.display()))?;
    history.write_all(b"---\n")?;
    history.write_all(serde_yaml::to_string(progress)?.as_bytes())?;
    let _ = fs::remove_file(work_dir.join(PROGRESS_FILE));
    info!("批次完成，记录已滚入 {}", history_path.display());
    Ok(true)
}

/// 跑一个批次。单本失败不中断批次；每本最多重试 `MAX_RETRIES` 次。
pub fn run_batch(
    input_dir: &Path,
    work_dir: &Path,
    orchestrator: &Orchestrator<'_>,
    cost: &CostTracker,
) -> Result<()> {
    if !input_dir.is_dir() {
        bail!("批量模式需要一个存在的目录: {}", input_dir.display());
    }

    let _lock = BatchLock::acquire(work_dir)?;
    let mut progress = load_or_init_progress(work_dir, input_dir)?;
    info!("批次包含 {} 个文件", progress.files.len());

    for idx in 0..progress.files.len() {
        {
            let entry = &progress.files[idx];
            if entry.status == "completed" {
                continue;
            }
            if entry.retry_count >= MAX_RETRIES {
                warn!(
                    "{} 已失败 {MAX_RETRIES} 次，标记为 failed/skipped",
                    entry.path
                );
                progress.files[idx].status = "failed/skipped".to_string();
                persist(work_dir, &progress)?;
                continue;
            }
        }

        progress.files[idx].status = "processing".to_string();
        progress.files[idx].start_time = Some(now_rfc3339());
        persist(work_dir, &progress)?;

        let path = PathBuf::from(progress.files[idx].path.clone());
        info!("处理: {}", path.display());
        let result = orchestrator.process_novel(&path);

        match result {
            Ok(true) => {
                progress.files[idx].status = "completed".to_string();
            }
            Ok(false) => {
                progress.files[idx].status = "failed/skipped".to_string();
                progress.files[idx].error = Some("one or more phases failed".to_string());
                progress.files[idx].retry_count += 1;
            }
            Err(err) => {
                error!("处理 {} 失败: {err:#}", path.display());
                progress.files[idx].status = "failed/skipped".to_string();
                progress.files[idx].error = Some(err.to_string());
                progress.files[idx].retry_count += 1;
            }
        }
        progress.files[idx].end_time = Some(now_rfc3339());
        persist(work_dir, &progress)?;
        roll_over_if_done(work_dir, &progress)?;
    }

    // 重入时可能一进来就全是终态
    roll_over_if_done(work_dir, &progress)?;

    if orchestrator.api.is_remote() && cost.summary().request_count > 0 {
        write_batch_cost_log(input_dir, &progress, orchestrator.api.model_name(), cost)?;
    }

    let completed = progress
        .files
        .iter()
        .filter(|f| f.status == "completed")
        .count();
    info!(
        "批次结束: {completed}/{} 完成",
        progress.files.len()
    );
    Ok(())
}

fn write_batch_cost_log(
    input_dir: &Path,
    progress: &BatchProgress,
    model: &str,
    cost: &CostTracker,
) -> Result<()> {
    let summary = cost.summary();
    let completed = progress
        .files
        .iter()
        .filter(|f| f.status == "completed")
        .count();
    let failed = progress
        .files
        .iter()
        .filter(|f| f.status == "failed/skipped")
        .count();

    let mut log = String::new();
    log.push_str("Batch Translation Cost Summary\n");
    log.push_str("==============================\n\n");
    log.push_str(&format!("Batch Directory: {}\n", input_dir.display()));
    log.push_str(&format!("Date: {}\n", now_rfc3339()));
    log.push_str(&format!("Model: {model}\n\n"));
    log.push_str(&format!("Total Files: {}\n", progress.files.len()));
    log.push_str(&format!("Completed: {completed}\n"));
    log.push_str(&format!("Failed/Skipped: {failed}\n\n"));
    log.push_str(&format!("total_cost: {}\n", summary.total_cost));
    log.push_str(&format!("total_tokens: {}\n", summary.total_tokens));
    log.push_str(&format!("prompt_tokens: {}\n", summary.prompt_tokens));
    log.push_str(&format!("completion_tokens: {}\n", summary.completion_tokens));
    log.push_str(&format!("request_count: {}\n", summary.request_count));
    if completed > 0 {
        log.push_str(&format!(
            "average_cost_per_novel: ${:.6}\n",
            summary.total_cost / completed as f64
        ));
        log.push_str(&format!(
            "average_tokens_per_novel: {}\n",
            summary.total_tokens / completed as u64
        ));
    }

    let path = input_dir.join("BATCH_AI_COSTS.log");
    fs::write(&path, log)?;
    info!("批次费用汇总已保存: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::context::Config;
    use crate::pipeline::orchestrator::PhaseFlags;
    use crate::translation::client::{TranslateApi, TranslationError};

    struct EchoApi;

    impl TranslateApi for EchoApi {
        fn translate_messages(
            &self,
            _prompt: &str,
            _is_last_chunk: bool,
        ) -> Result<String, TranslationError> {
            Ok("Chapter 1\nSome translated body text.".to_string())
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
    fn progress_registers_txt_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "b").unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("c.md"), "c").unwrap();

        let progress = load_or_init_progress(dir.path(), dir.path()).unwrap();
        let names: Vec<&str> = progress
            .files
            .iter()
            .map(|f| Path::new(&f.path).file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt"]);
        assert!(progress.files.iter().all(|f| f.status == "planned"));
    }

    #[test]
    fn batch_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = BatchLock::acquire(dir.path()).unwrap();
        assert!(BatchLock::acquire(dir.path()).is_err());
        drop(first);
        assert!(BatchLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn completed_batch_rolls_into_history() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("novels");
        fs::create_dir(&input).unwrap();
        fs::write(
            input.join("Book by Writer (Roman) - 原名 by 作者.txt"),
            "第一章\n\n正文。",
        )
        .unwrap();

        let config = Config::default();
        let cost = CostTracker::new();
        let api = EchoApi;
        let orchestrator = Orchestrator {
            config: &config,
            api: &api,
            cost: &cost,
            flags: PhaseFlags {
                skip_renaming: true,
                ..Default::default()
            },
            openai_api_key: None,
        };

        run_batch(&input, dir.path(), &orchestrator, &cost).unwrap();

        assert!(!dir.path().join(PROGRESS_FILE).exists());
        let history = fs::read_to_string(dir.path().join(HISTORY_FILE)).unwrap();
        assert!(history.starts_with("---\n"));
        assert!(history.contains("status: completed"));
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn batch_processes_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("novels");
        fs::create_dir(&input).unwrap();
        fs::write(
            input.join("A by W (R) - 甲 by 作.txt"),
            "第一章\n\n甲正文。",
        )
        .unwrap();
        fs::write(
            input.join("B by W (R) - 乙 by 作.txt"),
            "第一章\n\n乙正文。",
        )
        .unwrap();

        let config = Config::default();
        let cost = CostTracker::new();
        let api = EchoApi;
        let orchestrator = Orchestrator {
            config: &config,
            api: &api,
            cost: &cost,
            flags: PhaseFlags {
                skip_renaming: true,
                ..Default::default()
            },
            openai_api_key: None,
        };

        run_batch(&input, dir.path(), &orchestrator, &cost).unwrap();
        let history = fs::read_to_string(dir.path().join(HISTORY_FILE)).unwrap();
        assert_eq!(history.matches("path:").count(), 2);
    }
}
