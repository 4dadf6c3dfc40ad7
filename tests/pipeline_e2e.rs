//! 端到端流程测试：中文源文件 → 重命名 → 分片翻译 → EPUB。
//!
//! 翻译端点用脚本化实现替代，不走网络。

use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use novel_translator::base_system::book_meta::{canonical_name_re, split_bilingual_filename};
use novel_translator::base_system::context::Config;
use novel_translator::epub::sequence::detect_issues;
use novel_translator::pipeline::novel::chunk_file_name;
use novel_translator::pipeline::orchestrator::{Orchestrator, PhaseFlags, progress_path};
use novel_translator::pipeline::renamer::{NovelMetadata, rename_novel_file};
use novel_translator::translation::client::{TranslateApi, TranslationError};
use novel_translator::translation::cost::CostTracker;

/// 每次调用产出一个编号递增的英文章节。
struct ChapterApi {
    calls: AtomicUsize,
}

impl ChapterApi {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

impl TranslateApi for ChapterApi {
    fn translate_messages(
        &self,
        _prompt: &str,
        _is_last_chunk: bool,
    ) -> Result<String, TranslationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!(
            "Chapter {n}\nThe hero pressed onward through trial number {n}, and the mountains \
bowed before the sheer weight of his resolve.\n"
        ))
    }

    fn model_name(&self) -> &str {
        "scripted"
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

fn chinese_novel_text() -> String {
    let mut text = String::new();
    for n in 1..=3 {
        text.push_str(&format!("第{n}章 试炼\n\n"));
        text.push_str(&"修炼之路漫漫，少年负剑前行。".repeat(6));
        text.push_str("\n\n");
    }
    text
}

#[test]
fn renaming_produces_canonical_filename() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("测试小说.txt");
    fs::write(&source, chinese_novel_text()).unwrap();

    let metadata = NovelMetadata {
        novel_title_original: "测试小说".into(),
        novel_title_english: "Cultivation Supreme".into(),
        author_name_original: "未知作者".into(),
        author_name_romanized: "Weizhi Zuozhe".into(),
        author_name_english: "Unknown Author".into(),
    };
    let renamed = rename_novel_file(&source, &metadata).unwrap();

    let name = renamed.file_name().unwrap().to_str().unwrap();
    assert_eq!(
        name,
        "Cultivation Supreme by Unknown Author (Weizhi Zuozhe) - 测试小说 by 未知作者.txt"
    );
    assert!(canonical_name_re().is_match(name));

    // 文件名可以无损拆回双语元数据
    let parts = split_bilingual_filename(&renamed);
    assert_eq!(parts.english_title, "Cultivation Supreme");
    assert_eq!(parts.original_author, "未知作者");
}

#[test]
fn translation_and_epub_phases_produce_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let novel = dir.path().join(
        "Cultivation Supreme by Unknown Author (Weizhi Zuozhe) - 测试小说 by 未知作者.txt",
    );
    fs::write(&novel, chinese_novel_text()).unwrap();

    // 每个中文章节约 90 字，压小分片预算让三章各占一个分片
    let config = Config {
        max_chars: 100,
        ..Default::default()
    };
    let cost = CostTracker::new();
    let api = ChapterApi::new();
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

    assert!(orchestrator.process_novel(&novel).unwrap());

    // 阶段 2：分片文件密集编号
    let book_dir = dir.path().join("Cultivation Supreme by Unknown Author");
    assert!(book_dir.is_dir());
    for n in 1..=3 {
        assert!(
            book_dir
                .join(chunk_file_name(
                    "Cultivation Supreme",
                    "Unknown Author",
                    n
                ))
                .exists(),
            "missing chunk {n}"
        );
    }
    assert!(
        book_dir
            .join("translated_Cultivation Supreme by Unknown Author.txt")
            .exists()
    );

    // 阶段 3：EPUB 结构
    let epub_path = dir.path().join("Cultivation Supreme.epub");
    assert!(epub_path.exists());
    let mut archive = zip::ZipArchive::new(fs::File::open(&epub_path).unwrap()).unwrap();
    assert_eq!(archive.by_index(0).unwrap().name(), "mimetype");
    let mut opf = String::new();
    archive
        .by_name("OEBPS/content.opf")
        .unwrap()
        .read_to_string(&mut opf)
        .unwrap();
    assert!(opf.contains("<dc:title>Cultivation Supreme</dc:title>"));
    for n in 1..=3 {
        assert!(
            archive
                .by_name(&format!("OEBPS/Text/chapter{n}.xhtml"))
                .is_ok()
        );
    }
}

#[test]
fn resume_retranslates_only_the_missing_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let novel = dir
        .path()
        .join("Resume Test by Author (Roman) - 续传 by 作者.txt");
    fs::write(&novel, chinese_novel_text()).unwrap();

    let config = Config {
        max_chars: 100,
        ..Default::default()
    };
    let cost = CostTracker::new();

    let api = ChapterApi::new();
    let orchestrator = Orchestrator {
        config: &config,
        api: &api,
        cost: &cost,
        flags: PhaseFlags {
            skip_renaming: true,
            skip_epub: true,
            ..Default::default()
        },
        openai_api_key: None,
    };
    assert!(orchestrator.process_novel(&novel).unwrap());
    assert_eq!(api.calls.load(Ordering::SeqCst), 3);

    // 删除第 2 个分片并以续传模式重跑：只重翻被删的那一片
    let book_dir = dir.path().join("Resume Test by Author");
    fs::remove_file(book_dir.join(chunk_file_name("Resume Test", "Author", 2))).unwrap();
    let _ = fs::remove_file(progress_path(&novel));

    let api2 = ChapterApi::new();
    let orchestrator2 = Orchestrator {
        config: &config,
        api: &api2,
        cost: &cost,
        flags: PhaseFlags {
            skip_renaming: true,
            skip_epub: true,
            resume: true,
            ..Default::default()
        },
        openai_api_key: None,
    };
    assert!(orchestrator2.process_novel(&novel).unwrap());
    assert_eq!(api2.calls.load(Ordering::SeqCst), 1);
    assert!(book_dir.join(chunk_file_name("Resume Test", "Author", 2)).exists());
}

#[test]
fn sequence_validation_scenarios() {
    // S2
    assert_eq!(
        detect_issues(&[1, 3, 5]),
        vec![
            "number 2 is missing".to_string(),
            "number 4 is missing".to_string(),
        ]
    );
    // S3
    let issues = detect_issues(&[1, 3, 2, 4]);
    assert!(issues.contains(&"number 2 is switched in place with number 3".to_string()));
    assert!(issues.contains(&"number 3 is switched in place with number 2".to_string()));
}
