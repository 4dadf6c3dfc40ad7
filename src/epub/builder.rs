//! EPUB-2 打包：收集分片 → 章节识别/校验 → zip 组装。
//!
//! 布局契约：`mimetype`（首个条目、不压缩）、`META-INF/container.xml`、
//! `OEBPS/content.opf`、`OEBPS/toc.ncx`、`OEBPS/Styles/style.css`、
//! 每章一个 `OEBPS/Text/chapter<i>.xhtml`，可选封面。

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{info, warn};
use uuid::Uuid;
use zip::CompressionMethod;
use zip::write::FileOptions;

use super::detector::split_chapters;
use super::sequence::detect_issues;
use super::xhtml::{
    self, DEFAULT_CSS, MIMETYPE, ManifestItem, NavPoint, OpfExtras, paragraph_lines,
};

#[derive(Debug, Error)]
pub enum EpubError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("{0:?} sequence issue(s) found in strict mode")]
    StrictIssues(Vec<String>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error(transparent)]
    Xml(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct EpubOptions {
    pub title: String,
    pub author: String,
    pub language: String,
    pub cover: Option<PathBuf>,
    pub custom_css: Option<String>,
    pub extras: OpfExtras,
    pub generate_toc: bool,
    pub strict: bool,
}

impl Default for EpubOptions {
    fn default() -> Self {
        Self {
            title: "Untitled".to_string(),
            author: "Unknown".to_string(),
            language: "en".to_string(),
            cover: None,
            custom_css: None,
            extras: OpfExtras::default(),
            generate_toc: true,
            strict: true,
        }
    }
}

/// 分片文件名：`<书名> by <作者> - Chunk_000001.txt`。
pub fn chunk_file_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<title>.+?) by (?P<author>.+?) - Chunk_(?P<num>\d{6})\.txt$").unwrap()
    })
}

/// 收集目录下的分片文件，按编号排序。空文件与不合名的文件跳过并告警。
pub fn collect_chunks(dir: &Path) -> Result<BTreeMap<u32, PathBuf>, EpubError> {
    if !dir.is_dir() {
        return Err(EpubError::Validation(format!(
            "directory '{}' not found or not a directory",
            dir.display()
        )));
    }

    let mut mapping = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.to_lowercase().ends_with(".txt") {
            continue;
        }
        let Some(caps) = chunk_file_re().captures(name) else {
            warn!("忽略不合命名规则的文件: {name}");
            continue;
        };
        if entry.metadata()?.len() == 0 {
            warn!("忽略空分片文件: {name}");
            continue;
        }
        let Ok(num) = caps["num"].parse::<u32>() else {
            continue;
        };
        mapping.insert(num, path);
    }

    if mapping.is_empty() {
        return Err(EpubError::Validation("no valid .txt chunks found".to_string()));
    }
    Ok(mapping)
}

/// 从分片目录合成 EPUB。书名/作者缺省时从首个分片的文件名推断。
pub fn create_epub_from_directory(
    dir: &Path,
    output: &Path,
    mut options: EpubOptions,
) -> Result<Vec<String>, EpubError> {
    let chunks = collect_chunks(dir)?;

    if (options.title == "Untitled" || options.author == "Unknown")
        && let Some(first) = chunks.values().next()
    {
        if let Some(name) = first.file_name().and_then(|n| n.to_str())
            && let Some(caps) = chunk_file_re().captures(name)
        {
            if options.title == "Untitled" {
                options.title = caps["title"].to_string();
            }
            if options.author == "Unknown" {
                options.author = caps["author"].to_string();
            }
        }
    }

    let mut combined = Vec::with_capacity(chunks.len());
    for path in chunks.values() {
        combined.push(fs::read_to_string(path)?);
    }
    create_epub_from_text(&combined.join("\n"), output, &options)
}

/// 从完整译文文件合成 EPUB。
pub fn create_epub_from_txt_file(
    txt_path: &Path,
    output: &Path,
    options: &EpubOptions,
) -> Result<Vec<String>, EpubError> {
    if !txt_path.is_file() {
        return Err(EpubError::Validation(format!(
            "input file not found: {}",
            txt_path.display()
        )));
    }
    let text = fs::read_to_string(txt_path)?;
    create_epub_from_text(&text, output, options)
}

/// 核心路径：切章 → 校验 → 打包。返回非致命的序号异常列表。
pub fn create_epub_from_text(
    text: &str,
    output: &Path,
    options: &EpubOptions,
) -> Result<Vec<String>, EpubError> {
    if let Some(cover) = &options.cover {
        ensure_cover_ok(cover)?;
    }

    let text = xhtml::strip_html_unescape(text);
    let (blocks, seq) = split_chapters(&text, options.generate_toc);

    let issues = if options.generate_toc {
        detect_issues(&seq)
    } else {
        Vec::new()
    };
    for issue in &issues {
        warn!("章节序号异常: {issue}");
    }
    if options.strict && !issues.is_empty() {
        return Err(EpubError::StrictIssues(issues));
    }

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    write_epub(&blocks, output, options)?;
    info!("EPUB 已生成: {}", output.display());
    Ok(issues)
}

fn ensure_cover_ok(cover: &Path) -> Result<(), EpubError> {
    if !cover.is_file() {
        return Err(EpubError::Validation(format!(
            "cover '{}' is not a file",
            cover.display()
        )));
    }
    let ext = cover
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    if !matches!(ext.as_str(), "jpg" | "jpeg" | "png") {
        return Err(EpubError::Validation(
            "cover must be .jpg/.jpeg/.png".to_string(),
        ));
    }
    Ok(())
}

fn write_epub(
    blocks: &[(String, String)],
    output: &Path,
    options: &EpubOptions,
) -> Result<(), EpubError> {
    let uid = Uuid::new_v4().to_string();
    let date = OffsetDateTime::now_utc()
        .format(format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
        ))
        .map_err(|e| EpubError::Validation(e.to_string()))?;

    let file = File::create(output)?;
    let mut zip = zip::ZipWriter::new(file);
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

    // mimetype 必须是首个条目且不压缩
    zip.start_file("mimetype", stored)?;
    std::io::Write::write_all(&mut zip, MIMETYPE.as_bytes())?;

    zip.start_file("META-INF/container.xml", deflated)?;
    std::io::Write::write_all(&mut zip, xhtml::build_container_xml()?.as_bytes())?;

    let css = options.custom_css.as_deref().unwrap_or(DEFAULT_CSS);
    zip.start_file("OEBPS/Styles/style.css", deflated)?;
    std::io::Write::write_all(&mut zip, css.as_bytes())?;

    let mut manifest = vec![
        ManifestItem {
            id: "ncx".into(),
            href: "toc.ncx".into(),
            media_type: "application/x-dtbncx+xml".into(),
        },
        ManifestItem {
            id: "css".into(),
            href: "Styles/style.css".into(),
            media_type: "text/css".into(),
        },
    ];
    let mut spine: Vec<String> = Vec::new();
    let mut nav: Vec<NavPoint> = Vec::new();
    let mut cover_id = None;

    if let Some(cover) = &options.cover {
        let cover_name = cover
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("cover.jpg")
            .to_string();
        let img_rel = format!("Images/{cover_name}");
        let mime = if cover_name.to_lowercase().ends_with(".png") {
            "image/png"
        } else {
            "image/jpeg"
        };

        zip.start_file(format!("OEBPS/{img_rel}"), deflated)?;
        std::io::Write::write_all(&mut zip, &fs::read(cover)?)?;

        zip.start_file("OEBPS/Text/cover.xhtml", deflated)?;
        std::io::Write::write_all(&mut zip, xhtml::build_cover_xhtml(&img_rel)?.as_bytes())?;

        manifest.push(ManifestItem {
            id: "cover-img".into(),
            href: img_rel,
            media_type: mime.into(),
        });
        manifest.push(ManifestItem {
            id: "coverpage".into(),
            href: "Text/cover.xhtml".into(),
            media_type: "application/xhtml+xml".into(),
        });
        spine.push("coverpage".to_string());
        cover_id = Some("cover-img");
    }

    for (idx, (title, content)) in blocks.iter().enumerate() {
        let n = idx + 1;
        let href = format!("Text/chapter{n}.xhtml");
        let paragraphs = paragraph_lines(content);
        zip.start_file(format!("OEBPS/{href}"), deflated)?;
        std::io::Write::write_all(&mut zip, xhtml::build_chap_xhtml(title, &paragraphs)?.as_bytes())?;

        manifest.push(ManifestItem {
            id: format!("chap{n}"),
            href: href.clone(),
            media_type: "application/xhtml+xml".into(),
        });
        spine.push(format!("chap{n}"));
        nav.push(NavPoint {
            id: format!("nav{n}"),
            play_order: n,
            label: title.clone(),
            src: href,
        });
    }

    zip.start_file("OEBPS/content.opf", deflated)?;
    std::io::Write::write_all(
        &mut zip,
        xhtml::build_content_opf(
            &options.title,
            &options.author,
            &options.language,
            &uid,
            &date,
            &manifest,
            &spine,
            cover_id,
            &options.extras,
        )?
        .as_bytes(),
    )?;

    zip.start_file("OEBPS/toc.ncx", deflated)?;
    std::io::Write::write_all(
        &mut zip,
        xhtml::build_toc_ncx(&options.title, &options.author, &uid, &nav)?.as_bytes(),
    )?;

    zip.finish()?;
    Ok(())
}
