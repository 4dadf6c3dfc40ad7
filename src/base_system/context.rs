//! 全局配置结构（Config）与默认值。
//!
//! 该模块同时提供生成 `config.yml` 的字段元信息。

use serde::{Deserialize, Serialize};

use super::config::{ConfigSpec, FieldMeta};

/// 单个翻译分片的字符数硬上限（必须严格小于 12000）。
pub const MAX_CHARS_CEILING: usize = 12_000;
pub const DEFAULT_MAX_CHARS: usize = 11_999;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // 分片配置
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_split_mode")]
    pub split_mode: String,
    #[serde(default = "default_split_method")]
    pub split_method: String,
    #[serde(default = "default_string")]
    pub default_encoding: String,

    // 翻译 API 配置
    #[serde(default = "default_local_endpoint")]
    pub local_endpoint: String,
    #[serde(default = "default_local_model")]
    pub local_model: String,
    #[serde(default = "default_remote_endpoint")]
    pub remote_endpoint: String,
    #[serde(default = "default_remote_model")]
    pub remote_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,
    #[serde(default = "default_true")]
    pub remote_double_pass: bool,
    #[serde(default = "default_false")]
    pub local_double_pass: bool,

    // 重试配置
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_wall_clock_budget")]
    pub wall_clock_budget_secs: u64,
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,

    // 输出校验配置
    #[serde(default = "default_non_latin_threshold")]
    pub non_latin_threshold: f64,
    #[serde(default = "default_min_reply_chars")]
    pub min_reply_chars: usize,

    // 重命名配置
    #[serde(default = "default_rename_endpoint")]
    pub rename_endpoint: String,
    #[serde(default = "default_rename_model")]
    pub rename_model: String,
    #[serde(default = "default_kb_to_read")]
    pub rename_kb_to_read: u64,
    #[serde(default = "default_min_file_size_kb")]
    pub rename_min_file_size_kb: u64,
    #[serde(default = "default_zero")]
    pub rename_workers: usize,

    // EPUB 配置
    #[serde(default = "default_epub_language")]
    pub epub_language: String,
    #[serde(default = "default_true")]
    pub epub_strict: bool,
    #[serde(default = "default_string")]
    pub epub_custom_css: String,
    #[serde(default = "default_string")]
    pub epub_cover: String,

    // 进程守护配置
    #[serde(default = "default_false")]
    pub guardian_enabled: bool,
    #[serde(default = "default_guardian_max_concurrent")]
    pub guardian_max_concurrent: usize,
    #[serde(default = "default_guardian_max_total_memory_mb")]
    pub guardian_max_total_memory_mb: u64,
    #[serde(default = "default_guardian_timeout")]
    pub guardian_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            split_mode: default_split_mode(),
            split_method: default_split_method(),
            default_encoding: default_string(),
            local_endpoint: default_local_endpoint(),
            local_model: default_local_model(),
            remote_endpoint: default_remote_endpoint(),
            remote_model: default_remote_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            connection_timeout: default_connection_timeout(),
            response_timeout: default_response_timeout(),
            remote_double_pass: default_true(),
            local_double_pass: default_false(),
            max_retries: default_max_retries(),
            wall_clock_budget_secs: default_wall_clock_budget(),
            max_chunk_retries: default_max_chunk_retries(),
            non_latin_threshold: default_non_latin_threshold(),
            min_reply_chars: default_min_reply_chars(),
            rename_endpoint: default_rename_endpoint(),
            rename_model: default_rename_model(),
            rename_kb_to_read: default_kb_to_read(),
            rename_min_file_size_kb: default_min_file_size_kb(),
            rename_workers: default_zero(),
            epub_language: default_epub_language(),
            epub_strict: default_true(),
            epub_custom_css: default_string(),
            epub_cover: default_string(),
            guardian_enabled: default_false(),
            guardian_max_concurrent: default_guardian_max_concurrent(),
            guardian_max_total_memory_mb: default_guardian_max_total_memory_mb(),
            guardian_timeout_secs: default_guardian_timeout(),
        }
    }
}

impl ConfigSpec for Config {
    const FILE_NAME: &'static str = "config.yml";

    fn fields() -> &'static [FieldMeta] {
        static FIELDS: [FieldMeta; 32] = [
            FieldMeta {
                name: "max_chars",
                description: "单个翻译分片的最大字符数（必须小于 12000）",
            },
            FieldMeta {
                name: "split_mode",
                description: "分片模式, 可选: [PARAGRAPHS, SPLIT_POINTS]",
            },
            FieldMeta {
                name: "split_method",
                description: "段落检测方式, 可选: [paragraph, punctuation]",
            },
            FieldMeta {
                name: "default_encoding",
                description: "输入文件编码（留空自动检测）",
            },
            FieldMeta {
                name: "local_endpoint",
                description: "本地翻译 API 地址（OpenAI 兼容）",
            },
            FieldMeta {
                name: "local_model",
                description: "本地翻译模型名称",
            },
            FieldMeta {
                name: "remote_endpoint",
                description: "远程翻译 API 地址（OpenRouter）",
            },
            FieldMeta {
                name: "remote_model",
                description: "远程翻译模型名称",
            },
            FieldMeta {
                name: "temperature",
                description: "翻译请求 temperature",
            },
            FieldMeta {
                name: "max_tokens",
                description: "翻译请求 max_tokens",
            },
            FieldMeta {
                name: "connection_timeout",
                description: "连接超时（秒）",
            },
            FieldMeta {
                name: "response_timeout",
                description: "响应超时（秒）",
            },
            FieldMeta {
                name: "remote_double_pass",
                description: "远程翻译是否执行二次精修",
            },
            FieldMeta {
                name: "local_double_pass",
                description: "本地翻译是否执行二次精修",
            },
            FieldMeta {
                name: "max_retries",
                description: "单次请求最大重试次数",
            },
            FieldMeta {
                name: "wall_clock_budget_secs",
                description: "单个逻辑请求的总时间预算（秒）",
            },
            FieldMeta {
                name: "max_chunk_retries",
                description: "单个分片翻译的最大重试次数",
            },
            FieldMeta {
                name: "non_latin_threshold",
                description: "非拉丁字符占比阈值，超过则判定翻译失败",
            },
            FieldMeta {
                name: "min_reply_chars",
                description: "非末尾分片的最小返回字符数",
            },
            FieldMeta {
                name: "rename_endpoint",
                description: "元数据提取 API 地址（OpenAI 兼容）",
            },
            FieldMeta {
                name: "rename_model",
                description: "元数据提取模型名称",
            },
            FieldMeta {
                name: "rename_kb_to_read",
                description: "重命名时读取的文件头部 KB 数",
            },
            FieldMeta {
                name: "rename_min_file_size_kb",
                description: "重命名处理的最小文件大小（KB）",
            },
            FieldMeta {
                name: "rename_workers",
                description: "批量重命名并发线程数（0 = CPU 核心数）",
            },
            FieldMeta {
                name: "epub_language",
                description: "EPUB 语言代码",
            },
            FieldMeta {
                name: "epub_strict",
                description: "章节序号异常时是否中止 EPUB 生成",
            },
            FieldMeta {
                name: "epub_custom_css",
                description: "自定义 CSS 文件路径（留空使用内置样式）",
            },
            FieldMeta {
                name: "epub_cover",
                description: "封面图片路径（jpg/jpeg/png，留空无封面）",
            },
            FieldMeta {
                name: "guardian_enabled",
                description: "是否启动子进程守护",
            },
            FieldMeta {
                name: "guardian_max_concurrent",
                description: "守护允许的最大并发子进程数",
            },
            FieldMeta {
                name: "guardian_max_total_memory_mb",
                description: "守护允许的子进程内存总量上限（MB）",
            },
            FieldMeta {
                name: "guardian_timeout_secs",
                description: "子进程最长运行时间（秒）",
            },
        ];
        &FIELDS
    }
}

impl Config {
    /// 按上限收紧 max_chars；CLI 和配置都可能传入 12000。
    pub fn clamped_max_chars(&self) -> usize {
        if self.max_chars >= MAX_CHARS_CEILING {
            DEFAULT_MAX_CHARS
        } else {
            self.max_chars.max(1)
        }
    }

    pub fn double_pass(&self, remote: bool) -> bool {
        if remote {
            self.remote_double_pass
        } else {
            self.local_double_pass
        }
    }
}

/// 清洗文件名：去掉非法字符、折叠重复的不安全字符、限长 100。
pub fn sanitize_filename(name: &str) -> String {
    let mut cleaned = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|' => {}
            c if (c as u32) < 32 => {}
            _ => cleaned.push(ch),
        }
    }

    // 折叠重复的 - _ . 与空白
    let mut collapsed = String::with_capacity(cleaned.len());
    let mut prev: Option<char> = None;
    for ch in cleaned.chars() {
        let normalized = if ch.is_whitespace() { ' ' } else { ch };
        let is_unsafe = matches!(normalized, '-' | '_' | '.' | ' ');
        if is_unsafe && prev == Some(normalized) {
            continue;
        }
        collapsed.push(normalized);
        prev = Some(normalized);
    }

    let mut out = collapsed.trim().to_string();
    if out.chars().count() > 100 {
        out = out.chars().take(100).collect();
        out.truncate(out.trim_end().len());
    }
    out
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_zero() -> usize {
    0
}

fn default_string() -> String {
    String::new()
}

fn default_max_chars() -> usize {
    DEFAULT_MAX_CHARS
}

fn default_split_mode() -> String {
    "PARAGRAPHS".to_string()
}

fn default_split_method() -> String {
    "paragraph".to_string()
}

fn default_local_endpoint() -> String {
    "http://localhost:1234/v1/chat/completions".to_string()
}

fn default_local_model() -> String {
    "qwen3-30b-a3b-mlx@8bit".to_string()
}

fn default_remote_endpoint() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_remote_model() -> String {
    "deepseek/deepseek-r1:nitro".to_string()
}

fn default_temperature() -> f64 {
    0.05
}

fn default_max_tokens() -> u32 {
    4000
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_response_timeout() -> u64 {
    360
}

fn default_max_retries() -> u32 {
    10
}

fn default_wall_clock_budget() -> u64 {
    18 * 60
}

fn default_max_chunk_retries() -> u32 {
    10
}

fn default_non_latin_threshold() -> f64 {
    0.10
}

fn default_min_reply_chars() -> usize {
    300
}

fn default_rename_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_rename_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_kb_to_read() -> u64 {
    35
}

fn default_min_file_size_kb() -> u64 {
    100
}

fn default_epub_language() -> String {
    "en".to_string()
}

fn default_guardian_max_concurrent() -> usize {
    3
}

fn default_guardian_max_total_memory_mb() -> u64 {
    3072
}

fn default_guardian_timeout() -> u64 {
    900
}
