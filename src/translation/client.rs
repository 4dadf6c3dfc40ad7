//! 翻译 API 客户端（OpenAI 兼容 chat-completion）。
//!
//! 单次请求 + 响应校验：剥离思考块、拉丁字符占比检查、长度下限检查、
//! usage 上报给费用统计。

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, info};

use super::cost::{CostTracker, Usage};
use super::prompts;
use crate::base_system::context::Config;

#[derive(Debug, Error)]
pub enum TranslationError {
    /// 网络/HTTP/解析/内容校验失败，可重试。
    #[error("translation failed: {0}")]
    Transient(String),
    /// 认证失败（401/403），重试没有意义。
    #[error("authentication failed: {0}")]
    Auth(String),
    /// 输入侧问题，直接返回调用方。
    #[error("validation failed: {0}")]
    Validation(String),
}

impl TranslationError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, TranslationError::Transient(_))
    }
}

/// 一个可发起翻译请求的端点。测试用脚本化实现替换 HTTP。
pub trait TranslateApi: Send + Sync {
    fn translate_messages(
        &self,
        prompt: &str,
        is_last_chunk: bool,
    ) -> Result<String, TranslationError>;
    fn model_name(&self) -> &str;
    fn is_remote(&self) -> bool;
    fn first_pass_prompt(&self) -> &str;
    fn second_pass_prompt(&self) -> &str;
}

/// 端点参数集合（本地或远程）。
#[derive(Debug, Clone)]
pub struct ApiProfile {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub remote: bool,
    pub system_prompt: String,
    pub user_prompt_first: String,
    pub user_prompt_second: String,
    pub temperature: f64,
    pub max_tokens: u32,
    pub connect_timeout: Duration,
    pub response_timeout: Duration,
    pub non_latin_threshold: f64,
    pub min_reply_chars: usize,
}

impl ApiProfile {
    pub fn remote(config: &Config, api_key: String) -> Self {
        Self {
            endpoint: config.remote_endpoint.clone(),
            model: config.remote_model.clone(),
            api_key: Some(api_key),
            remote: true,
            system_prompt: prompts::SYSTEM_PROMPT_REMOTE.to_string(),
            user_prompt_first: prompts::USER_PROMPT_FIRST_PASS_REMOTE.to_string(),
            user_prompt_second: prompts::USER_PROMPT_SECOND_PASS_REMOTE.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            connect_timeout: Duration::from_secs(config.connection_timeout),
            response_timeout: Duration::from_secs(config.response_timeout),
            non_latin_threshold: config.non_latin_threshold,
            min_reply_chars: config.min_reply_chars,
        }
    }

    pub fn local(config: &Config) -> Self {
        Self {
            endpoint: config.local_endpoint.clone(),
            model: config.local_model.clone(),
            api_key: None,
            remote: false,
            system_prompt: prompts::SYSTEM_PROMPT_LOCAL.to_string(),
            user_prompt_first: prompts::USER_PROMPT_FIRST_PASS_LOCAL.to_string(),
            user_prompt_second: prompts::USER_PROMPT_SECOND_PASS_LOCAL.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            connect_timeout: Duration::from_secs(config.connection_timeout),
            response_timeout: Duration::from_secs(config.response_timeout),
            non_latin_threshold: config.non_latin_threshold,
            min_reply_chars: config.min_reply_chars,
        }
    }
}

pub struct HttpTranslator {
    client: reqwest::blocking::Client,
    profile: ApiProfile,
    cost: CostTracker,
}

impl HttpTranslator {
    pub fn new(profile: ApiProfile, cost: CostTracker) -> Result<Self, TranslationError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(profile.connect_timeout)
            .timeout(profile.response_timeout)
            .build()
            .map_err(|e| TranslationError::Validation(e.to_string()))?;
        Ok(Self {
            client,
            profile,
            cost,
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        let mut body = json!({
            "model": self.profile.model,
            "messages": [
                { "role": "system", "content": self.profile.system_prompt },
                { "role": "user", "content": prompt },
            ],
            "temperature": self.profile.temperature,
            "max_tokens": self.profile.max_tokens,
            "stream": false,
        });
        if self.profile.remote {
            // OpenRouter 需要显式开启用量上报
            body["usage"] = json!({ "include": true });
        }
        body
    }
}

impl TranslateApi for HttpTranslator {
    fn translate_messages(
        &self,
        prompt: &str,
        is_last_chunk: bool,
    ) -> Result<String, TranslationError> {
        debug!("发送翻译请求: model={}", self.profile.model);

        let mut req = self.client.post(&self.profile.endpoint).json(&self.request_body(prompt));
        if let Some(key) = &self.profile.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .send()
            .map_err(|e| TranslationError::Transient(format!("request failed: {e}")))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            error!("翻译 API 认证失败: HTTP {status}");
            return Err(TranslationError::Auth(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TranslationError::Transient(format!("HTTP {status}")));
        }

        let body: Value = resp
            .json()
            .map_err(|e| TranslationError::Transient(format!("json decode failed: {e}")))?;

        if let Some(usage) = body.get("usage")
            && let Ok(usage) = serde_json::from_value::<Usage>(usage.clone())
        {
            let cost = self.cost.track(&usage);
            let summary = self.cost.summary();
            if self.profile.remote {
                info!(
                    "token 用量: prompt={} completion={} total={}，本次费用 ${:.6}，累计 ${:.6}（{} 次请求）",
                    usage.prompt_tokens,
                    usage.completion_tokens,
                    usage.total_tokens,
                    cost,
                    summary.total_cost,
                    summary.request_count
                );
            } else {
                debug!(
                    "token 用量（本地 API，无费用）: prompt={} completion={} total={}",
                    usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
                );
            }
        }

        parse_reply_content(
            &body,
            is_last_chunk,
            self.profile.non_latin_threshold,
            self.profile.min_reply_chars,
        )
    }

    fn model_name(&self) -> &str {
        &self.profile.model
    }

    fn is_remote(&self) -> bool {
        self.profile.remote
    }

    fn first_pass_prompt(&self) -> &str {
        &self.profile.user_prompt_first
    }

    fn second_pass_prompt(&self) -> &str {
        &self.profile.user_prompt_second
    }
}

/// 从响应 JSON 里取出并校验译文。独立出来便于离线测试。
pub fn parse_reply_content(
    body: &Value,
    is_last_chunk: bool,
    non_latin_threshold: f64,
    min_reply_chars: usize,
) -> Result<String, TranslationError> {
    let content = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| TranslationError::Transient("empty or malformed choices".to_string()))?;

    let content = strip_think_blocks(content);

    if !is_latin_charset(&content, non_latin_threshold) {
        return Err(TranslationError::Transient(
            "translated text does not appear to be in a Latin-based charset".to_string(),
        ));
    }
    if content.chars().count() < min_reply_chars && !is_last_chunk {
        return Err(TranslationError::Transient(
            "translated text is too short, an error must have occurred".to_string(),
        ));
    }

    Ok(content)
}

/// 剥离 `<think>…</think>` / `<thinking>…</thinking>` 推理块。
pub fn strip_think_blocks(content: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"(?s)<think(ing)?>.*?</think(ing)?>\n?").unwrap());
    re.replace_all(content, "").into_owned()
}

/// 译文是否以拉丁字符为主。
///
/// 统计非空白字符：ASCII 字母/数字/标点走快速路径；其余字符按
/// Unicode 区块判断是否属于拉丁扩展。非拉丁/拉丁比值达到阈值即判失败。
pub fn is_latin_charset(text: &str, threshold: f64) -> bool {
    let mut total = 0u64;
    let mut latin = 0u64;

    for ch in text.chars() {
        if ch.is_whitespace() {
            continue;
        }
        total += 1;
        if ch.is_ascii() {
            if ch.is_ascii_alphanumeric() || ch.is_ascii_punctuation() {
                latin += 1;
            }
            continue;
        }
        if is_latin_char(ch) {
            latin += 1;
        }
    }

    if total == 0 {
        return true;
    }
    if latin == 0 {
        return false;
    }
    let non_latin = total - latin;
    (non_latin as f64 / latin as f64) < threshold
}

/// 非 ASCII 字符是否属于拉丁书写系统。
///
/// 刻意的近似实现：判定规则本来是“Unicode 字符名包含 LATIN”，但本
/// 生态没有暴露字符名表的依赖，这里用拉丁相关区块的码位范围代替。
/// 与按字符名判定相比仍有漏网——带圈/带括号拉丁字母之外的零散
/// LATIN 命名符号（如 U+2132 TURNED CAPITAL F 一类 Letterlike
/// Symbols）会被算作非拉丁。对 0.10 的占比阈值而言，这类字符在
/// 译文里的密度不足以翻转判定结果。偏差记录见 DESIGN.md。
fn is_latin_char(ch: char) -> bool {
    if ch.is_numeric() {
        return true;
    }
    matches!(u32::from(ch),
        0x00C0..=0x024F   // Latin-1 Supplement letters + Extended-A/B
        | 0x0250..=0x02AF // IPA Extensions
        | 0x1D00..=0x1D7F // Phonetic Extensions
        | 0x1E00..=0x1EFF // Latin Extended Additional
        | 0x249C..=0x24E9 // Parenthesized / circled Latin letters
        | 0x2C60..=0x2C7F // Latin Extended-C
        | 0xA720..=0xA7FF // Latin Extended-D
        | 0xAB30..=0xAB6F // Latin Extended-E
        | 0xFF21..=0xFF3A // Fullwidth A-Z
        | 0xFF41..=0xFF5A // Fullwidth a-z
        | 0x10780..=0x107BF // Latin Extended-F
        | 0x1DF00..=0x1DFFF // Latin Extended-G
    )
}
