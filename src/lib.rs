//! 中文网络小说 → 英文 EPUB 的三阶段翻译流水线。
//!
//! 本 crate 负责：重命名（元数据提取）、分片翻译（本地/远程 LLM）、
//! EPUB 组装，以及批量运行时的可续传进度管理。
//!
//! 代码结构（读代码入口）：
//! - `base_system`：配置/日志/书名解析等基础设施
//! - `text`：清洗、分片、编码探测
//! - `translation`：API 客户端、重试策略、费用统计、分片翻译
//! - `epub`：章节识别、序号校验、XHTML/OPF/NCX 构建与打包
//! - `pipeline`：单本翻译、重命名、阶段编排与批量驱动
//! - `guardian`：子进程并发/内存治理

pub mod base_system;
pub mod epub;
pub mod guardian;
pub mod pipeline;
pub mod text;
pub mod translation;
