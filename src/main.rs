use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::{info, warn};

use novel_translator::base_system::config::load_or_create;
use novel_translator::base_system::context::Config;
use novel_translator::base_system::logging::{LogOptions, LogSystem};
use novel_translator::guardian::{GuardianConfig, ProcessGuardian};
use novel_translator::pipeline::batch::run_batch;
use novel_translator::pipeline::orchestrator::{Orchestrator, PhaseFlags};
use novel_translator::translation::client::{ApiProfile, HttpTranslator};
use novel_translator::translation::cost::CostTracker;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "novel-translator")]
#[command(about = "中文小说 → 英文 EPUB 翻译流水线")]
struct Cli {
    /// 输入文件（单本模式）或目录（配合 --batch）
    filepath: Option<PathBuf>,

    /// 批量模式：处理目录下全部 .txt 文件
    #[arg(long, default_value_t = false)]
    batch: bool,

    /// 续传：沿用进度文件与已翻译分片
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// 跳过重命名阶段
    #[arg(long, default_value_t = false)]
    skip_renaming: bool,

    /// 跳过翻译阶段
    #[arg(long, default_value_t = false)]
    skip_translating: bool,

    /// 跳过 EPUB 生成阶段
    #[arg(long, default_value_t = false)]
    skip_epub: bool,

    /// 输入文件编码（默认自动检测）
    #[arg(long)]
    encoding: Option<String>,

    /// 单个分片的最大字符数（超过上限会被收紧）
    #[arg(long = "max_chars")]
    max_chars: Option<usize>,

    /// 分片模式: PARAGRAPHS 或 SPLIT_POINTS
    #[arg(long = "split_mode")]
    split_mode: Option<String>,

    /// 段落检测方式: paragraph 或 punctuation
    #[arg(long = "split-method")]
    split_method: Option<String>,

    /// 使用远程翻译 API（需要 OPENROUTER_API_KEY）
    #[arg(long, default_value_t = false)]
    remote: bool,

    /// 重命名用的 OpenAI API key（也可用 OPENAI_API_KEY 环境变量）
    #[arg(long = "openai-api-key")]
    openai_api_key: Option<String>,

    /// 配置文件路径
    #[arg(long)]
    config: Option<PathBuf>,

    /// 启用调试日志输出
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// 显示版本信息后退出
    #[arg(long, default_value_t = false)]
    version: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("novel-translator v{VERSION}");
        return Ok(());
    }

    let _log = init_logging(cli.debug)?;
    info!("当前版本: v{VERSION}");

    let mut config: Config = load_or_create(cli.config.as_deref())?;
    apply_cli_overrides(&mut config, &cli);

    let Some(filepath) = cli.filepath.clone() else {
        bail!("缺少输入路径（文件或 --batch 目录）");
    };
    if !filepath.exists() {
        bail!("输入路径不存在: {}", filepath.display());
    }

    // 可选的子进程守护（独立线程，退出时自动停止）
    let _guardian = config
        .guardian_enabled
        .then(|| ProcessGuardian::start(GuardianConfig::from_config(&config)));

    let cost = CostTracker::new();
    let profile = if cli.remote {
        let Ok(api_key) = std::env::var("OPENROUTER_API_KEY") else {
            bail!("远程翻译需要设置 OPENROUTER_API_KEY 环境变量");
        };
        ApiProfile::remote(&config, api_key)
    } else {
        ApiProfile::local(&config)
    };
    let api = HttpTranslator::new(profile, cost.clone())
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let flags = PhaseFlags {
        skip_renaming: cli.skip_renaming,
        skip_translating: cli.skip_translating,
        skip_epub: cli.skip_epub,
        resume: cli.resume,
    };
    let openai_api_key = cli
        .openai_api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok());

    let orchestrator = Orchestrator {
        config: &config,
        api: &api,
        cost: &cost,
        flags,
        openai_api_key,
    };

    if cli.batch {
        let work_dir = std::env::current_dir()?;
        run_batch(&filepath, &work_dir, &orchestrator, &cost)?;
    } else {
        if !filepath.is_file() {
            bail!("单本模式需要一个文件路径（目录请配合 --batch）");
        }
        let ok = orchestrator.process_novel(&filepath)?;
        if !ok {
            print_cost_summary(cli.remote, &cost, &config);
            bail!("处理失败: {}", filepath.display());
        }
        println!("处理完成: {}", filepath.display());
    }

    print_cost_summary(cli.remote, &cost, &config);
    Ok(())
}

fn apply_cli_overrides(config: &mut Config, cli: &Cli) {
    if let Some(encoding) = &cli.encoding {
        config.default_encoding = encoding.clone();
    }
    if let Some(max_chars) = cli.max_chars {
        config.max_chars = max_chars;
        if config.clamped_max_chars() != max_chars {
            warn!(
                "--max_chars {} 超出上限，收紧为 {}",
                max_chars,
                config.clamped_max_chars()
            );
        }
    }
    if let Some(split_mode) = &cli.split_mode {
        config.split_mode = split_mode.clone();
    }
    if let Some(split_method) = &cli.split_method {
        config.split_method = split_method.clone();
    }
}

fn print_cost_summary(remote: bool, cost: &CostTracker, config: &Config) {
    let summary = cost.summary();
    if summary.request_count == 0 {
        return;
    }
    if remote {
        println!(
            "费用汇总: 模型 {}，请求 {} 次，token {}（prompt {} / completion {}），合计 ${:.6}",
            config.remote_model,
            summary.request_count,
            summary.total_tokens,
            summary.prompt_tokens,
            summary.completion_tokens,
            summary.total_cost
        );
    } else {
        println!(
            "本地 API：请求 {} 次，token {}，无费用",
            summary.request_count, summary.total_tokens
        );
    }
}

fn init_logging(debug: bool) -> Result<LogSystem> {
    let opts = LogOptions {
        debug,
        use_color: true,
        archive_on_exit: true,
        console: true,
    };
    LogSystem::init(opts).map_err(|e| anyhow::anyhow!(e.to_string()))
}
