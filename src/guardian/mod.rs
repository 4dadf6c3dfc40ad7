//! 子进程守护：并发/内存治理器。
//!
//! 两个协作线程共享一把粗粒度锁：
//! - **监视线程**：分批扫描系统进程，识别受管进程，按槽位/内存决定
//!   立即接纳、入队或（队列满时）直接终止；
//! - **队列线程**：周期性采样内存、执行超限/超时终止、高压下按优先级
//!   腾出内存，并把排队进程按优先级放行（每个周期最多 5 个）。
//!
//! 决策逻辑集中在 [`GuardianCore`]，不接触操作系统，便于单测；
//! 线程只负责喂数据和执行终止。

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

use crate::base_system::context::Config;

const PROCESS_SCAN_BATCH: usize = 50;
const MEMORY_SAMPLE_EVERY: u64 = 3;
const ADMIT_PER_TICK: usize = 5;
const QUEUE_CAPACITY: usize = 50;
const PRESSURE_HIGH: f64 = 0.85;
const PRESSURE_LOW: f64 = 0.70;
const TERM_GRACE: Duration = Duration::from_secs(3);

/// 名字即受管的关键进程（操作方可扩展）。
const CRITICAL_PROCESSES: [&str; 12] = [
    "bump-my-version",
    "pre-commit",
    "pytest",
    "tox",
    "uv",
    "pip",
    "coverage",
    "black",
    "flake8",
    "ruff",
    "mypy",
    "isort",
];

#[derive(Debug, Clone, Copy)]
pub struct TypeLimits {
    pub max_memory_mb: u64,
    pub max_concurrent: usize,
    pub priority: i32,
}

/// 内存大户按类型单独限制（数字越小优先级越低，先被牺牲）。
fn type_configs() -> &'static [(&'static str, TypeLimits)] {
    &[
        (
            "node",
            TypeLimits {
                max_memory_mb: 768,
                max_concurrent: 2,
                priority: 0,
            },
        ),
        (
            "npm",
            TypeLimits {
                max_memory_mb: 768,
                max_concurrent: 1,
                priority: 0,
            },
        ),
        (
            "v8",
            TypeLimits {
                max_memory_mb: 768,
                max_concurrent: 2,
                priority: 0,
            },
        ),
    ]
}

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub process_name: Option<String>,
    pub cmd_pattern: Option<String>,
    pub timeout: Duration,
    pub max_memory_mb: u64,
    pub max_concurrent: usize,
    pub max_total_memory_mb: u64,
    pub queue_size: usize,
    pub kill_duplicates: bool,
    pub tick: Duration,
    pub state_file: PathBuf,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            process_name: None,
            cmd_pattern: None,
            timeout: Duration::from_secs(900),
            max_memory_mb: 1024,
            max_concurrent: 3,
            max_total_memory_mb: 3072,
            queue_size: QUEUE_CAPACITY,
            kill_duplicates: true,
            tick: Duration::from_secs(5),
            state_file: default_state_file(),
        }
    }
}

impl GuardianConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: Duration::from_secs(config.guardian_timeout_secs),
            max_concurrent: config.guardian_max_concurrent.max(1),
            max_total_memory_mb: config.guardian_max_total_memory_mb,
            ..Self::default()
        }
    }
}

fn default_state_file() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".novel-translator")
        .join("guardian_state.json")
}

/// 一次进程观测。
#[derive(Debug, Clone)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    pub cmdline: String,
    pub memory_mb: u64,
}

#[derive(Debug, Clone)]
struct ActiveProcess {
    name: String,
    memory_mb: u64,
    started: Instant,
}

/// 观测后的接纳结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Started,
    Queued,
    KilledQueueFull,
}

/// 需要执行的终止指令。
#[derive(Debug, Clone)]
pub struct KillOrder {
    pub pid: u32,
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct PersistedState {
    pids: Vec<u32>,
    timestamp: String,
}

// ── 决策核心（无系统调用） ────────────────────────────────────

pub struct GuardianCore {
    cfg: GuardianConfig,
    active: HashMap<u32, ActiveProcess>,
    queue: VecDeque<ProcessSample>,
    monitored: HashSet<u32>,
    tick_count: u64,
}

impl GuardianCore {
    pub fn new(cfg: GuardianConfig) -> Self {
        Self {
            cfg,
            active: HashMap::new(),
            queue: VecDeque::new(),
            monitored: HashSet::new(),
            tick_count: 0,
        }
    }

    pub fn is_critical(&self, name: &str, cmdline: &str) -> bool {
        let name_lower = name.to_lowercase();
        if let Some(target) = &self.cfg.process_name
            && name_lower.contains(&target.to_lowercase())
        {
            return true;
        }
        if let Some(pattern) = &self.cfg.cmd_pattern {
            let p = pattern.to_lowercase();
            if cmdline.to_lowercase().contains(&p) || name_lower.contains(&p) {
                return true;
            }
        }
        if type_configs().iter().any(|(t, _)| name_lower.contains(t)) {
            return true;
        }
        CRITICAL_PROCESSES
            .iter()
            .any(|c| name_lower.contains(c) || cmdline.to_lowercase().contains(c))
    }

    pub fn type_limits(&self, name: &str) -> TypeLimits {
        let name_lower = name.to_lowercase();
        for (t, limits) in type_configs() {
            if name_lower.contains(t) {
                return *limits;
            }
        }
        TypeLimits {
            max_memory_mb: self.cfg.max_memory_mb,
            max_concurrent: self.cfg.max_concurrent,
            priority: 10,
        }
    }

    pub fn total_memory_mb(&self) -> u64 {
        self.active.values().map(|p| p.memory_mb).sum()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn monitored_pids(&self) -> Vec<u32> {
        self.monitored.iter().copied().collect()
    }

    /// 监视线程的入口：新发现的受管进程在这里决定去向。
    pub fn observe(&mut self, sample: ProcessSample) -> Option<Admission> {
        if self.monitored.contains(&sample.pid) {
            return None;
        }
        self.monitored.insert(sample.pid);

        let total = self.total_memory_mb();
        if self.active.len() < self.cfg.max_concurrent
            && total + sample.memory_mb <= self.cfg.max_total_memory_mb
        {
            info!(
                "开始监视进程: {} ({}) - {}",
                sample.pid, sample.name, sample.cmdline
            );
            self.active.insert(
                sample.pid,
                ActiveProcess {
                    name: sample.name,
                    memory_mb: sample.memory_mb,
                    started: Instant::now(),
                },
            );
            return Some(Admission::Started);
        }

        if self.queue.len() < self.cfg.queue_size {
            info!(
                "进程排队等待执行: {} ({}) - {}",
                sample.pid, sample.name, sample.cmdline
            );
            self.queue.push_back(sample);
            return Some(Admission::Queued);
        }

        warn!("队列已满，终止进程 {} ({})", sample.pid, sample.name);
        Some(Admission::KilledQueueFull)
    }

    /// 队列线程的一个周期：内存采样、超限/超时终止、高压腾挪、排队放行。
    ///
    /// `sample_memory` 返回某 pid 当前的内存占用（MB）；None 表示进程已退出。
    pub fn sweep<F>(&mut self, sample_memory: F) -> (Vec<KillOrder>, Vec<u32>)
    where
        F: Fn(u32) -> Option<u64>,
    {
        self.tick_count += 1;
        let mut kills: Vec<KillOrder> = Vec::new();
        let mut gone: Vec<u32> = Vec::new();

        // 每 N 个周期才真正采样一次内存，其余用缓存值
        let resample = self.tick_count % MEMORY_SAMPLE_EVERY == 0;
        for (&pid, proc_info) in self.active.iter_mut() {
            match sample_memory(pid) {
                None => gone.push(pid),
                Some(memory_mb) => {
                    if resample {
                        proc_info.memory_mb = memory_mb;
                    }
                }
            }
        }
        for pid in &gone {
            self.active.remove(pid);
            self.monitored.remove(pid);
        }

        // 超限/超时
        for (&pid, proc_info) in &self.active {
            let limits = self.type_limits(&proc_info.name);
            if proc_info.memory_mb > limits.max_memory_mb {
                kills.push(KillOrder {
                    pid,
                    reason: format!(
                        "memory limit exceeded: {}MB > {}MB ({})",
                        proc_info.memory_mb, limits.max_memory_mb, proc_info.name
                    ),
                });
            } else if proc_info.started.elapsed() > self.cfg.timeout {
                kills.push(KillOrder {
                    pid,
                    reason: format!(
                        "timeout exceeded: {:.0}s > {:.0}s",
                        proc_info.started.elapsed().as_secs_f64(),
                        self.cfg.timeout.as_secs_f64()
                    ),
                });
            }
        }
        for order in &kills {
            self.active.remove(&order.pid);
            self.monitored.remove(&order.pid);
        }

        // 高压：总内存超过 85% 上限时按（优先级升序, 内存降序）终止，压回 70% 以下
        let mut total = self.total_memory_mb();
        if (total as f64) > self.cfg.max_total_memory_mb as f64 * PRESSURE_HIGH {
            warn!(
                "内存压力过高: {}MB / {}MB",
                total, self.cfg.max_total_memory_mb
            );
            let mut by_priority: Vec<(u32, i32, u64)> = self
                .active
                .iter()
                .map(|(&pid, p)| (pid, self.type_limits(&p.name).priority, p.memory_mb))
                .collect();
            by_priority.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));

            for (pid, priority, memory_mb) in by_priority {
                if (total as f64) <= self.cfg.max_total_memory_mb as f64 * PRESSURE_LOW {
                    break;
                }
                kills.push(KillOrder {
                    pid,
                    reason: format!("killed low priority process to free memory (priority={priority})"),
                });
                self.active.remove(&pid);
                self.monitored.remove(&pid);
                total = total.saturating_sub(memory_mb);
            }
        }

        // 放行排队进程：每周期最多 5 个，尊重槽位/内存/类型并发上限
        let mut admitted: Vec<u32> = Vec::new();
        let mut retry: Vec<ProcessSample> = Vec::new();
        let mut available_slots = self.cfg.max_concurrent.saturating_sub(self.active.len());
        let mut available_memory = self.cfg.max_total_memory_mb.saturating_sub(total);

        let budget = available_slots.min(self.queue.len()).min(ADMIT_PER_TICK);
        for _ in 0..budget {
            let Some(candidate) = self.queue.pop_front() else {
                break;
            };
            if sample_memory(candidate.pid).is_none() {
                self.monitored.remove(&candidate.pid);
                continue; // 进程已自行退出
            }

            let limits = self.type_limits(&candidate.name);
            if available_memory < limits.max_memory_mb {
                retry.push(candidate);
                continue;
            }
            let same_type_running = self
                .active
                .values()
                .filter(|p| {
                    type_configs().iter().any(|(t, _)| {
                        candidate.name.to_lowercase().contains(t)
                            && p.name.to_lowercase().contains(t)
                    })
                })
                .count();
            if is_typed(&candidate.name) && same_type_running >= limits.max_concurrent {
                debug!(
                    "类型并发已满: {} ({}/{})",
                    candidate.name, same_type_running, limits.max_concurrent
                );
                retry.push(candidate);
                continue;
            }

            info!("放行排队进程: {} ({})", candidate.pid, candidate.name);
            admitted.push(candidate.pid);
            available_slots = available_slots.saturating_sub(1);
            available_memory = available_memory.saturating_sub(limits.max_memory_mb);
            self.active.insert(
                candidate.pid,
                ActiveProcess {
                    name: candidate.name,
                    memory_mb: candidate.memory_mb,
                    started: Instant::now(),
                },
            );
        }
        let _ = available_slots;
        for item in retry {
            self.queue.push_back(item);
        }

        (kills, admitted)
    }

    fn forget(&mut self, pid: u32) {
        self.active.remove(&pid);
        self.monitored.remove(&pid);
    }
}

fn is_typed(name: &str) -> bool {
    let lower = name.to_lowercase();
    type_configs().iter().any(|(t, _)| lower.contains(t))
}

// ── 系统驱动 ──────────────────────────────────────────────────

pub struct ProcessGuardian {
    core: Arc<Mutex<GuardianCore>>,
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
    state_file: PathBuf,
}

impl ProcessGuardian {
    /// 启动监视与队列线程；返回的句柄在 Drop 时停线程并落盘状态。
    pub fn start(cfg: GuardianConfig) -> Self {
        let state_file = cfg.state_file.clone();
        let tick = cfg.tick;
        let kill_duplicates = cfg.kill_duplicates;
        let core = Arc::new(Mutex::new(GuardianCore::new(cfg)));
        let stop = Arc::new(AtomicBool::new(false));

        load_state(&state_file, &core);

        let mut handles = Vec::new();
        {
            let core = Arc::clone(&core);
            let stop = Arc::clone(&stop);
            let state_file = state_file.clone();
            handles.push(thread::spawn(move || {
                monitor_loop(core, stop, tick, kill_duplicates, state_file);
            }));
        }
        {
            let core = Arc::clone(&core);
            let stop = Arc::clone(&stop);
            handles.push(thread::spawn(move || {
                queue_loop(core, stop, tick.mul_f64(0.75));
            }));
        }

        Self {
            core,
            stop,
            handles,
            state_file,
        }
    }

    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        if let Ok(core) = self.core.lock() {
            save_state(&self.state_file, &core);
        }
        info!("进程守护已停止");
    }
}

impl Drop for ProcessGuardian {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn monitor_loop(
    core: Arc<Mutex<GuardianCore>>,
    stop: Arc<AtomicBool>,
    tick: Duration,
    kill_duplicates: bool,
    state_file: PathBuf,
) {
    let mut sys = System::new_all();
    let mut tick_count: u64 = 0;
    while !stop.load(Ordering::Relaxed) {
        tick_count += 1;
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut batch_counter = 0usize;
        let mut queue_full_kills: Vec<u32> = Vec::new();
        for (pid, process) in sys.processes() {
            batch_counter += 1;
            if batch_counter > PROCESS_SCAN_BATCH {
                // 分批扫描，给系统喘息时间
                thread::sleep(Duration::from_millis(10));
                batch_counter = 0;
            }

            let name = process.name().to_string_lossy().to_string();
            let cmdline = process
                .cmd()
                .iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");

            let mut guard = match core.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            if !guard.is_critical(&name, &cmdline) {
                continue;
            }
            let sample = ProcessSample {
                pid: pid.as_u32(),
                name,
                cmdline,
                memory_mb: process.memory() / (1024 * 1024),
            };
            if guard.observe(sample) == Some(Admission::KilledQueueFull) {
                queue_full_kills.push(pid.as_u32());
            }
        }

        for pid in queue_full_kills {
            kill_pid(&mut sys, pid, "process queue full");
            if let Ok(mut guard) = core.lock() {
                guard.forget(pid);
            }
        }

        // 重复进程清理的节奏放缓，避免每个周期都全量分组
        if kill_duplicates && tick_count % 3 == 0 {
            reap_duplicates(&core, &mut sys);
        }

        if let Ok(guard) = core.lock() {
            save_state(&state_file, &guard);
        }

        stop_wait(&stop, tick);
    }
}

fn queue_loop(core: Arc<Mutex<GuardianCore>>, stop: Arc<AtomicBool>, tick: Duration) {
    let mut sys = System::new();
    while !stop.load(Ordering::Relaxed) {
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let kills = {
            let mut guard = match core.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            let (kills, _admitted) = guard.sweep(|pid| {
                sys.process(Pid::from_u32(pid))
                    .map(|p| p.memory() / (1024 * 1024))
            });
            kills
        };

        for order in kills {
            warn!("终止进程 {}: {}", order.pid, order.reason);
            kill_pid(&mut sys, order.pid, &order.reason);
        }

        stop_wait(&stop, tick);
    }
}

/// 同一命令签名（argv[0]）出现多份时，保留最早的一份。
fn reap_duplicates(core: &Arc<Mutex<GuardianCore>>, sys: &mut System) {
    let mut groups: HashMap<String, Vec<(u32, u64)>> = HashMap::new();
    for (pid, process) in sys.processes() {
        let Some(first_arg) = process.cmd().first() else {
            continue;
        };
        let name = process.name().to_string_lossy().to_string();
        let cmdline = process
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        let is_critical = match core.lock() {
            Ok(guard) => guard.is_critical(&name, &cmdline),
            Err(_) => return,
        };
        if !is_critical {
            continue;
        }
        // 签名只取 argv[0]，粒度偏粗但与状态文件的历史口径一致
        groups
            .entry(first_arg.to_string_lossy().to_string())
            .or_default()
            .push((pid.as_u32(), process.start_time()));
    }

    for (_, mut procs) in groups {
        if procs.len() < 2 {
            continue;
        }
        procs.sort_by_key(|(_, created)| *created);
        for (pid, _) in procs.into_iter().skip(1) {
            kill_pid(sys, pid, "duplicate process instance");
            if let Ok(mut guard) = core.lock() {
                guard.forget(pid);
            }
        }
    }
}

/// TERM → 宽限 3 秒 → KILL。
fn kill_pid(sys: &mut System, pid: u32, reason: &str) {
    let sys_pid = Pid::from_u32(pid);
    let Some(process) = sys.process(sys_pid) else {
        return;
    };
    info!("终止进程 {pid}: {reason}");
    if process.kill_with(Signal::Term).is_none() {
        // 平台不支持按信号终止时直接 kill
        process.kill();
        return;
    }

    thread::sleep(TERM_GRACE);
    sys.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
    if let Some(survivor) = sys.process(sys_pid) {
        warn!("进程 {pid} 未在宽限期内退出，强制终止");
        survivor.kill();
    }
}

fn stop_wait(stop: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn save_state(state_file: &PathBuf, core: &GuardianCore) {
    let state = PersistedState {
        pids: core.monitored_pids(),
        timestamp: time::OffsetDateTime::now_utc().to_string(),
    };
    if let Some(parent) = state_file.parent() {
        let _ = fs::create_dir_all(parent);
    }
    match serde_json::to_vec(&state) {
        Ok(bytes) => {
            if let Err(err) = fs::write(state_file, bytes) {
                warn!("守护状态落盘失败: {err}");
            }
        }
        Err(err) => warn!("守护状态序列化失败: {err}"),
    }
}

fn load_state(state_file: &PathBuf, core: &Arc<Mutex<GuardianCore>>) {
    let Ok(bytes) = fs::read(state_file) else {
        return;
    };
    let Ok(state) = serde_json::from_slice::<PersistedState>(&bytes) else {
        return;
    };
    if let Ok(mut guard) = core.lock() {
        // 历史 PID 仅作参考导入；死进程在第一次 sweep 时被清掉
        for pid in state.pids {
            guard.monitored.insert(pid);
        }
    }
    debug!("已载入守护状态: {}", state_file.display());
}
