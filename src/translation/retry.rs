//! 指数退避重试，受墙钟时间预算约束。
//!
//! 翻译失败绝不允许悄悄产出残缺的书：重试耗尽时调用方记录结构化
//! 致命错误并以非零退出码终止进程。

use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use super::client::TranslationError;
use crate::base_system::context::Config;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub wall_clock_budget: Duration,
    pub wait_base: f64,
    pub wait_min: f64,
    pub wait_max: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            wall_clock_budget: Duration::from_secs(18 * 60),
            wait_base: 1.0,
            wait_min: 3.0,
            wait_max: 30.0,
        }
    }
}

/// 重试结束仍失败时的汇总信息。
#[derive(Debug)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_error: String,
    pub fatal: bool,
}

impl std::fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "failed after {} attempt(s) in {:.1}s: {}",
            self.attempts,
            self.elapsed.as_secs_f64(),
            self.last_error
        )
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            wall_clock_budget: Duration::from_secs(config.wall_clock_budget_secs),
            ..Self::default()
        }
    }

    /// 第 `attempt` 次失败后的等待时长（attempt 从 1 计）。
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.wait_base * 2f64.powi(attempt.saturating_sub(1) as i32);
        let clamped = exp.clamp(self.wait_min, self.wait_max);
        Duration::from_secs_f64(clamped)
    }

    /// 反复执行 `op` 直到成功、认证失败或预算耗尽。
    pub fn run<T, F>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Result<T, TranslationError>,
    {
        let started = Instant::now();
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.max_retries {
            let elapsed = started.elapsed();
            if elapsed >= self.wall_clock_budget {
                return Err(RetryExhausted {
                    attempts: attempt - 1,
                    elapsed,
                    last_error: format!(
                        "exceeded total time limit of {:.1} minutes; last error: {last_error}",
                        self.wall_clock_budget.as_secs_f64() / 60.0
                    ),
                    fatal: false,
                });
            }

            if attempt > 1 {
                warn!(
                    "{label}: 第 {attempt}/{} 次重试（已耗时 {:.1}s）",
                    self.max_retries,
                    elapsed.as_secs_f64()
                );
            }

            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            "{label}: 第 {attempt} 次尝试成功（耗时 {:.1}s）",
                            started.elapsed().as_secs_f64()
                        );
                    }
                    return Ok(value);
                }
                Err(TranslationError::Auth(msg)) => {
                    error!("{label}: 认证失败，不再重试: {msg}");
                    return Err(RetryExhausted {
                        attempts: attempt,
                        elapsed: started.elapsed(),
                        last_error: format!("authentication failed: {msg}"),
                        fatal: true,
                    });
                }
                Err(err) => {
                    last_error = err.to_string();
                    if attempt == self.max_retries {
                        break;
                    }

                    let mut wait = self.backoff_delay(attempt);
                    // 不允许睡过预算：截短最后一次等待
                    let elapsed = started.elapsed();
                    if elapsed + wait >= self.wall_clock_budget {
                        wait = self
                            .wall_clock_budget
                            .saturating_sub(elapsed)
                            .saturating_sub(Duration::from_secs(1));
                    }
                    if !wait.is_zero() {
                        warn!(
                            "{label}: 等待 {:.1}s 后重试。错误: {last_error}",
                            wait.as_secs_f64()
                        );
                        thread::sleep(wait);
                    }
                }
            }
        }

        Err(RetryExhausted {
            attempts: self.max_retries,
            elapsed: started.elapsed(),
            last_error,
            fatal: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            wall_clock_budget: Duration::from_secs(30),
            wait_base: 0.0005,
            wait_min: 0.0,
            wait_max: 0.002,
        }
    }

    #[test]
    fn backoff_schedule_is_clamped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(3)); // 1 -> clamp up to min
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(4)); // 4s
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(16));
        assert_eq!(policy.backoff_delay(6), Duration::from_secs(30)); // 32 -> clamp to max
        assert_eq!(policy.backoff_delay(9), Duration::from_secs(30));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = quick_policy(10).run("test", || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TranslationError::Transient("boom".into()))
            } else {
                Ok("done".to_string())
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhaustion_reports_attempts_and_last_error() {
        let err = quick_policy(4)
            .run("test", || -> Result<(), _> {
                Err(TranslationError::Transient("always failing".into()))
            })
            .unwrap_err();
        assert_eq!(err.attempts, 4);
        assert!(err.last_error.contains("always failing"));
        assert!(!err.fatal);
    }

    #[test]
    fn auth_failure_short_circuits() {
        let calls = AtomicU32::new(0);
        let err = quick_policy(10)
            .run("test", || -> Result<(), _> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TranslationError::Auth("401 Unauthorized".into()))
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.fatal);
    }

    #[test]
    fn wall_clock_budget_stops_retries() {
        let policy = RetryPolicy {
            max_retries: 100,
            wall_clock_budget: Duration::from_millis(40),
            wait_base: 0.02,
            wait_min: 0.02,
            wait_max: 0.02,
        };
        let started = Instant::now();
        let err = policy
            .run("test", || -> Result<(), _> {
                Err(TranslationError::Transient("slow failure".into()))
            })
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(err.attempts < 100);
    }
}
