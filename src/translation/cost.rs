//! 进程级 API 费用统计。
//!
//! 所有请求共用一个计数器；本地 API 只累计 token，不产生费用。

use std::sync::{Arc, Mutex};

use serde::Deserialize;

/// chat-completion 响应里的 usage 对象。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostSummary {
    pub total_cost: f64,
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub request_count: u64,
}

/// 线程安全的累计器；克隆共享同一份计数。
#[derive(Clone, Default)]
pub struct CostTracker {
    inner: Arc<Mutex<CostSummary>>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次请求的用量，返回该请求的费用。
    pub fn track(&self, usage: &Usage) -> f64 {
        let cost = usage.cost.unwrap_or(0.0);
        let mut totals = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        totals.total_cost += cost;
        totals.total_tokens += usage.total_tokens;
        totals.prompt_tokens += usage.prompt_tokens;
        totals.completion_tokens += usage.completion_tokens;
        totals.request_count += 1;
        cost
    }

    pub fn summary(&self) -> CostSummary {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap_or_else(|e| e.into_inner()) = CostSummary::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn concurrent_tracking_is_atomic() {
        let tracker = CostTracker::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let t = tracker.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    t.track(&Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                        cost: Some(0.25),
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let s = tracker.summary();
        assert_eq!(s.request_count, 800);
        assert_eq!(s.total_tokens, 800 * 15);
        assert!((s.total_cost - 800.0 * 0.25).abs() < 1e-9);
    }

    #[test]
    fn local_usage_has_zero_cost() {
        let tracker = CostTracker::new();
        tracker.track(&Usage {
            prompt_tokens: 100,
            completion_tokens: 50,
            total_tokens: 150,
            cost: None,
        });
        let s = tracker.summary();
        assert_eq!(s.total_cost, 0.0);
        assert_eq!(s.request_count, 1);
    }

    #[test]
    fn reset_clears_counters() {
        let tracker = CostTracker::new();
        tracker.track(&Usage {
            total_tokens: 1,
            ..Default::default()
        });
        tracker.reset();
        assert_eq!(tracker.summary(), CostSummary::default());
    }
}
