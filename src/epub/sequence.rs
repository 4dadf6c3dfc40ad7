//! 章节序号异常检测。
//!
//! 输出的文案是对外契约（测试按字面断言），不要改动措辞。

/// 检查章节序号串，返回按出现位置排序的异常描述。
pub fn detect_issues(seq: &[i64]) -> Vec<String> {
    if seq.is_empty() {
        return Vec::new();
    }

    let mut issues: Vec<(usize, String)> = Vec::new();
    let start = seq[0];
    let end = seq[seq.len() - 1];
    let mut prev_expected = start;
    let mut seen: std::collections::HashSet<i64> = std::collections::HashSet::new();
    let mut reported_missing: std::collections::HashSet<i64> = std::collections::HashSet::new();

    for (idx, &v) in seq.iter().enumerate() {
        // 1) 重复：第二次及以后出现时报告
        if seen.contains(&v) {
            let pred = seq[..idx]
                .iter()
                .rev()
                .find(|&&x| x != v)
                .copied()
                .unwrap_or(if idx > 0 && seq[0] != v { seq[0] } else { 0 });
            let mut run_len = 1usize;
            let mut j = idx;
            while j + 1 < seq.len() && seq[j + 1] == v {
                run_len += 1;
                j += 1;
            }
            let t = if run_len > 1 { "times" } else { "time" };
            issues.push((
                idx,
                format!("number {v} is repeated {run_len} {t} after number {pred}"),
            ));
        } else {
            seen.insert(v);
        }

        if v > prev_expected {
            // 2) 缺号：跳过了若干值
            for m in prev_expected..v {
                if reported_missing.insert(m) {
                    issues.push((idx, format!("number {m} is missing")));
                }
            }
            prev_expected = v + 1;
        } else if v == prev_expected {
            // 3) 正中预期
            prev_expected += 1;
        } else {
            // 4) 低于预期：相邻换位或错位
            if idx > 0 && (seq[idx - 1] - v).abs() == 1 && v < seq[idx - 1] {
                let (a, b) = (v.min(seq[idx - 1]), v.max(seq[idx - 1]));
                issues.push((
                    idx,
                    format!("number {a} is switched in place with number {b}"),
                ));
                issues.push((
                    idx,
                    format!("number {b} is switched in place with number {a}"),
                ));
            } else {
                issues.push((
                    idx,
                    format!("number {v} is out of place after number {}", seq[idx - 1]),
                ));
            }
            prev_expected = v + 1;
        }
    }

    // 末尾缺号
    for m in prev_expected..=end {
        if reported_missing.insert(m) {
            issues.push((seq.len(), format!("number {m} is missing")));
        }
    }

    issues.sort_by_key(|(pos, _)| *pos);
    issues.into_iter().map(|(_, msg)| msg).collect()
}
