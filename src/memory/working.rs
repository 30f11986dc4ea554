//! 中期记忆：当前步骤目标、已尝试方案、失败原因
//!
//! 在单个步骤的重试循环内有效，拼入纠正反馈（Current Goal / What has been tried / Failures），减少重复犯错。

#[derive(Clone, Debug, Default)]
pub struct WorkingMemory {
    pub goal: Option<String>,
    pub attempts: Vec<String>,
    pub failures: Vec<String>,
}

impl WorkingMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_goal(&mut self, goal: impl Into<String>) {
        self.goal = Some(goal.into());
    }

    pub fn add_attempt(&mut self, attempt: impl Into<String>) {
        self.attempts.push(attempt.into());
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failures.push(failure.into());
    }

    pub fn clear(&mut self) {
        self.goal = None;
        self.attempts.clear();
        self.failures.clear();
    }

    /// 渲染为可拼入对话的段落；没有任何尝试时返回空串
    pub fn to_section(&self) -> String {
        if self.attempts.is_empty() && self.failures.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        if let Some(goal) = &self.goal {
            out.push_str(&format!("## Current Goal\n{goal}\n\n"));
        }
        if !self.attempts.is_empty() {
            out.push_str("## What has been tried\n");
            for (i, a) in self.attempts.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, a));
            }
            out.push('\n');
        }
        if !self.failures.is_empty() {
            out.push_str("## Failures\n");
            for f in &self.failures {
                out.push_str(&format!("- {f}\n"));
            }
        }
        out.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_section() {
        let mut wm = WorkingMemory::new();
        wm.set_goal("build it");
        assert!(wm.to_section().is_empty());
    }

    #[test]
    fn test_section_lists_attempts_and_failures() {
        let mut wm = WorkingMemory::new();
        wm.set_goal("build it");
        wm.add_attempt("shell -> exit 1");
        wm.add_failure("shell: exit 1");
        let s = wm.to_section();
        assert!(s.contains("## Current Goal\nbuild it"));
        assert!(s.contains("1. shell -> exit 1"));
        assert!(s.contains("- shell: exit 1"));
    }
}
