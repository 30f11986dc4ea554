//! 计划转移图
//!
//! 以邻接表表示步骤间的转移（success / failure / error），用于加载时的可达性检查。

use std::collections::{HashMap, HashSet, VecDeque};

use crate::workflow::types::{Plan, StepId, Transition};

/// 计划转移图：步骤 -> 可能的后继步骤
pub struct PlanGraph {
    pub adjacency: HashMap<StepId, Vec<StepId>>,
}

impl PlanGraph {
    pub fn new(plan: &Plan) -> Self {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        for step in &plan.steps {
            let edges = adjacency.entry(step.name.clone()).or_default();
            let transitions = [Some(&step.on_success), Some(&step.on_failure), step.on_error.as_ref()];
            for t in transitions.into_iter().flatten() {
                if let Transition::Step(next) = t {
                    if !edges.contains(next) {
                        edges.push(next.clone());
                    }
                }
            }
        }
        Self { adjacency }
    }

    /// 从 start 出发可到达的步骤（含 start）
    pub fn reachable_from(&self, start: &str) -> HashSet<StepId> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start.to_string()]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(next) = self.adjacency.get(&current) {
                queue.extend(next.iter().filter(|n| !seen.contains(*n)).cloned());
            }
        }
        seen
    }
}

/// 从第一步出发不可达的步骤，按计划顺序返回
pub fn unreachable_steps(plan: &Plan) -> Vec<StepId> {
    let Some(first) = plan.first() else {
        return Vec::new();
    };
    let reachable = PlanGraph::new(plan).reachable_from(&first.name);
    plan.steps
        .iter()
        .filter(|s| !reachable.contains(&s.name))
        .map(|s| s.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{parse_plan, PlanFormat, RunPolicy};

    #[test]
    fn test_linear_plan_fully_reachable() {
        let src = "name: p\nsteps:\n  - {name: a, goal: g}\n  - {name: b, goal: g}\n";
        let plan = parse_plan(src, PlanFormat::Yaml, "inline", &RunPolicy::default()).unwrap();
        assert!(unreachable_steps(&plan).is_empty());
    }

    #[test]
    fn test_skipped_step_is_unreachable() {
        let src = r#"
name: p
steps:
  - name: a
    goal: g
    transitions: { success: c }
  - name: b
    goal: g
  - name: c
    goal: g
    transitions: { failure: a }
"#;
        let plan = parse_plan(src, PlanFormat::Yaml, "inline", &RunPolicy::default()).unwrap();
        assert_eq!(unreachable_steps(&plan), vec!["b".to_string()]);
        let graph = PlanGraph::new(&plan);
        assert_eq!(graph.adjacency["c"], vec!["a".to_string()]);
    }
}
