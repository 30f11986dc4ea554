//! Planner：为步骤构建对话
//!
//! 初始对话 = system prompt + persona（可选）+ 步骤目标 + 输入与共享上下文；
//! 每次失败后追加模型上一次的决定与纠正反馈。

use crate::memory::{Conversation, Message, WorkingMemory};
use crate::workflow::{RunContext, StepAttempt};
use crate::workflow::Step;

/// 未配置 engine.system_prompt 时使用
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are the executor of one step in a multi-step plan. \
Complete the step goal by calling exactly one of the available tools with correct arguments. \
A plain text answer does not complete the step. \
If a previous attempt failed, read the feedback and correct your approach.";

/// 初始对话；第一条 user 消息只含步骤目标
pub fn initial_conversation(
    system_prompt: &str,
    persona: Option<&str>,
    step: &Step,
    context: &RunContext,
) -> Conversation {
    let mut convo = Conversation::new();
    convo.push(Message::system(system_prompt));
    if let Some(p) = persona.map(str::trim).filter(|p| !p.is_empty()) {
        convo.push(Message::system(p));
    }
    convo.push(Message::user(step.goal.clone()));

    let mut details = String::new();
    if !step.inputs.is_empty() {
        let inputs = serde_json::to_string_pretty(&step.inputs).unwrap_or_default();
        details.push_str(&format!("## Step inputs\n{inputs}\n"));
    }
    if !context.is_empty() {
        if !details.is_empty() {
            details.push('\n');
        }
        details.push_str(&format!("## Shared context\n{}\n", context.render()));
    }
    if !details.is_empty() {
        convo.push(Message::user(details.trim_end()));
    }
    convo
}

/// 失败后追加：模型上次的决定 + 纠正反馈（附带已尝试记录）
pub fn push_feedback(
    convo: &mut Conversation,
    previous_decision: Option<&str>,
    feedback: &str,
    memory: &WorkingMemory,
) {
    convo.push(Message::assistant(
        previous_decision.unwrap_or("(no response)").to_string(),
    ));
    let section = memory.to_section();
    if section.is_empty() {
        convo.push(Message::user(feedback));
    } else {
        convo.push(Message::user(format!("{feedback}\n\n{section}")));
    }
}

/// 续跑时把已记录的失败尝试还原进对话与工作记忆
pub fn replay_failures(convo: &mut Conversation, memory: &mut WorkingMemory, prior: &[StepAttempt]) {
    for a in prior {
        memory.add_attempt(a.response.clone().unwrap_or_else(|| "(no response)".to_string()));
        memory.add_failure(a.detail.clone());
        let feedback = format!("Attempt {} failed: {}", a.attempt, a.detail);
        push_feedback(convo, a.response.as_deref(), &feedback, memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Role;
    use crate::workflow::{PlanBuilder, StepBuilder};

    #[test]
    fn test_initial_conversation_layout() {
        let plan = PlanBuilder::new("p")
            .input("repo", "planrun")
            .step(StepBuilder::new("build", "Build the image").input("tag", "v1"))
            .build()
            .unwrap();
        let ctx = RunContext::new(&plan);
        let convo = initial_conversation("sys", Some("You are a builder."), &plan.steps[0], &ctx);
        let msgs = convo.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].content, "You are a builder.");
        assert_eq!(msgs[2], Message::user("Build the image"));
        assert!(msgs[3].content.contains("## Step inputs"));
        assert!(msgs[3].content.contains("## Shared context"));
    }

    #[test]
    fn test_push_feedback_includes_memory() {
        let mut convo = Conversation::new();
        let mut wm = WorkingMemory::new();
        wm.set_goal("g");
        push_feedback(&mut convo, Some("call echo {}"), "try again", &wm);
        assert_eq!(convo.messages()[0].role, Role::Assistant);
        assert_eq!(convo.messages()[1].content, "try again");

        wm.add_attempt("call echo {}");
        push_feedback(&mut convo, None, "try again", &wm);
        assert_eq!(convo.messages()[2].content, "(no response)");
        assert!(convo.messages()[3].content.contains("## What has been tried"));
    }
}
