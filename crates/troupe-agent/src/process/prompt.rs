use std::fmt::Write;

use troupe_core::types::{AgentProfile, ChatMessage, Task};

/// Opening conversation for an agent working on `task`.
pub fn task_messages(agent: &AgentProfile, task: &Task, context: &str) -> Vec<ChatMessage> {
    let mut body = format!("Current task: {}", task.description);
    if !task.expected_output.is_empty() {
        let _ = write!(
            body,
            "\n\nExpected criteria for your final answer: {}",
            task.expected_output
        );
    }
    if !context.is_empty() {
        let _ = write!(body, "\n\nContext from previous tasks:\n{}", context);
    }

    vec![
        ChatMessage::system(agent.system_prompt()),
        ChatMessage::user(body),
    ]
}

/// Opening conversation for the manager of a hierarchical run.
pub fn manager_messages(
    manager: &AgentProfile,
    tasks: &[&Task],
    workers: &[&AgentProfile],
) -> Vec<ChatMessage> {
    let mut body = String::from("You manage a crew. These tasks must be completed:\n");
    for task in tasks {
        let _ = write!(body, "\n- {}: {}", task.name, task.description);
        if !task.expected_output.is_empty() {
            let _ = write!(body, " (expected: {})", task.expected_output);
        }
        if !task.context_tasks.is_empty() {
            let _ = write!(body, " [needs: {}]", task.context_tasks.join(", "));
        }
    }

    body.push_str("\n\nAgents you can delegate to:\n");
    for worker in workers {
        let _ = write!(body, "\n- {}", worker.name);
        if !worker.role.is_empty() {
            let _ = write!(body, ": {}", worker.role);
        }
        if !worker.goal.is_empty() {
            let _ = write!(body, " (goal: {})", worker.goal);
        }
    }

    body.push_str(
        "\n\nReply with a single JSON object and nothing else.\n\
         To answer every task yourself: {\"answer\": \"<final answer>\"}\n\
         To delegate: {\"delegations\": [{\"task\": \"<task>\", \"agent\": \"<agent>\"}], \
         \"independent\": <true if the tasks can run at the same time>}\n\
         Every task must appear exactly once in the delegations.",
    );

    vec![
        ChatMessage::system(manager.system_prompt()),
        ChatMessage::user(body),
    ]
}
