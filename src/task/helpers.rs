use crate::llm::ContentBlock;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub(super) const NO_TOOLS_USED: &str = "[ERROR] You did not use a tool in your previous response! \
Please retry with a tool use.

Tool uses are formatted using XML-style tags. The tool name is enclosed in opening and closing \
tags, and each parameter is similarly enclosed within its own set of tags.

If you have completed the user's task, use the tool that reports completion. If you require \
additional information from the user, use the tool that asks a followup question. Otherwise, if \
you have not completed the task and do not need additional information, then proceed with the \
next step of the task.";

pub(super) const MISTAKE_LIMIT_PROMPT: &str = "This may indicate a failure in the model's thought \
process or inability to use a tool properly, which can be mitigated with some user guidance \
(e.g. \"Try breaking down the task into smaller steps\").";

pub(super) const EMPTY_RESPONSE_ERROR: &str = "Unexpected API Response: The language model did \
not provide any assistant messages. This may indicate an issue with the API or the model's output.";

pub(super) const EMPTY_RESPONSE_TURN: &str = "Failure: I did not provide a response.";

pub(super) const INTERRUPTED_TOOL_RESULT: &str =
    "Task was interrupted before this tool call could be completed.";

pub(super) const INTERRUPTED_BY_FEEDBACK: &str = "\n\n[Response interrupted by user feedback]";

pub(super) const INTERRUPTED_BY_TOOL_USE: &str = "\n\n[Response interrupted by a tool use result. \
Only one tool may be used at a time and should be placed at the end of the message.]";

/// Lock a std mutex, recovering the data if a holder panicked.
pub(super) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(super) fn too_many_mistakes(feedback: &str) -> String {
    format!(
        "You seem to be having trouble proceeding. The user has provided the following feedback \
to help guide you:\n<feedback>\n{feedback}\n</feedback>"
    )
}

pub(super) fn subtask_result(result: &str) -> String {
    format!("[new_task completed] Result: {result}")
}

pub(super) fn interrupted_tool_results<'a>(
    ids: impl IntoIterator<Item = &'a str>,
) -> Vec<ContentBlock> {
    ids.into_iter()
        .map(|id| ContentBlock::tool_result(id, INTERRUPTED_TOOL_RESULT, false))
        .collect()
}

/// Human phrasing of how long ago something happened, e.g. `3 minutes ago`.
pub(super) fn describe_elapsed(elapsed_millis: i64) -> String {
    let minutes = elapsed_millis.max(0) / 60_000;
    let hours = minutes / 60;
    let days = hours / 24;

    let (count, unit) = if days > 0 {
        (days, "day")
    } else if hours > 0 {
        (hours, "hour")
    } else if minutes > 0 {
        (minutes, "minute")
    } else {
        return "just now".to_string();
    };

    if count == 1 {
        format!("1 {unit} ago")
    } else {
        format!("{count} {unit}s ago")
    }
}
