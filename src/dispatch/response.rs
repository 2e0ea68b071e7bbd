//! 结果 → 回复文本

use serde_json::Value;

use crate::core::error::RejectReason;
use crate::protocol::{ExecutionResult, ExecutionStatus};

const VALUE_PREVIEW_CHARS: usize = 300;

fn reason_text(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::InvalidKey => "the pairing key is invalid",
        RejectReason::AlreadyPaired => "the device is already paired with another key",
        RejectReason::DeviceNotPaired => "the device is not paired",
        RejectReason::InvalidSignature => "the task signature could not be verified",
        RejectReason::ActionNotAllowed => "an action is not allowed by policy",
        RejectReason::PathNotAllowed => "a path is outside the allowed directories",
        RejectReason::TooManySteps => "the plan has too many steps",
        RejectReason::RateLimited => "too many requests, try again later",
        RejectReason::StalePlan => "the task was issued outside the accepted time window",
    }
}

/// 拒绝回复
pub fn format_rejection(task_id: &str, reason: RejectReason) -> String {
    rejection_line(task_id, reason_text(reason), reason.as_str())
}

fn rejection_line(task_id: &str, text: &str, code: &str) -> String {
    format!("Task `{}` was rejected.\nReason: {} ({})", task_id, text, code)
}

fn preview(value: &Value) -> String {
    let s = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if s.chars().count() > VALUE_PREVIEW_CHARS {
        format!("{}...", s.chars().take(VALUE_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

/// 有 `report_text` 输出则原样返回报告；否则逐项列出输出
pub fn format_execution_result(result: &ExecutionResult) -> String {
    if result.status == ExecutionStatus::Rejected {
        return match result.reason {
            Some(reason) => format_rejection(&result.task_id, reason),
            None => rejection_line(&result.task_id, "no reason given", "unknown"),
        };
    }

    // 以最后一个产出报告的步骤为准
    let report = result
        .step_results
        .iter()
        .rev()
        .find_map(|step| step.output.get("report_text").and_then(|t| t.as_str()));
    if let Some(report) = report {
        if result.status == ExecutionStatus::Completed {
            return report.to_string();
        }
    }

    let mut lines = vec![format!("Task `{}` {}.", result.task_id, result.status)];
    for step in &result.step_results {
        if let Some(err) = &step.error {
            lines.push(format!("- {} failed: {}", step.action, preview(&Value::String(err.clone()))));
        }
    }
    for (action, output) in &result.outputs {
        match output {
            Value::Object(map) => {
                for (k, v) in map {
                    lines.push(format!("- {}.{}: {}", action, k, preview(v)));
                }
            }
            other => lines.push(format!("- {}: {}", action, preview(other))),
        }
    }
    lines.join("\n")
}
