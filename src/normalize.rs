//! Maps Black Forest Labs job states onto the shared [`TaskStatus`] vocabulary.

use crate::types::TaskStatus;

pub const REMOTE_READY: &str = "Ready";
pub const REMOTE_TASK_NOT_FOUND: &str = "Task not found";
pub const REMOTE_ERROR: &str = "Error";
pub const REMOTE_PENDING: &str = "Pending";
pub const REMOTE_MODERATED: &str = "Request Moderated";

const EXPIRED_MESSAGE: &str = "task expired or missing on the remote backend";

/// Case-sensitive; anything unrecognised is treated as still running.
pub fn normalize_status(remote: &str) -> TaskStatus {
    match remote {
        REMOTE_READY => TaskStatus::Completed,
        REMOTE_TASK_NOT_FOUND | REMOTE_ERROR => TaskStatus::Failed,
        REMOTE_PENDING | REMOTE_MODERATED => TaskStatus::Pending,
        _ => TaskStatus::Running,
    }
}

/// Error text recorded for a failed job.
pub fn failure_message(remote_status: &str, remote_error: Option<&str>) -> String {
    if remote_status == REMOTE_TASK_NOT_FOUND {
        return EXPIRED_MESSAGE.to_string();
    }
    remote_error
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .unwrap_or(remote_status)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_remote_vocabulary_exactly() {
        let cases = [
            ("Ready", TaskStatus::Completed),
            ("Task not found", TaskStatus::Failed),
            ("Error", TaskStatus::Failed),
            ("Pending", TaskStatus::Pending),
            ("Request Moderated", TaskStatus::Pending),
            ("Content Moderated", TaskStatus::Running),
            ("whatever", TaskStatus::Running),
        ];
        for (remote, expected) in cases {
            assert_eq!(normalize_status(remote), expected, "remote={remote:?}");
        }
    }

    #[test]
    fn mapping_is_case_sensitive() {
        assert_eq!(normalize_status("ready"), TaskStatus::Running);
        assert_eq!(normalize_status("PENDING"), TaskStatus::Running);
        assert_eq!(normalize_status(""), TaskStatus::Running);
    }

    #[test]
    fn failure_message_distinguishes_missing_tasks() {
        assert_eq!(
            failure_message("Task not found", Some("gone")),
            EXPIRED_MESSAGE
        );
        assert_eq!(failure_message("Error", Some("nsfw")), "nsfw");
        assert_eq!(failure_message("Error", Some("  ")), "Error");
        assert_eq!(failure_message("Error", None), "Error");
    }
}
