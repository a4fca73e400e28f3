//! API request/response models for the async task queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::{IntoParams, ToSchema};

use super::providers::ProviderType;
use crate::errors::{Error, Result};

/// Opaque key-value mapping produced by a task executor.
pub type TaskResult = Map<String, Value>;

/// Agent scopes available for asynchronous execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Chat,
    Research,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Chat => "chat",
            AgentType::Research => "research",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle states.
///
/// Transitions are `Pending -> Processing -> {Completed, Failed, Cancelled}`,
/// with `Pending -> Cancelled` allowed for tasks cancelled before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Depth levels for research analysis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResearchDepth {
    Quick,
    #[default]
    Standard,
    Deep,
}

fn default_priority() -> u8 {
    5
}

/// Submit a chat task.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatTaskRequest {
    /// Message to send to the chat agent
    pub message: String,
    /// Optional provider override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderType>,
    /// Task priority, 1-10 (higher = sooner)
    #[serde(default = "default_priority")]
    pub priority: u8,
}

/// Submit a research task.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResearchTaskRequest {
    /// Research topic or question
    pub topic: String,
    /// Research depth level
    #[serde(default)]
    pub depth: ResearchDepth,
    /// Optional provider override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderType>,
    /// Optional focus areas to emphasize
    #[serde(default)]
    pub focus_areas: Vec<String>,
    /// Task priority, 1-10 (higher = sooner)
    #[serde(default = "default_priority")]
    pub priority: u8,
}

/// Discriminated task payload; the `agent` field selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "agent", rename_all = "lowercase")]
pub enum TaskRequest {
    Chat(ChatTaskRequest),
    Research(ResearchTaskRequest),
}

impl TaskRequest {
    pub fn agent(&self) -> AgentType {
        match self {
            TaskRequest::Chat(_) => AgentType::Chat,
            TaskRequest::Research(_) => AgentType::Research,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            TaskRequest::Chat(request) => request.priority,
            TaskRequest::Research(request) => request.priority,
        }
    }

    pub fn provider(&self) -> Option<ProviderType> {
        match self {
            TaskRequest::Chat(request) => request.provider,
            TaskRequest::Research(request) => request.provider,
        }
    }

    /// Validates the payload constraints enforced at submission time.
    pub fn validate(&self) -> Result<()> {
        let priority = self.priority();
        if !(1..=10).contains(&priority) {
            return Err(Error::BadRequest {
                message: format!("Priority must be between 1 and 10, got {priority}"),
            });
        }

        match self {
            TaskRequest::Chat(request) => {
                if request.message.is_empty() {
                    return Err(Error::BadRequest {
                        message: "Chat message must not be empty".to_string(),
                    });
                }
            }
            TaskRequest::Research(request) => {
                if request.topic.chars().count() < 3 {
                    return Err(Error::BadRequest {
                        message: "Research topic must be at least 3 characters".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Response returned when a task is accepted for execution.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskSubmissionResponse {
    pub task_id: String,
    pub status: TaskStatus,
    /// Relative URL where the task status can be polled
    pub status_url: String,
}

impl TaskSubmissionResponse {
    pub fn from_status(status: &TaskStatusResponse) -> Self {
        Self {
            task_id: status.task_id.clone(),
            status: status.status,
            status_url: format!("/tasks/{}", status.task_id),
        }
    }
}

/// Task status payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub agent: AgentType,
    pub status: TaskStatus,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Task result payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskResultResponse {
    pub task_id: String,
    pub agent: AgentType,
    pub status: TaskStatus,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<TaskResult>,
}

/// Paginated task list payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskListResponse {
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
    pub tasks: Vec<TaskStatusResponse>,
}

fn default_limit() -> usize {
    20
}

/// Query parameters for listing tasks.
#[derive(Debug, Clone, Deserialize, IntoParams, ToSchema)]
pub struct ListTasksQuery {
    /// Only return tasks with this status
    pub status: Option<TaskStatus>,
    /// Only return tasks for this agent
    pub agent: Option<AgentType>,
    /// Page size
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Number of tasks to skip
    #[serde(default)]
    pub offset: usize,
}

impl Default for ListTasksQuery {
    fn default() -> Self {
        Self {
            status: None,
            agent: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_request_parses_with_defaults() {
        let request: TaskRequest =
            serde_json::from_str(r#"{"agent": "chat", "message": "hello"}"#).unwrap();

        assert_eq!(request.agent(), AgentType::Chat);
        assert_eq!(request.priority(), 5);
        assert!(request.provider().is_none());
        assert!(request.validate().is_ok());
    }

    #[test]
    fn research_request_parses_discriminated_fields() {
        let request: TaskRequest = serde_json::from_str(
            r#"{"agent": "research", "topic": "AI safety", "depth": "quick", "priority": 8}"#,
        )
        .unwrap();

        let TaskRequest::Research(research) = &request else {
            panic!("Expected research variant");
        };
        assert_eq!(research.depth, ResearchDepth::Quick);
        assert_eq!(research.priority, 8);
        assert!(research.focus_areas.is_empty());
    }

    #[test]
    fn unknown_agent_tag_is_rejected() {
        let result: std::result::Result<TaskRequest, _> =
            serde_json::from_str(r#"{"agent": "summarize", "message": "hello"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn validation_rejects_out_of_range_priority() {
        let request = TaskRequest::Chat(ChatTaskRequest {
            message: "hello".to_string(),
            provider: None,
            priority: 11,
        });
        assert!(matches!(
            request.validate(),
            Err(Error::BadRequest { .. })
        ));

        let request = TaskRequest::Chat(ChatTaskRequest {
            message: "hello".to_string(),
            provider: None,
            priority: 0,
        });
        assert!(request.validate().is_err());
    }

    #[test]
    fn validation_rejects_empty_message_and_short_topic() {
        let request = TaskRequest::Chat(ChatTaskRequest {
            message: String::new(),
            provider: None,
            priority: 5,
        });
        assert!(request.validate().is_err());

        let request = TaskRequest::Research(ResearchTaskRequest {
            topic: "AI".to_string(),
            depth: ResearchDepth::Standard,
            provider: None,
            focus_areas: vec![],
            priority: 5,
        });
        assert!(request.validate().is_err());
    }

    #[test]
    fn submission_response_carries_status_url() {
        let status = TaskStatusResponse {
            task_id: "abc-123".to_string(),
            agent: AgentType::Chat,
            status: TaskStatus::Pending,
            priority: 5,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: None,
            error: None,
        };

        let submission = TaskSubmissionResponse::from_status(&status);
        assert_eq!(submission.status_url, "/tasks/abc-123");
        assert_eq!(submission.status, TaskStatus::Pending);
    }

    #[test]
    fn status_response_omits_absent_optionals() {
        let status = TaskStatusResponse {
            task_id: "abc".to_string(),
            agent: AgentType::Research,
            status: TaskStatus::Pending,
            priority: 5,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            expires_at: None,
            error: None,
        };

        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("started_at").is_none());
        assert!(json.get("error").is_none());
        assert_eq!(json["status"], "pending");
    }
}
