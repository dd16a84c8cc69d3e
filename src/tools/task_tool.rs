use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    /// Accepts the loose spellings models tend to produce; anything unknown is pending.
    pub fn normalize(raw: &str) -> Self {
        match raw.trim().to_lowercase().replace(&[' ', '-'][..], "_").as_str() {
            "in_progress" | "doing" | "active" | "working" | "started" => TaskStatus::InProgress,
            "completed" | "complete" | "done" | "finished" => TaskStatus::Completed,
            _ => TaskStatus::Pending,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub content: String,
    pub status: TaskStatus,
    pub progress: u8,
}

fn clamp_progress(progress: i64) -> u8 {
    progress.clamp(0, 100) as u8
}

/// Session-scoped checklist the model maintains through the task_* commands.
#[derive(Debug, Default)]
pub struct TaskManager {
    tasks: Vec<Task>,
    next_seq: usize,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    fn next_id(&mut self) -> String {
        loop {
            self.next_seq += 1;
            let candidate = format!("T{}", self.next_seq);
            if !self.tasks.iter().any(|t| t.id == candidate) {
                return candidate;
            }
        }
    }

    #[instrument(skip(self, content))]
    pub fn add(
        &mut self,
        id: Option<&str>,
        content: &str,
        status: Option<&str>,
        progress: Option<i64>,
    ) -> Result<&Task, AppError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::InvalidInputArgument("Task content is empty".to_string()));
        }
        let id = match id.map(str::trim).filter(|s| !s.is_empty()) {
            Some(id) if self.tasks.iter().any(|t| t.id == id) => {
                return Err(AppError::InvalidInputArgument(format!("Task {} already exists", id)));
            }
            Some(id) => id.to_string(),
            None => self.next_id(),
        };
        let status = status.map(TaskStatus::normalize).unwrap_or(TaskStatus::Pending);
        let progress = match (progress, status) {
            (Some(p), _) => clamp_progress(p),
            (None, TaskStatus::Completed) => 100,
            (None, _) => 0,
        };
        debug!(id = %id, %status, progress, "Task added");
        self.tasks.push(Task {
            id,
            content: content.to_string(),
            status,
            progress,
        });
        Ok(&self.tasks[self.tasks.len() - 1])
    }

    #[instrument(skip(self, content))]
    pub fn update(
        &mut self,
        id: &str,
        content: Option<&str>,
        status: Option<&str>,
        progress: Option<i64>,
    ) -> Result<&Task, AppError> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| t.id == id.trim())
            .ok_or_else(|| AppError::InvalidInputArgument(format!("Task not found: {}", id)))?;
        if let Some(content) = content.map(str::trim).filter(|s| !s.is_empty()) {
            task.content = content.to_string();
        }
        if let Some(status) = status {
            task.status = TaskStatus::normalize(status);
            if task.status == TaskStatus::Completed && progress.is_none() {
                task.progress = 100;
            }
        }
        if let Some(progress) = progress {
            task.progress = clamp_progress(progress);
        }
        Ok(task)
    }

    pub fn delete(&mut self, id: &str) -> Result<Task, AppError> {
        let idx = self
            .tasks
            .iter()
            .position(|t| t.id == id.trim())
            .ok_or_else(|| AppError::InvalidInputArgument(format!("Task not found: {}", id)))?;
        Ok(self.tasks.remove(idx))
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.tasks.len();
        self.tasks.clear();
        self.next_seq = 0;
        removed
    }

    pub fn render(&self) -> String {
        if self.tasks.is_empty() {
            return "Tasks: (empty)".to_string();
        }
        let done = self.tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
        let doing = self.tasks.iter().filter(|t| t.status == TaskStatus::InProgress).count();
        let mut lines = vec![format!(
            "Tasks: {}/{} completed | {} in_progress",
            done,
            self.tasks.len(),
            doing
        )];
        for task in &self.tasks {
            lines.push(format!("- ({}) [{} {}%] {}", task.id, task.status, task.progress, task.content));
        }
        lines.join("\n")
    }
}
