use colored::*;
use tabled::{Table, Tabled, settings::Style};

use contentgen::database::repositories::ForceCancelOutcome;
use contentgen::domain::Task;

#[derive(Tabled)]
struct TaskRow {
    #[tabled(rename = "Task")]
    task_id: String,
    #[tabled(rename = "Resource")]
    resource_ref: String,
    #[tabled(rename = "Type")]
    task_type: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Progress")]
    progress: String,
    #[tabled(rename = "Message")]
    message: String,
    #[tabled(rename = "Updated")]
    updated_at: String,
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            resource_ref: task.resource_ref.clone(),
            task_type: task.task_type.to_string(),
            status: task.status.to_string(),
            progress: format!("{}%", task.progress),
            message: task.message.clone().unwrap_or_default(),
            updated_at: task.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

pub fn task_table(tasks: &[Task]) -> String {
    let rows: Vec<TaskRow> = tasks.iter().map(TaskRow::from).collect();
    Table::new(rows).with(Style::rounded()).to_string()
}

fn section(title: &str, tasks: &[Task]) {
    println!("\n{}", title.green().bold());
    if tasks.is_empty() {
        println!("  {}", "(none)".dimmed());
    } else {
        println!("{}", task_table(tasks));
    }
}

/// Print the before/after snapshots and what is still active.
pub fn print_outcome(outcome: &ForceCancelOutcome) {
    section("Before", &outcome.before);
    section("After", &outcome.after);
    section("Remaining active", &outcome.remaining_active);

    let affected = outcome.affected_count();
    let summary = format!("{affected} task(s) force-cancelled");
    if affected == 0 {
        println!("\n{}", summary.yellow());
    } else {
        println!("\n{}", summary.cyan().bold());
    }

    if !outcome.remaining_active.is_empty() {
        println!(
            "{} {} task(s) are still active",
            "Warning:".yellow().bold(),
            outcome.remaining_active.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contentgen::domain::{TaskStatus, TaskType};

    fn task(id: &str, status: TaskStatus) -> Task {
        let now = "2026-01-01T10:00:00Z".parse().unwrap();
        Task {
            task_id: id.to_string(),
            resource_ref: "phys.p1.1".to_string(),
            task_type: TaskType::FullGeneration,
            status,
            progress: 60,
            message: Some("Generating quiz".to_string()),
            error: None,
            cancel_requested: false,
            version: 4,
            created_at: now,
            updated_at: now,
            started_at: Some(now),
            cancelled_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_task_table_lists_rows() {
        let table = task_table(&[
            task("t-1", TaskStatus::Running),
            task("t-2", TaskStatus::Cancelled),
        ]);

        assert!(table.contains("Resource"));
        assert!(table.contains("t-1"));
        assert!(table.contains("running"));
        assert!(table.contains("cancelled"));
        assert!(table.contains("60%"));
        assert!(table.contains("2026-01-01 10:00:00"));
    }
}
