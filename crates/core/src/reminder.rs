//! Situational reminders appended after each tool batch.

/// Supplies a short block of current state (open todos, recent notes) that is
/// appended to the history after every tool batch so the next model turn
/// starts from fresh context.
pub trait ReminderSource: Send + Sync {
    /// The reminder text, or `None` when there is nothing worth saying.
    fn reminder(&self) -> Option<String>;
}

/// Joins several sources, skipping those with nothing to say.
pub struct CompositeReminder {
    sources: Vec<std::sync::Arc<dyn ReminderSource>>,
}

impl CompositeReminder {
    pub fn new(sources: Vec<std::sync::Arc<dyn ReminderSource>>) -> Self {
        Self { sources }
    }
}

impl ReminderSource for CompositeReminder {
    fn reminder(&self) -> Option<String> {
        let parts: Vec<String> = self.sources.iter().filter_map(|s| s.reminder()).collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }
}
