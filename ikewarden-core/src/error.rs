use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The event queue cannot take another node.
    #[error("Event queue capacity exceeded ({capacity} events) while scheduling {name}")]
    Allocation { name: &'static str, capacity: usize },

    #[error("Invalid capacity (must be non-zero)")]
    InvalidCapacity,
}
