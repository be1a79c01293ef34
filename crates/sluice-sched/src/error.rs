#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler threads already started")]
    AlreadyStarted,
    #[error("failed to spawn scheduler thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}
