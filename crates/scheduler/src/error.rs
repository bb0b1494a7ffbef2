#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("stream {0} has failed and no longer accepts work")]
    StreamFailed(u64),
    #[error("ticket {ticket} failed: {reason}")]
    TaskFatal { ticket: u32, reason: String },
}
