pub mod audit;
pub mod balance;
pub mod cache;
pub mod events;
pub mod processor;
pub mod projector;
pub mod scheduler;

pub use audit::{AuditRecorder, AuditSink};
pub use balance::BalanceService;
pub use cache::CacheService;
pub use events::EventPublisher;
pub use processor::TransactionProcessor;
pub use projector::{CatchUpReport, ProjectorService};
pub use scheduler::SchedulerService;
