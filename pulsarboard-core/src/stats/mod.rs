mod errors;
pub use errors::{RepositoryError, Result};

mod store;
pub use store::StatsRepository;

mod memory_store;
pub use memory_store::MemoryStatsRepository;
