pub mod coordinator;
pub mod handlers;
pub mod task;

pub use coordinator::FetchCoordinator;
pub use handlers::FetchHandlers;
pub use task::{FetchKind, FetchTask};
