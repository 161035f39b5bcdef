mod health;
pub mod messages;

pub use health::{health_check, readiness_check, root};
pub use messages::{publish, stream_messages};
