mod api;
mod destination;
mod message;

pub use api::{HealthResponse, PublishResponse, ReadyResponse, StreamQuery};
pub use destination::Destination;
pub use message::Message;
