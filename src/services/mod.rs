pub mod lifecycle;
mod publish;
mod stream;

pub use lifecycle::{CloseReason, Phase, SessionState};
pub use publish::PublishService;
pub use stream::{StreamHandle, StreamService};
