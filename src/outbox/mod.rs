//! Decouples "decide to send" from "actually send" so a crash between the
//! two never drops or silently duplicates an outbound message.

mod model;
mod repository;
mod sender;

pub use model::{EnqueueSendOptions, OutboxMessage, OutboxStatus};
pub use repository::OutboxRepository;
pub use sender::{OutboxSender, OutboxSenderConfig, SendFn};
