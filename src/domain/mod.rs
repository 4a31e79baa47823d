pub mod consumer;
pub mod event;

pub use consumer::{IdentifyConsumerFn, default_identify_consumer, hash_consumer_id};
pub use event::RequestEvent;
