//! Sava-Client
//!
//! Sava-Client -- the subscriber engine for the Sava pull-based messaging
//! service: flow control, lease management and batched acknowledgements.

mod errors;
pub use errors::{Result, SavaError};

mod histogram;

mod message;
pub use message::{AckResponse, Message};

mod batch_queue;
pub use batch_queue::BatchingOptions;

mod lease_manager;

mod subscriber;
pub use subscriber::{CloseBehavior, Subscriber, SubscriberBuilder, SubscriberOptions};
