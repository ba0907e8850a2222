pub mod channel;
pub mod credential;
pub mod event;
pub mod identity;
pub mod json_utils;

pub use channel::{ChannelDescriptor, ChannelKind};
pub use credential::StreamCredential;
pub use event::{EventType, NormalizedEvent, RawEvent};
pub use identity::AgentIdentity;
