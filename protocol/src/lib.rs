//! Wire vocabulary shared by the feature server's application-control
//! transports: message frames exchanged with customer applications, webhook
//! hooks, verb nodes, and the snake-case body transform applied to outbound
//! webhook payloads.

mod hook;
mod message;
mod snake;
mod verb;

pub use hook::Hook;
pub use hook::HookMethod;
pub use message::AppCommand;
pub use message::InboundMessage;
pub use message::MessageType;
pub use message::OutboundMessage;
pub use snake::snake_case_keys;
pub use verb::ApplicationError;
pub use verb::VerbNode;
pub use verb::parse_application;
