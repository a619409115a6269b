pub mod config;
pub mod dispatcher;
pub mod slack;
pub mod traits;
pub mod traq;

pub use config::ChannelConfig;
pub use dispatcher::{build_channel, supervise};
pub use traits::{Channel, ChannelMessage};
