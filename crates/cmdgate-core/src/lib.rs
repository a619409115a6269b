//! Command tree compilation and execution for the cmdgate chat gateway.

pub mod config;
pub mod context;
mod dispatch;
pub mod error;
pub mod exec;
pub mod help;
pub mod lexer;
pub mod logs;
pub mod output;
pub mod retry;
pub mod template;
pub mod tree;

#[cfg(test)]
mod test_support;

pub use config::{BotMode, GatewayConfig};
pub use context::{ExecutionContext, Replier, Status};
pub use error::{CompileError, ReplyError, ReplyResult};
pub use lexer::{tokenize, TokenizeError};
pub use logs::{ExecLogs, LogAccessCache, LogStamp};
pub use retry::{with_retry, RetryError, RetryPolicy};
pub use tree::{CommandInstance, CommandNode, RootCommand};
