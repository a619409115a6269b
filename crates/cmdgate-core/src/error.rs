use thiserror::Error;

use crate::retry::RetryError;

/// Configuration problems found while compiling the command tree. Fatal at
/// startup.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error("template needs to have a name")]
    UnnamedTemplate,

    #[error("template {0} conflict")]
    DuplicateTemplate(String),

    #[error("template {0} cannot have both command and execFile set")]
    AmbiguousTemplate(String),

    #[error("template {0} needs to have either command or execFile")]
    EmptyTemplate(String),

    #[error("materializing template {name}: {source}")]
    Materialize {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command needs a name")]
    UnnamedCommand,

    #[error("command name {0} conflict")]
    DuplicateCommand(String),

    #[error("invalid template ref {0}")]
    UnknownTemplate(String),

    #[error("command {0} has no self command or sub-commands defined")]
    NoUse(String),

    #[error("command {command} allows no operators: none of {declared:?} are permitted by its parent")]
    NoOperators {
        command: String,
        declared: Vec<String>,
    },

    #[error("command {command} declares operators {extra:?} that its parent does not permit")]
    OperatorsNarrowed { command: String, extra: Vec<String> },

    #[error("`{0}` command is an intrinsic command and cannot be overridden")]
    Reserved(String),

    #[error("compiling sub-commands of {parent}: {source}")]
    SubCommand {
        parent: String,
        #[source]
        source: Box<CompileError>,
    },
}

/// An outbound reply could not be delivered, even after retrying.
#[derive(Error, Debug)]
#[error("delivering reply: {0}")]
pub struct ReplyError(#[from] pub RetryError);

pub type ReplyResult = std::result::Result<(), ReplyError>;
