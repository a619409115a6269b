//! The compiled command tree.
//!
//! A [`RootCommand`] is built once from [`GatewayConfig`] and shared behind
//! an `Arc` for the lifetime of the process. Only the per-node running flags
//! change after compilation.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use tracing::{info, warn};

use crate::config::{CommandConfig, GatewayConfig};
use crate::error::CompileError;
use crate::logs::ExecLogs;
use crate::template::{compile_templates, TemplateTable};

pub const HELP_COMMAND: &str = "help";
pub const EXEC_LOG_COMMAND: &str = "exec-log";

/// Entries directly under the root.
pub enum CommandNode {
    Instance(CommandInstance),
    Help,
    ExecLog,
}

pub struct RootCommand {
    pub(crate) prefix: String,
    pub(crate) commands: BTreeMap<String, CommandNode>,
    pub(crate) work_dir: Option<PathBuf>,
    pub(crate) logs: Option<ExecLogs>,
}

pub struct CommandInstance {
    pub(crate) path: Vec<String>,
    pub(crate) description: String,
    pub(crate) allow_args: bool,
    pub(crate) args_syntax: String,
    pub(crate) args_prefix: Vec<String>,
    pub(crate) operators: BTreeSet<String>,
    pub(crate) template: Option<PathBuf>,
    pub(crate) allow_concurrency: bool,
    pub(crate) running: AtomicBool,
    pub(crate) sub_commands: BTreeMap<String, CommandInstance>,
}

impl RootCommand {
    pub fn compile(config: &GatewayConfig) -> Result<Self, CompileError> {
        let templates = compile_templates(&config.templates, &config.tmp_dir)?;
        let compiler = Compiler {
            templates: &templates,
            strict_operators: config.strict_operators,
        };
        let mut commands: BTreeMap<String, CommandNode> = compiler
            .compile_level(&config.commands, &[], &BTreeSet::new())?
            .into_iter()
            .map(|(name, cmd)| (name, CommandNode::Instance(cmd)))
            .collect();

        if commands.contains_key(HELP_COMMAND) {
            return Err(CompileError::Reserved(HELP_COMMAND.to_string()));
        }
        commands.insert(HELP_COMMAND.to_string(), CommandNode::Help);

        let logs = config.logs.as_ref().map(ExecLogs::from_config);
        if logs.is_some() {
            if commands.contains_key(EXEC_LOG_COMMAND) {
                return Err(CompileError::Reserved(EXEC_LOG_COMMAND.to_string()));
            }
            commands.insert(EXEC_LOG_COMMAND.to_string(), CommandNode::ExecLog);
        }

        info!(
            commands = commands.len(),
            templates = templates.len(),
            "compiled command tree"
        );
        Ok(Self {
            prefix: config.prefix.clone(),
            commands,
            work_dir: config.work_dir.clone(),
            logs,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn logs(&self) -> Option<&ExecLogs> {
        self.logs.as_ref()
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.work_dir.as_deref()
    }

    pub fn command_names(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&CommandNode> {
        self.commands.get(name)
    }

    /// Resolve a full command path to a configured command.
    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<&CommandInstance> {
        let (first, rest) = path.split_first()?;
        match self.commands.get(first.as_ref())? {
            CommandNode::Instance(cmd) => cmd.find(rest),
            _ => None,
        }
    }
}

impl CommandInstance {
    pub fn name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Names from the root down to this command.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Effective operators; empty means everyone.
    pub fn operators(&self) -> &BTreeSet<String> {
        &self.operators
    }

    pub fn template(&self) -> Option<&Path> {
        self.template.as_deref()
    }

    pub fn allows_args(&self) -> bool {
        self.allow_args
    }

    pub fn allows_concurrency(&self) -> bool {
        self.allow_concurrency
    }

    pub fn sub_commands(&self) -> impl Iterator<Item = &CommandInstance> {
        self.sub_commands.values()
    }

    pub fn permits(&self, executor: &str) -> bool {
        self.operators.is_empty() || self.operators.contains(executor)
    }

    pub fn find<S: AsRef<str>>(&self, path: &[S]) -> Option<&CommandInstance> {
        let mut node = self;
        for name in path {
            node = node.sub_commands.get(name.as_ref())?;
        }
        Some(node)
    }
}

struct Compiler<'a> {
    templates: &'a TemplateTable,
    strict_operators: bool,
}

impl Compiler<'_> {
    fn compile_level(
        &self,
        configs: &[CommandConfig],
        parent_path: &[String],
        parent_operators: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, CommandInstance>, CompileError> {
        let mut level = BTreeMap::new();
        for cc in configs {
            if cc.name.is_empty() {
                return Err(CompileError::UnnamedCommand);
            }
            if level.contains_key(&cc.name) {
                return Err(CompileError::DuplicateCommand(cc.name.clone()));
            }
            let template_ref = cc.template_ref.as_deref().filter(|r| !r.is_empty());
            if template_ref.is_none() && cc.sub_commands.is_empty() {
                return Err(CompileError::NoUse(cc.name.clone()));
            }
            let template = template_ref
                .map(|r| {
                    self.templates
                        .get(r)
                        .cloned()
                        .ok_or_else(|| CompileError::UnknownTemplate(r.to_string()))
                })
                .transpose()?;

            let mut path = parent_path.to_vec();
            path.push(cc.name.clone());
            let operators = self.effective_operators(&path, &cc.operators, parent_operators)?;
            let sub_commands = self
                .compile_level(&cc.sub_commands, &path, &operators)
                .map_err(|source| CompileError::SubCommand {
                    parent: cc.name.clone(),
                    source: Box::new(source),
                })?;

            level.insert(
                cc.name.clone(),
                CommandInstance {
                    path,
                    description: cc.description.clone(),
                    allow_args: cc.allow_args,
                    args_syntax: cc.args_syntax.clone(),
                    args_prefix: cc.args_prefix.clone(),
                    operators,
                    template,
                    allow_concurrency: cc.allow_concurrency,
                    running: AtomicBool::new(false),
                    sub_commands,
                },
            );
        }
        Ok(level)
    }

    fn effective_operators(
        &self,
        path: &[String],
        declared: &[String],
        parent: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>, CompileError> {
        let declared: BTreeSet<String> = declared.iter().cloned().collect();
        if parent.is_empty() {
            return Ok(declared);
        }
        if declared.is_empty() {
            return Ok(parent.clone());
        }
        let effective: BTreeSet<String> = declared.intersection(parent).cloned().collect();
        let command = path.join(" ");
        if effective.is_empty() {
            return Err(CompileError::NoOperators {
                command,
                declared: declared.into_iter().collect(),
            });
        }
        if effective.len() < declared.len() {
            let extra: Vec<String> = declared.difference(parent).cloned().collect();
            if self.strict_operators {
                return Err(CompileError::OperatorsNarrowed { command, extra });
            }
            warn!(
                command = %command,
                ?extra,
                "operators not permitted by the parent command are ignored"
            );
        }
        Ok(effective)
    }
}
