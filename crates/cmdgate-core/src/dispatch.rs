//! Resolving an invocation against the tree and running it.
//!
//! Nothing in here returns an error for a bad invocation: every problem the
//! invoker can fix becomes a reply. The only error is a reply that could not
//! be delivered.

use std::time::Duration;

use tracing::{info, warn, Instrument};

use crate::context::ExecutionContext;
use crate::error::ReplyResult;
use crate::exec::{run_program, RunningGuard};
use crate::help::OperatorRenderer;
use crate::logs::{ExecLogs, LogStamp};
use crate::output::{limit_log, output_budget, sanitize_output};
use crate::tree::{CommandInstance, CommandNode, RootCommand, EXEC_LOG_COMMAND, HELP_COMMAND};

impl RootCommand {
    pub async fn execute(&self, ctx: ExecutionContext) -> ReplyResult {
        let span = ctx.span().clone();
        self.dispatch(ctx).instrument(span).await
    }

    async fn dispatch(&self, ctx: ExecutionContext) -> ReplyResult {
        let Some(verb) = ctx.args().first().cloned() else {
            return ctx
                .reply_bad(vec![format!(
                    "No command given, try `{}{HELP_COMMAND}`",
                    self.prefix
                )])
                .await;
        };
        let Some(node) = self.commands.get(&verb) else {
            return ctx
                .reply_bad(vec![format!(
                    "Unrecognized command `{verb}`, try `{}{HELP_COMMAND}`",
                    self.prefix
                )])
                .await;
        };
        let ctx = ctx.shift_args();
        match node {
            CommandNode::Instance(cmd) => cmd.execute(self, ctx).await,
            CommandNode::Help => self.execute_help(ctx).await,
            CommandNode::ExecLog => self.execute_exec_log(ctx).await,
        }
    }

    async fn execute_exec_log(&self, ctx: ExecutionContext) -> ReplyResult {
        let Some(logs) = &self.logs else {
            return ctx.reply_bad(vec!["Execution logs are not enabled".to_string()]).await;
        };
        let usage = format!(
            "Usage: `{}{EXEC_LOG_COMMAND} <command...> <unix>`",
            self.prefix
        );
        let Some((unix, path)) = ctx.args().split_last() else {
            return ctx.reply_bad(vec![usage]).await;
        };
        if path.is_empty() {
            return ctx.reply_bad(vec![usage]).await;
        }
        let Ok(stamp) = unix.parse::<LogStamp>() else {
            return ctx
                .reply_bad(vec![format!("Invalid timestamp `{unix}`"), usage])
                .await;
        };
        let Some(cmd) = self.find(path).filter(|cmd| cmd.template().is_some()) else {
            return ctx
                .reply_bad(vec![format!(
                    "Unrecognized command `{}{}`",
                    self.prefix,
                    path.join(" ")
                )])
                .await;
        };
        if !cmd.permits(ctx.executor()) {
            return ctx
                .reply_forbidden(vec![forbidden_text(&self.prefix, cmd)])
                .await;
        }

        let file = logs.file_path(cmd.path(), stamp);
        if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
            return ctx
                .reply_bad(vec![format!(
                    "No log for `{}{}` at {stamp}",
                    self.prefix,
                    path.join(" ")
                )])
                .await;
        }
        let key = logs
            .cache()
            .insert(ExecLogs::file_name(cmd.path(), stamp));
        info!(file = %file.display(), "issued log access key");
        ctx.reply_success(Vec::new()).await?;
        ctx.reply_direct(vec![
            logs.url_for(&key),
            format!(
                "This URL is valid for {} minutes.",
                logs.cache().ttl().as_secs() / 60
            ),
        ])
        .await
    }
}

/// Upper bound on how long the running marker may hold up the final reply.
/// The process itself never waits for it.
const RUNNING_MARKER_TIMEOUT: Duration = Duration::from_secs(5);

fn forbidden_text(prefix: &str, cmd: &CommandInstance) -> String {
    format!(
        "You do not have permission to execute this command (`{prefix}{}`).",
        cmd.path().join(" ")
    )
}

impl CommandInstance {
    /// Walk down from this command, checking permissions at every level,
    /// then run whichever node the remaining arguments stop at.
    pub(crate) async fn execute(&self, root: &RootCommand, ctx: ExecutionContext) -> ReplyResult {
        let mut node = self;
        let mut ctx = ctx;
        loop {
            if !node.permits(ctx.executor()) {
                info!(command = %node.path().join(" "), "executor not permitted");
                return ctx
                    .reply_forbidden(vec![forbidden_text(&root.prefix, node)])
                    .await;
            }
            let Some(verb) = ctx.args().first().cloned() else {
                break;
            };
            if let Some(sub) = node.sub_commands.get(&verb) {
                node = sub;
                ctx = ctx.shift_args();
                continue;
            }
            if node.template.is_none() {
                return ctx
                    .reply_bad(vec![format!(
                        "Unrecognized sub-command `{verb}`, try `{}{HELP_COMMAND} {}`",
                        root.prefix,
                        node.path().join(" ")
                    )])
                    .await;
            }
            break;
        }
        node.execute_self(root, ctx).await
    }

    async fn execute_self(&self, root: &RootCommand, ctx: ExecutionContext) -> ReplyResult {
        let matcher = format!("{}{}", root.prefix, self.path.join(" "));
        let Some(program) = self.template.as_deref() else {
            let render = |id: &str| ctx.render_operator(id);
            let lines = self.usage(&matcher, root, &render);
            return ctx.reply_bad(lines).await;
        };

        if !self.allow_args && !ctx.args().is_empty() {
            return ctx
                .reply_bad(vec![
                    format!(
                        "Command `{matcher}` cannot have extra arguments (you supplied `{}`)",
                        ctx.args().join(" ")
                    ),
                    "Try setting `allowArgs: true` in config to allow extra arguments".to_string(),
                ])
                .await;
        }

        let _guard = if self.allow_concurrency {
            None
        } else {
            match RunningGuard::acquire(&self.running) {
                Some(guard) => Some(guard),
                None => {
                    info!(command = %matcher, "command already running");
                    return ctx
                        .reply_bad(vec![format!(
                            "Command `{matcher}` is already running, try again later"
                        )])
                        .await;
                }
            }
        };

        let mut args = self.args_prefix.clone();
        args.extend(ctx.args().iter().cloned());
        info!(command = %matcher, ?args, "executing template");
        let started_at = ctx.issued_at().timestamp();
        let (marker, outcome) = tokio::join!(
            tokio::time::timeout(RUNNING_MARKER_TIMEOUT, ctx.reply_running(Vec::new())),
            run_program(program, &args, root.work_dir(), ctx.cancel_token()),
        );
        match marker {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to send running marker: {err}"),
            Err(_) => warn!("running marker not delivered within {RUNNING_MARKER_TIMEOUT:?}"),
        }

        let mut log_hint = None;
        if let Some(logs) = &root.logs {
            match logs.write(&self.path, started_at, &outcome.output).await {
                Ok(stamp) => {
                    log_hint = Some(format!(
                        "Full log: `{}{EXEC_LOG_COMMAND} {} {stamp}`",
                        root.prefix,
                        self.path.join(" ")
                    ))
                }
                Err(err) => warn!("failed to write execution log: {err}"),
            }
        }

        let output = limit_log(
            &sanitize_output(&outcome.output),
            output_budget(ctx.message_limit()),
        );
        let mut lines = Vec::new();
        match &outcome.result {
            Ok(()) => {
                info!(command = %matcher, "template succeeded");
                if output.is_empty() {
                    lines.push("*No output*".to_string());
                } else {
                    lines.extend(code_block(&output));
                }
            }
            Err(err) => {
                warn!(command = %matcher, "template failed: {err}");
                lines.push(format!("exec failed: {err}"));
                lines.extend(code_block(&output));
            }
        }
        lines.extend(log_hint);

        if outcome.result.is_ok() {
            ctx.reply_success(lines).await
        } else {
            ctx.reply_failure(lines).await
        }
    }

    fn usage(&self, matcher: &str, root: &RootCommand, render: OperatorRenderer<'_>) -> Vec<String> {
        if self.sub_commands.is_empty() {
            return vec![format!(
                "Command `{matcher}` has no use, maybe the bot is badly configured?"
            )];
        }
        let mut lines = vec![format!("## `{matcher}` Usage")];
        lines.extend(self.help_lines(&root.prefix, render, 0, true));
        lines
    }
}

fn code_block(text: &str) -> [String; 3] {
    [
        "```".to_string(),
        text.trim_end_matches('\n').to_string(),
        "```".to_string(),
    ]
}
