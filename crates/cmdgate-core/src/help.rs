use crate::context::{ExecutionContext, Status};
use crate::error::ReplyResult;
use crate::tree::{CommandInstance, CommandNode, RootCommand, EXEC_LOG_COMMAND, HELP_COMMAND};

pub const PRODUCT_NAME: &str = "cmdgate";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Renders an operator identity for display.
pub type OperatorRenderer<'a> = &'a dyn Fn(&str) -> String;

/// Operator identities shown as inline code.
pub fn plain_operator(identity: &str) -> String {
    format!("`{identity}`")
}

impl CommandInstance {
    /// Usage line for this command, plus every sub-command below it when
    /// `recursive` is set.
    pub fn help_lines(
        &self,
        prefix: &str,
        render: OperatorRenderer<'_>,
        indent: usize,
        recursive: bool,
    ) -> Vec<String> {
        let mut matcher = format!("{prefix}{}", self.path.join(" "));
        if !self.args_syntax.is_empty() {
            matcher.push(' ');
            matcher.push_str(&self.args_syntax);
        }
        let mut line = format!("{}- `{matcher}`", " ".repeat(indent));
        if !self.description.is_empty() {
            line.push_str(" - ");
            line.push_str(&self.description);
        }
        line.push_str(&format!(" ({})", render_operators(self, render)));
        if !recursive && !self.sub_commands.is_empty() {
            let n = self.sub_commands.len();
            line.push_str(&format!(
                " [{n} sub-command{}]",
                if n == 1 { "" } else { "s" }
            ));
        }

        let mut lines = vec![line];
        if recursive {
            for sub in self.sub_commands.values() {
                lines.extend(sub.help_lines(prefix, render, indent + 2, true));
            }
        }
        lines
    }
}

fn render_operators(cmd: &CommandInstance, render: OperatorRenderer<'_>) -> String {
    if cmd.operators.is_empty() {
        return "everyone".to_string();
    }
    cmd.operators
        .iter()
        .map(|op| render(op))
        .collect::<Vec<_>>()
        .join(", ")
}

impl RootCommand {
    /// One line per top-level entry, sorted by name.
    pub fn help_lines(&self, render: OperatorRenderer<'_>, recursive: bool) -> Vec<String> {
        let mut lines = Vec::new();
        for node in self.commands.values() {
            match node {
                CommandNode::Instance(cmd) => {
                    lines.extend(cmd.help_lines(&self.prefix, render, 0, recursive))
                }
                CommandNode::Help | CommandNode::ExecLog => {
                    lines.push(self.intrinsic_help_line(node))
                }
            }
        }
        lines
    }

    fn intrinsic_help_line(&self, node: &CommandNode) -> String {
        let prefix = &self.prefix;
        match node {
            CommandNode::ExecLog => format!(
                "- `{prefix}{EXEC_LOG_COMMAND} <command...> <unix>` - Get a one-time download URL for an execution log. (everyone)"
            ),
            _ => format!("- `{prefix}{HELP_COMMAND} [command...]` - Display help message. (everyone)"),
        }
    }

    /// Usage of the node at `path`, or `None` if there is no such node.
    pub fn usage_lines(&self, path: &[String], render: OperatorRenderer<'_>) -> Option<Vec<String>> {
        let (first, rest) = path.split_first()?;
        match self.commands.get(first)? {
            CommandNode::Instance(cmd) => {
                let node = cmd.find(rest)?;
                Some(node.help_lines(&self.prefix, render, 0, true))
            }
            intrinsic if rest.is_empty() => Some(vec![self.intrinsic_help_line(intrinsic)]),
            _ => None,
        }
    }

    pub(crate) async fn execute_help(&self, ctx: ExecutionContext) -> ReplyResult {
        let render = |id: &str| ctx.render_operator(id);
        if ctx.args().is_empty() {
            let mut lines = vec![format!("## {PRODUCT_NAME} v{VERSION}"), String::new()];
            lines.extend(self.help_lines(&render, false));
            lines.push(String::new());
            lines.push(status_legend(&ctx));
            lines.push(format!(
                "Type `{}{HELP_COMMAND} command-name` for more help",
                self.prefix
            ));
            return ctx.reply_success(lines).await;
        }

        match self.usage_lines(ctx.args(), &render) {
            Some(usage) => {
                let mut lines = vec![format!("## `{}{}` Usage", self.prefix, ctx.args().join(" "))];
                lines.extend(usage);
                ctx.reply_success(lines).await
            }
            None => {
                ctx.reply_bad(vec![format!(
                    "Command `{}{}` not found",
                    self.prefix,
                    ctx.args().join(" ")
                )])
                .await
            }
        }
    }
}

fn status_legend(ctx: &ExecutionContext) -> String {
    let markers = Status::ALL
        .iter()
        .map(|status| format!("{} {status}", ctx.status_name(*status)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Markers: {markers}")
}
