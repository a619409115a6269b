//! Gateway dispatcher: runs one channel listener under supervision and hands
//! every accepted message to the command tree on its own task.

use std::sync::Arc;
use std::time::Duration;

use cmdgate_core::{tokenize, ExecutionContext, RootCommand};
use cmdgate_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use crate::config::ChannelConfig;
use crate::slack::SlackChannel;
use crate::traits::{Channel, ChannelMessage};
use crate::traq::TraqChannel;

const MAX_BACKOFF_SECS: u64 = 60;

/// Build the adapter selected by `config`.
pub async fn build_channel(config: ChannelConfig) -> anyhow::Result<Arc<dyn Channel>> {
    let channel: Arc<dyn Channel> = match config {
        ChannelConfig::Traq(traq) => Arc::new(TraqChannel::connect(traq).await?),
        ChannelConfig::Slack(slack) => Arc::new(SlackChannel::new(slack)?),
    };
    info!("cmdgate-channels: {} adapter ready", channel.name());
    Ok(channel)
}

/// Run `channel`'s listener with exponential-backoff restart until `cancel`
/// fires. In-flight commands get child tokens of `cancel`.
///
/// A listener that fails before delivering anything waits out the backoff
/// before reconnecting, even when the REST side still reports healthy.
pub async fn supervise(
    channel: Arc<dyn Channel>,
    root: Arc<RootCommand>,
    cancel: CancellationToken,
) {
    let mut backoff_secs: u64 = 1;
    while !cancel.is_cancelled() {
        let (tx, mut rx) = mpsc::channel::<ChannelMessage>(64);

        let channel_listen = channel.clone();
        let mut listen_handle = tokio::spawn(async move { channel_listen.listen(tx).await });

        let mut delivered = false;
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            delivered = true;
            let ch = channel.clone();
            let root = root.clone();
            let token = cancel.child_token();
            tokio::spawn(async move {
                process_channel_message(msg, ch, root, token).await;
            });
        }

        // the sender is gone, so the listener has returned or is returning
        let session = tokio::select! {
            _ = cancel.cancelled() => {
                listen_handle.abort();
                break;
            }
            joined = &mut listen_handle => joined,
        };
        let failed = match session {
            Ok(Ok(())) => false,
            Ok(Err(e)) => {
                error!("channel listener error: {e:#}");
                true
            }
            Err(e) => {
                error!("channel listener task failed: {e}");
                true
            }
        };

        if delivered || !failed {
            backoff_secs = 1;
        }
        let healthy = channel.health_check().await;
        if failed || !healthy {
            warn!(
                "channel '{}' {}, restarting in {}s",
                channel.name(),
                if healthy { "listener failed" } else { "unhealthy" },
                backoff_secs
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }
    info!("channel '{}' stopped", channel.name());
}

/// Tokenize one message and run it against the tree. Delivery failures are
/// logged; nothing is replied about them.
async fn process_channel_message(
    msg: ChannelMessage,
    channel: Arc<dyn Channel>,
    root: Arc<RootCommand>,
    cancel: CancellationToken,
) {
    let event = |event: &'static str, status: Option<&'static str>| ObservabilityEvent {
        event,
        component: channel.name(),
        channel_id: Some(&msg.channel_id),
        message_id: Some(&msg.id),
        executor: Some(&msg.sender),
        command: Some(&msg.content),
        status,
        ..Default::default()
    };
    emit_event(Level::INFO, ProcessKind::Gateway, event("command.received", None));

    let replier = channel.replier(&msg);
    let outcome = match tokenize(&msg.content) {
        Ok(args) => {
            let ctx = ExecutionContext::new(msg.sender.clone(), args, replier)
                .with_cancel(cancel)
                .with_issued_at(msg.timestamp);
            root.execute(ctx).await
        }
        Err(err) => {
            let ctx = ExecutionContext::new(msg.sender.clone(), Vec::new(), replier)
                .with_cancel(cancel);
            ctx.reply_bad(vec![err.to_string()]).await
        }
    };

    match outcome {
        Ok(()) => emit_event(Level::INFO, ProcessKind::Gateway, event("command.finished", None)),
        Err(err) => {
            let detail = err.to_string();
            emit_event(
                Level::ERROR,
                ProcessKind::Gateway,
                ObservabilityEvent {
                    error_code: Some("reply_failed"),
                    detail: Some(&detail),
                    ..event("command.reply_failed", Some("error"))
                },
            );
        }
    }
}
