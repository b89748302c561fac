//! `reply-stream <prompt...>`: stream one reply to stdout

use reply_stream::store::FAILED_TURN_TEXT;
use reply_stream::{CallbackEvent, ChannelCallbacks, Conversation, StreamConfig};
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so stdout carries only the reply
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reply_stream=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if prompt.trim().is_empty() {
        eprintln!("usage: reply-stream <prompt...>");
        std::process::exit(2);
    }

    let config = StreamConfig::from_env();
    tracing::info!(
        url = %config.base_url,
        expand = config.expand,
        inactivity_secs = config.inactivity_timeout.as_secs(),
        "Starting reply stream"
    );
    let conversation = Conversation::connect(config)?;

    let mut modes = conversation.mode().updates();
    tokio::spawn(async move {
        while let Some(state) = modes.next().await {
            tracing::info!(
                mode = %state.current,
                consecutive_errors = state.consecutive_errors,
                "Mode changed"
            );
        }
    });

    let (callbacks, mut events) = ChannelCallbacks::new();
    let turn_id = match conversation.send(prompt, callbacks).await {
        Ok(turn_id) => turn_id,
        Err(e) => {
            println!("{FAILED_TURN_TEXT}");
            return Err(e.into());
        }
    };

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping stream");
                conversation.stop().await;
                continue;
            }
        };

        match event {
            Some(CallbackEvent::Retry {
                attempt,
                delay,
                error,
            }) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(attempt, delay_ms, error = %error, "Retrying");
            }
            Some(CallbackEvent::Limit(limit)) => {
                tracing::warn!(limit = %limit, "Server limit reached");
            }
            Some(CallbackEvent::Complete(turn)) => {
                println!("{}", turn.text);
                if let Some(performance) = &turn.performance {
                    tracing::info!(
                        elapsed_ms = performance.elapsed_ms,
                        fragments = performance.fragments,
                        retries = performance.retries,
                        "Reply complete"
                    );
                }
                return Ok(());
            }
            Some(CallbackEvent::Error(error)) => {
                println!("{FAILED_TURN_TEXT}");
                return Err(error.into());
            }
            Some(CallbackEvent::Cancelled) => {
                let partial = conversation
                    .client()
                    .store()
                    .get(&turn_id)
                    .map(|t| t.text.clone())
                    .unwrap_or_default();
                println!("{partial}");
                return Err("stream cancelled".into());
            }
            Some(_) => {}
            None => return Err("stream ended without a result".into()),
        }
    }
}
