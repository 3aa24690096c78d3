//! Interactive CLI channel
//!
//! Reads lines from stdin and publishes them on the `cli` channel. Replies,
//! including subagent summaries that arrive later, are printed as they come.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use agent_core::{InboundMessage, MessageBus};

use crate::channel::{OutboundRouter, next_for};

pub const CLI_CHANNEL: &str = "cli";
pub const CLI_CHAT_ID: &str = "direct";

const EXIT_WORDS: &[&str] = &["exit", "quit", "/exit", "/quit", ":q"];

pub fn is_exit(line: &str) -> bool {
    let line = line.trim();
    EXIT_WORDS.iter().any(|w| line.eq_ignore_ascii_case(w))
}

pub async fn run(bus: Arc<MessageBus>, outbound: OutboundRouter, shutdown: CancellationToken) -> anyhow::Result<()> {
    let mut rx = outbound.subscribe();
    let printer_shutdown = shutdown.clone();
    let printer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = printer_shutdown.cancelled() => break,
                msg = next_for(&mut rx, CLI_CHANNEL, CLI_CHAT_ID) => match msg {
                    Some(msg) => println!("\n🤖 {}\n", msg.content),
                    None => break,
                },
            }
        }
    });

    println!("Interactive mode. Type /help for commands, /stop to interrupt, exit to quit.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if is_exit(&line) {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        bus.publish_inbound(InboundMessage::new(CLI_CHANNEL, "user", CLI_CHAT_ID, line))
            .await?;
    }

    printer.abort();
    println!("Goodbye!");
    Ok(())
}
