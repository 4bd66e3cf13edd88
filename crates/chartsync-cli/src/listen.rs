// Copyright 2026 Chartsync Contributors
// SPDX-License-Identifier: Apache-2.0

//! Control-message listener: JSON lines in on stdin, events and acks out on
//! stdout.

use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

use chartsync::{dispatch, ControlAck, ControlMessage, FetchOrchestrator, HarvestEvent};

/// One line written to stdout.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum OutputLine<'a> {
    Event { event: &'a HarvestEvent },
    Ack { ack: &'a ControlAck },
    ParseError { message: String },
}

/// Run until stdin closes.
pub async fn run(orchestrator: Arc<FetchOrchestrator>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let events = orchestrator.subscribe();
    let forwarder = tokio::spawn(forward_events(events, tx.clone()));

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut line = String::new();
    tracing::info!("listening for control messages on stdin");

    loop {
        line.clear();
        let bytes = reader
            .read_line(&mut line)
            .await
            .context("failed to read stdin")?;
        if bytes == 0 {
            tracing::info!("EOF on stdin, shutting down");
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let output = match ControlMessage::parse(trimmed) {
            Ok(message) => {
                let ack = dispatch(&orchestrator, message).await;
                render(&OutputLine::Ack { ack: &ack })?
            }
            Err(e) => {
                tracing::warn!("unparseable control message: {e}");
                render(&OutputLine::ParseError {
                    message: e.to_string(),
                })?
            }
        };
        if tx.send(output).is_err() {
            break;
        }
    }

    forwarder.abort();
    drop(tx);
    let _ = writer.await;
    Ok(())
}

async fn forward_events(
    mut events: broadcast::Receiver<HarvestEvent>,
    tx: mpsc::UnboundedSender<String>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let Ok(line) = render(&OutputLine::Event { event: &event }) else {
                    continue;
                };
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!("event output lagged; {missed} event(s) dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn render(line: &OutputLine<'_>) -> anyhow::Result<String> {
    serde_json::to_string(line).context("failed to encode output line")
}
