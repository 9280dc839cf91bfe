//! Line-based chat client.
//!
//! Run with: cargo run -p console-chat -- [config.json]
//!
//! Without a config file the defaults apply; `AGENTWIRE_URL` and
//! `AGENTWIRE_AGENT` override the endpoint either way. Type a line to send
//! it, `/agent <id>` to hand off, `/reconnect` after a failure, `/quit` to
//! exit.

use std::sync::Arc;

use agentwire_core::{
    ClientConfig, Consumer, Envelope, HandlerError, SessionEvent,
    payload::{
        ChatPayload, ErrorPayload, HandoffPayload, ReasoningPayload, StatusPayload, ToolPayload,
    },
};
use agentwire_session::{EventRouter, SessionClient};
use agentwire_transport::WsTransport;
use anyhow::Context;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

type HandlerResult = Result<(), HandlerError>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ClientConfig::from_file(&path)
            .with_context(|| format!("loading config from {path}"))?,
        None => ClientConfig::default(),
    }
    .apply_env();

    let (client, driver) = SessionClient::spawn(&config, Arc::new(WsTransport::new()), router())
        .context("starting session client")?;

    let mut events = client.subscribe_events();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            print_event(&event);
        }
    });

    client.connect().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {}
            ("/quit", _) => break,
            ("/reconnect", _) => {
                client.connect().await?;
            }
            ("/agent", agent) => match client.switch_agent(agent).await {
                Ok(true) => {}
                Ok(false) => println!("* already talking to {agent}"),
                Err(e) => println!("* cannot switch: {e}"),
            },
            _ => {
                client.send(line).await?;
            }
        }
    }

    client.shutdown().await?;
    driver.await?;
    printer.abort();
    Ok(())
}

fn router() -> EventRouter {
    let mut router = EventRouter::new();

    router.register_consumer(Consumer::Transcript, |envelope: &Envelope| -> HandlerResult {
        let chat: ChatPayload = envelope.payload_as()?;
        let who = chat.agent_name.as_deref().unwrap_or("agent");
        println!("{who}> {}", chat.content);
        for step in &chat.reasoning_steps {
            println!("    ({}) {}", step.step_type, step.description);
        }
        Ok(())
    });

    router.register_consumer(
        Consumer::ReasoningTrace,
        |envelope: &Envelope| -> HandlerResult {
            let step: ReasoningPayload = envelope.payload_as()?;
            println!("    ({}) {}", step.step_type, step.description);
            Ok(())
        },
    );

    router.register_consumer(Consumer::ToolUsage, |envelope: &Envelope| -> HandlerResult {
        let tool: ToolPayload = envelope.payload_as()?;
        println!(
            "    [{}] {}",
            envelope.kind,
            tool.tool_name.as_deref().unwrap_or("tool")
        );
        Ok(())
    });

    router.register_consumer(
        Consumer::ConnectivityBanner,
        |envelope: &Envelope| -> HandlerResult {
            let status: StatusPayload = envelope.payload_as()?;
            println!("* {}", status.content);
            Ok(())
        },
    );

    router.register_consumer(Consumer::ErrorSurface, |envelope: &Envelope| -> HandlerResult {
        let error: ErrorPayload = envelope.payload_as()?;
        match error.error_code {
            Some(code) => println!("! {} ({code})", error.content),
            None => println!("! {}", error.content),
        }
        Ok(())
    });

    router.register_consumer(Consumer::Handoff, |envelope: &Envelope| -> HandlerResult {
        let handoff: HandoffPayload = envelope.payload_as()?;
        let name = handoff.to_agent_name.as_deref().unwrap_or(&handoff.to_agent_id);
        println!("* handing off to {name}");
        Ok(())
    });

    router.register_consumer(Consumer::Liveness, |_: &Envelope| -> HandlerResult {
        Ok(())
    });

    router
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::StatusChanged { to, attempt, .. } if *attempt > 0 => {
            println!("* {to} (attempt {attempt})");
        }
        SessionEvent::StatusChanged { to, .. } => println!("* {to}"),
        SessionEvent::ReconnectScheduled { delay_ms, .. } => {
            println!("* retrying in {delay_ms} ms");
        }
        SessionEvent::Fatal { attempts, .. } => {
            println!("! gave up after {attempts} attempts; type /reconnect to try again");
        }
        SessionEvent::SessionStarted { .. } | SessionEvent::Handoff { .. } => {}
    }
}
