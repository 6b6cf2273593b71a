//! pipebridge console: a line-oriented terminal attached to a worker.
//!
//! Connects to the worker's primary channel as a secondary client, claims
//! the console, and then echoes interpreter output while sending stdin
//! lines as shell commands. Ctrl-C interrupts the worker through the
//! management channel.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::OwnedReadHalf;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pipebridge::config::default_socket_dir;
use pipebridge::ipc::{connect_with_retry, decode, read_frame, request_break, write_message, Endpoints, Retry};
use pipebridge::ipc::registry::TransactionRegistry;
use pipebridge::message::{ConsoleOutput, Control, Message, Payload};

#[derive(Parser, Debug)]
#[command(name = "pipebridge-console", version, about = "Terminal console for a pipebridge worker")]
struct Args {
    /// Base name of the worker channels
    #[arg(short = 'p', long)]
    pipe_name: String,

    /// Developer flags passed on by the front end
    #[arg(short = 'd', long, default_value_t = 0)]
    dev_flags: u32,

    /// Directory holding the channel sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pipebridge=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let socket_dir = args.socket_dir.unwrap_or_else(default_socket_dir);
    let endpoints = Endpoints::new(&socket_dir, &args.pipe_name);
    debug!("Console for {} (flags {})", args.pipe_name, args.dev_flags);

    let stream = connect_with_retry(&endpoints.primary, Retry::default())
        .await
        .with_context(|| format!("Failed to connect to {}", endpoints.primary.display()))?;
    let (reader, mut writer) = stream.into_split();

    let registry = TransactionRegistry::new();
    write_message(
        &mut writer,
        &Message::new(registry.next_id(), true, Payload::control(Control::Console)),
    )
    .await
    .context("Failed to claim the console")?;
    info!("Attached to {}", args.pipe_name);

    let mut output = tokio::spawn(print_output(reader));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let command = Message::new(registry.next_id(), true, Payload::ShellCommand(line));
                if let Err(e) = write_message(&mut writer, &command).await {
                    warn!("Worker connection lost: {}", e);
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if let Err(e) = request_break(&endpoints.management).await {
                    warn!("Break not delivered: {}", e);
                }
            }
            _ = &mut output => break,
        }
    }

    let _ = write_message(&mut writer, &Message::unsolicited(Payload::control(Control::Close))).await;
    output.abort();
    Ok(())
}

/// Echo worker output until the worker shuts down or the channel breaks.
async fn print_output(mut reader: OwnedReadHalf) {
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Output channel closed: {}", e);
                return;
            }
        };
        let message = match decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Undecodable output frame: {}", e);
                continue;
            }
        };

        match message.payload {
            Payload::Console(ConsoleOutput::Text(text)) => print_flush(&text),
            Payload::Console(ConsoleOutput::Err(text)) => eprint!("{}", text),
            Payload::Console(ConsoleOutput::Prompt(prompt)) => print_flush(&prompt),
            Payload::Console(ConsoleOutput::Graphics(command)) => debug!("Ignoring graphics {}", command),
            Payload::ControlMessage(text) => match Control::parse(&text) {
                Control::Shutdown => {
                    info!("Worker shut down");
                    return;
                }
                // The worker follows up with the top-level prompt.
                Control::ResetPrompt => print_flush("\n"),
                other => debug!("Ignoring control {:?}", other),
            },
            Payload::Error(text) => eprintln!("error: {}", text),
            other => debug!("Ignoring {} message {}", other.tag(), message.id),
        }
    }
}

fn print_flush(text: &str) {
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}
