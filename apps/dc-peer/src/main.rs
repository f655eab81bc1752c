mod cli;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tokio::io::{self, AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use transport_datachannel::{
    DataChannelPeer, Engine, LoopbackEngine, Message, PeerConfig, PeerConnection,
};

type StdinLines = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = cli::Cli::parse();
    run(cli).await
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init() {
        Ok(()) => Ok(()),
        Err(err)
            if err
                .to_string()
                .contains("attempted to set a global default subscriber more than once") =>
        {
            Ok(())
        }
        Err(err) => Err(anyhow!(err)),
    }
}

async fn run(cli: cli::Cli) -> Result<()> {
    match cli.command {
        cli::Commands::Loopback { messages, label } => loopback(messages, &label).await,
        cli::Commands::Offer { peer, label } => {
            let mut lines = BufReader::new(io::stdin()).lines();
            let engine = native_engine(peer.engine_log)?;
            let mut local = DataChannelPeer::new(Arc::clone(&engine), peer.config());

            let offer = local.offer(&label).await.context("creating offer")?;
            print_description("offer", &offer);
            eprintln!("Paste the answer, then an empty line:");
            let answer = read_description(&mut lines).await?;
            local.accept_answer(&answer).context("applying answer")?;

            local.await_data_channel().await?;
            chat(&mut local, &mut lines).await?;
            drop(local);
            engine.cleanup();
            Ok(())
        }
        cli::Commands::Answer { peer } => {
            let mut lines = BufReader::new(io::stdin()).lines();
            let engine = native_engine(peer.engine_log)?;
            let mut local = DataChannelPeer::new(Arc::clone(&engine), peer.config());

            eprintln!("Paste the offer, then an empty line:");
            let offer = read_description(&mut lines).await?;
            let answer = local.accept_offer(&offer).await.context("applying offer")?;
            print_description("answer", &answer);

            local.await_data_channel().await?;
            chat(&mut local, &mut lines).await?;
            drop(local);
            engine.cleanup();
            Ok(())
        }
    }
}

#[cfg(feature = "native")]
fn native_engine(engine_log: bool) -> Result<Arc<dyn Engine>> {
    use transport_datachannel::native::{enable_engine_logging, EngineLogLevel, NativeEngine};

    if engine_log {
        enable_engine_logging(EngineLogLevel::Debug);
    }
    Ok(Arc::new(NativeEngine::new()))
}

#[cfg(not(feature = "native"))]
fn native_engine(_engine_log: bool) -> Result<Arc<dyn Engine>> {
    Err(transport_datachannel::PeerError::NativeUnavailable)
        .context("rebuild dc-peer with `--features native` to talk to a remote peer")
}

fn print_description(kind: &str, description: &str) {
    eprintln!("---- local {kind} (copy everything up to the blank line) ----");
    println!("{}", description.trim_end());
    println!();
}

/// Reads description lines until a blank line or end of input.
async fn read_description(lines: &mut StdinLines) -> Result<String> {
    let mut description = String::new();
    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        if line.trim().is_empty() {
            if description.is_empty() {
                continue;
            }
            break;
        }
        description.push_str(line.trim_end());
        description.push_str("\r\n");
    }
    if description.is_empty() {
        return Err(anyhow!("no session description received on stdin"));
    }
    Ok(description)
}

async fn chat(peer: &mut DataChannelPeer, lines: &mut StdinLines) -> Result<()> {
    info!("data channel open; type a line to send it, EOF to quit");
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => peer.send(&line)?,
                None => break,
            },
            message = peer.recv() => match message {
                Some(Message::Text(text)) => println!("< {text}"),
                Some(Message::Binary(bytes)) => println!("< [{} bytes]", bytes.len()),
                None => {
                    info!("remote peer closed the channel");
                    break;
                }
            },
        }
    }
    peer.close();
    Ok(())
}

async fn loopback(messages: usize, label: &str) -> Result<()> {
    let engine = Arc::new(LoopbackEngine::new());
    let mut alice = DataChannelPeer::new(engine.clone(), PeerConfig::localhost());
    let mut bob = DataChannelPeer::new(engine.clone(), PeerConfig::localhost());

    let offer = alice.offer(label).await?;
    let answer = bob.accept_offer(&offer).await?;
    alice.accept_answer(&answer)?;
    alice.await_data_channel().await?;
    bob.await_data_channel().await?;
    info!(?alice, ?bob, "loopback pair connected");

    for n in 0..messages {
        alice.send(&format!("ping {n}"))?;
        let received = bob.recv().await.context("channel closed early")?;
        println!("bob   < {}", received.as_text().unwrap_or("<binary>"));

        bob.send_binary(format!("pong {n}").as_bytes())?;
        let received = alice.recv().await.context("channel closed early")?;
        println!("alice < [{} bytes]", received.len());
    }

    alice.close();
    bob.close();
    engine.cleanup();
    let stats = engine.stats();
    info!(
        connections = stats.connections_created,
        channels = stats.channels_created,
        messages = stats.messages_sent,
        "loopback finished"
    );
    Ok(())
}
