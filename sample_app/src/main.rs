use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use serde_json::json;

use tether::channel::Channel;
use tether::completion::CompletionQueue;
use tether::engine::loopback::LoopbackEngine;
use tether::engine::{ConnectivityState, Deadline, RpcEngine};
use tether::watch::{ChannelWatchExt, WatchOutcome};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Target to open the channel against
    #[arg(long, default_value = "localhost:4000")]
    target: String,

    /// Create the channel with engine-issued credential material
    #[arg(long)]
    secure: bool,

    /// Give up waiting for Ready after this many milliseconds
    #[arg(long, default_value_t = 2000)]
    connect_timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {:#}", e); // Pretty format with all causes
        std::process::exit(1);
    }
}

async fn run() -> Result<(), anyhow::Error> {
    // Initialize logger
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let cli = Cli::parse();

    let loopback = Arc::new(LoopbackEngine::new());
    let engine: Arc<dyn RpcEngine> = loopback.clone();
    let queue = CompletionQueue::start().await?;

    let credentials = cli.secure.then(|| loopback.issue_credentials());
    let options = json!({
        "tether.primary_user_agent": "tether_sample_app/0.1",
        "engine.max_reconnect_backoff_ms": 10_000,
    });

    let channel = Channel::connect(
        engine,
        queue.clone(),
        &cli.target,
        credentials.as_ref(),
        Some(&options),
    )?;
    println!("channel open, target = {}", channel.target()?);
    println!(
        "engine-side arguments: {}",
        serde_json::to_string_pretty(
            &loopback
                .channel_args(&cli.target)
                .map(|args| args
                    .iter()
                    .map(|arg| format!("{} = {:?}", arg.key, arg.value))
                    .collect::<Vec<_>>())
                .unwrap_or_default()
        )?
    );

    // kick off a connect and follow the transitions until Ready
    let mut state = channel.connectivity_state(true)?;
    println!("state: {}", serde_json::to_string(&state)?);

    let give_up = Deadline::after(Duration::from_millis(cli.connect_timeout_ms));
    while state != ConnectivityState::Ready {
        match channel.next_state_change(state, give_up).await? {
            WatchOutcome::StateChanged(next) => {
                println!("state: {}", serde_json::to_string(&next)?);
                state = next;
            }
            WatchOutcome::DeadlineExceeded => {
                println!("gave up waiting for Ready");
                break;
            }
        }
    }

    let call = channel.create_call(
        "/demo.Greeter/Hello",
        Deadline::after(Duration::from_secs(5)),
        None,
        None,
        None,
    )?;
    info!("call created");
    drop(call);

    channel.close();
    match channel.target() {
        Err(err) => println!("after close, getTarget fails as expected: {err:#}"),
        Ok(target) => println!("unexpected: channel still answers with {target}"),
    }

    queue.shutdown();
    Ok(())
}
