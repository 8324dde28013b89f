use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use smapoc_daq::{
    externals::{
        config::{ConfigStore, JsonConfigStore},
        port_search::{available_ports, PortSearcher},
    },
    internals::{
        script::{run_script, Script},
        signal::SignalMode,
    },
    system,
};
use tokio::signal;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::level_filters::LevelFilter;

/// Acquisition host for the actuator board, force amplifier and laser sensor.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(long, default_value = "global_config.json")]
    config: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// Where the actuator power vector comes from.
    #[arg(long, value_enum, default_value_t = SignalMode::Sine)]
    mode: SignalMode,

    /// Run a power script instead of the live signal. Implies direct mode.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Print the serial ports that look like known instruments and exit.
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_max_level(args.log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let store = Arc::new(JsonConfigStore::new(&args.config));

    if args.list_ports {
        let config = store.load()?;
        let ports = available_ports()?;
        for candidate in PortSearcher::new(&config).all(&ports) {
            println!("{}\t{}\t{}", candidate.kind, candidate.port, candidate.detail);
        }
        return Ok(());
    }

    let script = match &args.script {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read script {}", path.display()))?;
            Some(text.parse::<Script>()?)
        }
        None => None,
    };

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    // NOTE: No vendor laser library is linked into this binary.
    let system = system::start(&token, &tracker, store, None).await?;

    match script {
        Some(script) => {
            system.scheduler.start_requesting(SignalMode::Direct)?;
            let token_clone = token.clone();
            let scheduler = system.scheduler.clone();
            tracker.spawn(async move {
                if let Err(e) = run_script(token_clone, script, scheduler).await {
                    tracing::error!("Script failed. Error: {}", e);
                }
            });
        }
        None => system.scheduler.start_requesting(args.mode)?,
    }

    let token_clone = token.clone();

    tokio::select! {
        _ = token_clone.cancelled() => {}
        res = signal::ctrl_c() => {
            match res {
                Ok(_) => {
                    token.cancel();
                },
                Err(e)=>{
                    tracing::error!("Failed to listen for ctrl_c. Error: {}", e);
                    token.cancel();
                }
            };
        },
    }

    tracker.close();
    tracker.wait().await;

    Ok(())
}
