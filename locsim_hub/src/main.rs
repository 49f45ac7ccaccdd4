use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use locsim_common::{
    config,
    disk_image::{DiskImageStore, SupportFile},
};
use locsim_core::emulator::{spawn_watcher, EmulatorHandle, EmulatorLocator};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about = "Spoof the location of running device emulators")]
struct Cli {
    /// Settings file to use instead of the one in the config directory
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Log emulators as they come and go (default)
    Watch,
    /// List emulators with a usable location bridge
    List,
    /// Set the location of one or all emulators
    Set {
        #[arg(long, allow_hyphen_values = true)]
        latitude: f64,
        #[arg(long, allow_hyphen_values = true)]
        longitude: f64,
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Restore the real location of one or all emulators
    Reset {
        #[arg(long)]
        pid: Option<u32>,
    },
    /// Manage stored developer disk images
    #[command(subcommand)]
    Images(ImagesCommand),
}

#[derive(Subcommand)]
enum ImagesCommand {
    List {
        #[arg(long, default_value = "iPhone OS")]
        os: String,
    },
    Add {
        #[arg(long, default_value = "iPhone OS")]
        os: String,
        #[arg(long)]
        version: String,
        #[arg(long)]
        image: PathBuf,
        #[arg(long)]
        signature: PathBuf,
    },
    Remove {
        #[arg(long, default_value = "iPhone OS")]
        os: String,
        #[arg(long)]
        version: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_env_var("RUST_LOG")
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => config::settings_from_path(path),
        None => config::settings(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to load settings: {e}"))?;
    let settings = Arc::new(settings);

    let locator = Arc::new(EmulatorLocator::from_settings(
        &settings.emulator,
        Handle::current(),
    ));

    match cli.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(locator, &settings).await,
        Command::List => {
            for emulator in discover(&locator).await? {
                println!(
                    "{}\t{}\t{}\treset:{}",
                    emulator.pid(),
                    emulator.identity().name.as_deref().unwrap_or("-"),
                    emulator.identity().udid.as_deref().unwrap_or("-"),
                    emulator.supports_reset()
                );
            }
            Ok(())
        }
        Command::Set {
            latitude,
            longitude,
            pid,
        } => {
            for_each_emulator(&locator, pid, move |e| e.set_location(latitude, longitude)).await
        }
        Command::Reset { pid } => for_each_emulator(&locator, pid, |e| e.reset_location()).await,
        Command::Images(command) => {
            let root = config::support_directory(&settings)
                .map_err(|e| anyhow::anyhow!("Failed to resolve support directory: {e}"))?;
            images(DiskImageStore::new(root), command)
        }
    }
}

async fn discover(locator: &Arc<EmulatorLocator>) -> anyhow::Result<Vec<EmulatorHandle>> {
    let locator = locator.clone();
    tokio::task::spawn_blocking(move || locator.discover())
        .await
        .context("Emulator discovery failed")
}

async fn for_each_emulator(
    locator: &Arc<EmulatorLocator>,
    pid: Option<u32>,
    op: impl Fn(&EmulatorHandle) -> bool + Send + 'static,
) -> anyhow::Result<()> {
    let emulators: Vec<_> = discover(locator)
        .await?
        .into_iter()
        .filter(|e| pid.map_or(true, |pid| e.pid() == pid))
        .collect();
    if emulators.is_empty() {
        anyhow::bail!("No matching emulator found");
    }

    let rejected = tokio::task::spawn_blocking(move || {
        emulators
            .iter()
            .filter(|e| {
                let ok = op(*e);
                if ok {
                    tracing::info!("Updated {}", e);
                } else {
                    tracing::error!("{} rejected the request", e);
                }
                !ok
            })
            .count()
    })
    .await?;
    if rejected > 0 {
        anyhow::bail!("{rejected} emulator(s) rejected the request");
    }
    Ok(())
}

async fn watch(locator: Arc<EmulatorLocator>, settings: &config::Settings) -> anyhow::Result<()> {
    let cancel_token = CancellationToken::new();
    tokio::spawn({
        let cancel_token = cancel_token.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
            cancel_token.cancel();
        }
    });

    let id = locator.subscribe(|emulators| {
        if emulators.is_empty() {
            tracing::info!("No emulators with a location bridge running");
        }
        for emulator in emulators {
            tracing::info!("Emulator available: {} ({})", emulator, emulator.endpoint());
        }
    });
    let watcher = spawn_watcher(
        locator.clone(),
        settings.emulator.poll_interval(),
        cancel_token,
    );
    let result = watcher.await;
    locator.unsubscribe(id);
    result.context("Emulator watcher failed")
}

fn images(store: DiskImageStore, command: ImagesCommand) -> anyhow::Result<()> {
    match command {
        ImagesCommand::List { os } => {
            for version in store
                .available_versions(&os)
                .with_context(|| format!("Failed to list {}", store.root().display()))?
            {
                println!("{version}");
            }
        }
        ImagesCommand::Add {
            os,
            version,
            image,
            signature,
        } => {
            store
                .store(&os, &version, SupportFile::Image, &image)
                .and_then(|_| store.store(&os, &version, SupportFile::Signature, &signature))
                .with_context(|| format!("Failed to add {os} {version}"))?;
        }
        ImagesCommand::Remove { os, version } => store
            .remove(&os, &version)
            .with_context(|| format!("Failed to remove {os} {version}"))?,
    }
    Ok(())
}
