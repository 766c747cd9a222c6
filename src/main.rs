use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;
use whatsmeow_bot::bot::Bot;
use whatsmeow_bot::logging;
use whatsmeow_bot::protocol::{render_qr_ascii, Client, QREvent};
use whatsmeow_bot::store::{Device, DeviceStore, SqlStore};
use whatsmeow_bot::BotConfig;

/// WhatsApp reply bot: answers `ping`, sends buttons and echoes images.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// JSON config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// SQLite database holding the paired device.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Directory for received images.
    #[arg(long)]
    media_dir: Option<PathBuf>,

    /// Name announced to contacts after login.
    #[arg(long)]
    push_name: Option<String>,

    /// Stop instead of reconnecting when the connection drops.
    #[arg(long)]
    no_reconnect: bool,

    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(if cli.verbose { "debug" } else { "info" });

    let mut config = match &cli.config {
        Some(path) => BotConfig::from_json_file(path)?,
        None => BotConfig::default(),
    };
    if let Some(path) = cli.database {
        config = config.with_database_path(path);
    }
    if let Some(dir) = cli.media_dir {
        config = config.with_media_dir(dir);
    }
    if let Some(name) = cli.push_name {
        config = config.with_push_name(name);
    }
    if cli.no_reconnect {
        config = config.with_auto_reconnect(false);
    }

    let store = Arc::new(SqlStore::open(&config.database_path)?);
    let device = match store.get_first_device()? {
        Some(device) => device,
        None => {
            info!("No stored session, starting a new login");
            Device::generate()
        }
    };

    let client = Arc::new(Client::new(config.client_config(), device, store));
    let bot = Arc::new(Bot::new(client.clone(), config));
    client.add_event_handler(bot.event_handler());

    if client.is_logged_in() {
        client.connect().await?;
    } else {
        let mut qr = client.get_qr_channel()?;
        client.connect().await?;
        while let Some(event) = qr.recv().await {
            match event {
                QREvent::Code { code, .. } => println!("{}", render_qr_ascii(&code)?),
                other => println!("Login event: {other:?}"),
            }
        }
        if !client.is_logged_in() {
            client.disconnect().await;
            return Err("pairing did not complete".into());
        }
    }

    wait_for_shutdown().await?;
    info!("Shutting down");
    client.disconnect().await;
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn wait_for_shutdown() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
