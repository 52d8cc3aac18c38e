use clap::{Parser, Subcommand};
use std::error::Error;

use skiff::client::ClientOpts;
use skiff::{DEFAULT_APP_ID, DEFAULT_RELAY_PASSWORD, DEFAULT_RELAY_PORT};

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Peer-to-peer file transfer through a rendezvous relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous relay server
    Relay {
        /// Port to bind to
        #[arg(short, long, default_value_t = DEFAULT_RELAY_PORT)]
        port: u16,

        /// Relay password shared with clients
        #[arg(long, default_value = DEFAULT_RELAY_PASSWORD)]
        password: String,

        /// Application identity for the PAKE exchange
        #[arg(long, default_value = DEFAULT_APP_ID)]
        app_id: String,
    },
    /// Send a file to a peer holding the same transfer code
    Send {
        /// Path to the file to send
        file_path: String,

        /// Relay address to rendezvous at
        #[arg(long, default_value_t = format!("127.0.0.1:{}", DEFAULT_RELAY_PORT))]
        relay: String,

        /// Relay password
        #[arg(long, default_value = DEFAULT_RELAY_PASSWORD)]
        password: String,

        /// Application identity for the PAKE exchange
        #[arg(long, default_value = DEFAULT_APP_ID)]
        app_id: String,

        /// Six-digit transfer code (generated if not provided)
        #[arg(long)]
        code: Option<u32>,
    },
    /// Receive a file from a peer holding the same transfer code
    Receive {
        /// Six-digit transfer code (will prompt if not provided)
        code: Option<u32>,

        /// Relay address to rendezvous at
        #[arg(long, default_value_t = format!("127.0.0.1:{}", DEFAULT_RELAY_PORT))]
        relay: String,

        /// Relay password
        #[arg(long, default_value = DEFAULT_RELAY_PASSWORD)]
        password: String,

        /// Application identity for the PAKE exchange
        #[arg(long, default_value = DEFAULT_APP_ID)]
        app_id: String,
    },
    /// Find cooperating peers on the local network, or announce this one
    Discover {
        /// Announce instead of search
        #[arg(long)]
        announce: bool,

        /// Payload to broadcast
        #[arg(long, default_value = "skiff")]
        payload: String,

        /// How many seconds to spend
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Relay {
            port,
            password,
            app_id,
        } => {
            skiff::commands::relay::run(port, password, app_id).await?;
        }
        Commands::Send {
            file_path,
            relay,
            password,
            app_id,
            code,
        } => {
            let opts = ClientOpts {
                relay_address: relay,
                relay_password: password,
                app_id,
            };
            skiff::commands::send::run(&file_path, opts, code).await?;
        }
        Commands::Receive {
            code,
            relay,
            password,
            app_id,
        } => {
            let opts = ClientOpts {
                relay_address: relay,
                relay_password: password,
                app_id,
            };
            skiff::commands::receive::run(opts, code).await?;
        }
        Commands::Discover {
            announce,
            payload,
            seconds,
        } => {
            skiff::commands::discover::run(announce, payload, seconds).await?;
        }
    }

    Ok(())
}
