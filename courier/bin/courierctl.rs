//! Command-line client for courier
//!
//! Publishes messages onto the configured broker for the daemon to deliver,
//! and checks that the configured SMTP relay accepts our credentials.

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use courier::{
    config::{Courier, find_config_file},
    request::SendRequest,
};
use courier_dispatch::{Publisher, SystemClock};
use courier_smtp::{MailTransport, SmtpMailTransport};

/// Command-line client for courier
#[derive(Parser, Debug)]
#[command(name = "courierctl")]
#[command(about = "Queue mail for courier and check its relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue a message for delivery
    Send {
        /// Recipient address
        #[arg(long)]
        to: String,

        #[arg(long)]
        subject: String,

        #[arg(long)]
        body: String,

        /// Do not deliver before this time (RFC 3339)
        #[arg(long)]
        at: Option<String>,
    },
    /// Connect to the SMTP relay, authenticate and disconnect
    Probe,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Courier::load(&find_config_file(cli.config)?)?;

    match cli.command {
        Commands::Send {
            to,
            subject,
            body,
            at,
        } => {
            let request = SendRequest::parse(&to, &subject, &body, at.as_deref())?;

            let broker = config.broker.into_broker()?;
            broker.bind(&config.dispatch.topology).await?;
            let publisher = Publisher::new(broker, Arc::new(config.dispatch), Arc::new(SystemClock));

            let scheduled = request.scheduled_at;
            let id = request.submit(&publisher).await?;
            match scheduled {
                Some(at) => println!("Queued {id} for delivery at {at}"),
                None => println!("Queued {id}"),
            }
        }
        Commands::Probe => {
            let transport = SmtpMailTransport::new(config.smtp);
            transport.probe().await?;
            println!("{} accepted the connection", transport.config().address());
        }
    }

    Ok(())
}
