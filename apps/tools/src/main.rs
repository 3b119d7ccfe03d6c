use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client_core::{load_settings, load_settings_from, OfflineClient};
use outbox::ConflictStrategy;
use shared::domain::{ChannelId, ClientOperationId, MessageId};
use tracing_subscriber::EnvFilter;

/// Inspect and drive the local message outbox.
#[derive(Parser, Debug)]
#[command(name = "outboxctl")]
struct Cli {
    /// Settings file; defaults to ./client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    conflict_strategy: Option<ConflictStrategy>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List queued operations, oldest first.
    Pending,
    /// Mark operations left unconfirmed by an earlier run as failed.
    Reconcile,
    Send {
        channel_id: String,
        text: String,
    },
    Edit {
        channel_id: String,
        message_id: String,
        text: String,
    },
    Delete {
        channel_id: String,
        message_id: String,
    },
    Retry {
        client_operation_id: String,
    },
    Cancel {
        client_operation_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    if let Some(v) = cli.database_url {
        settings.database_url = v;
    }
    if let Some(v) = cli.server_url {
        settings.server_url = v;
    }
    if let Some(v) = cli.conflict_strategy {
        settings.conflict_strategy = v;
    }

    let client = OfflineClient::initialize(&settings).await?;
    let coordinator = client.coordinator();

    match cli.command {
        Command::Pending => {
            for operation in coordinator.pending().await? {
                println!("{}", serde_json::to_string(&operation)?);
            }
        }
        Command::Reconcile => {
            let report = client.startup_report();
            println!(
                "scanned={} marked_failed={}",
                report.scanned,
                report.marked_failed.len()
            );
            for id in &report.marked_failed {
                println!("failed {id}");
            }
        }
        Command::Send { channel_id, text } => {
            let message = coordinator
                .send(ChannelId::new(channel_id), text, Vec::new())
                .await?;
            client.shutdown().await;
            report_outcome(&client, &message.client_message_id).await?;
        }
        Command::Edit {
            channel_id,
            message_id,
            text,
        } => {
            let message = coordinator
                .edit_message(ChannelId::new(channel_id), MessageId::new(message_id), text)
                .await?;
            client.shutdown().await;
            report_outcome(&client, &message.client_message_id).await?;
        }
        Command::Delete {
            channel_id,
            message_id,
        } => {
            coordinator
                .delete_message(ChannelId::new(channel_id), MessageId::new(message_id.clone()))
                .await?;
            println!("deleted {message_id}");
        }
        Command::Retry {
            client_operation_id,
        } => {
            let id = ClientOperationId::new(client_operation_id);
            coordinator.retry(&id).await?;
            client.shutdown().await;
            match coordinator.pending().await?.iter().find(|op| op.client_operation_id == id) {
                Some(operation) => bail!(
                    "retry {} of {id} failed: {}",
                    operation.retry_count,
                    operation.last_error.as_deref().unwrap_or("unknown error")
                ),
                None => println!("delivered {id}"),
            }
        }
        Command::Cancel {
            client_operation_id,
        } => {
            let id = ClientOperationId::new(client_operation_id);
            coordinator.cancel(&id).await?;
            println!("cancelled {id}");
        }
    }

    Ok(())
}

async fn report_outcome(client: &OfflineClient, id: &ClientOperationId) -> Result<()> {
    match client.coordinator().local_message(id).await? {
        Some(message) => println!("{}", serde_json::to_string(&message)?),
        None => println!("{id} no longer exists locally"),
    }
    Ok(())
}
