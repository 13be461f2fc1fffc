use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::load_settings;
use shared::domain::{ConversationId, MessageId, UserId};
use storage::Storage;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Local user whose database is opened.
    #[arg(long)]
    user: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the database file used for the user.
    DbPath,
    ListProcessed {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    ShowPlaintext {
        message_id: String,
    },
    ListConversation {
        conversation_id: String,
    },
    ClearReceipts {
        conversation_id: String,
    },
    /// Prints the revision and size of the saved MLS state.
    StateInfo,
    /// Lists epochs with a retained secret; the group id is hex.
    ListEpochs {
        group_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref());
    if let Some(data_dir) = cli.data_dir {
        settings.data_dir = data_dir;
    }
    let user = UserId::from(cli.user);
    if user.normalized().is_empty() {
        bail!("--user must not be blank");
    }

    if let Command::DbPath = cli.command {
        println!("{}", Storage::database_path(&settings.data_dir, &user).display());
        return Ok(());
    }

    let storage = Storage::open_for_user(&settings.data_dir, &user, settings.storage_options()).await?;
    match cli.command {
        Command::DbPath => {}
        Command::ListProcessed { limit } => {
            for record in storage.list_processed(&user, limit).await? {
                println!(
                    "{}\tconvo={}\tepoch={}\t{}",
                    record.message_id,
                    record.conversation_id,
                    record.epoch,
                    record.processed_at.to_rfc3339()
                );
            }
        }
        Command::ShowPlaintext { message_id } => {
            match storage
                .cached_plaintext(&MessageId::from(message_id.as_str()), &user)
                .await?
            {
                Some(plaintext) => println!("{}", serde_json::to_string_pretty(&plaintext)?),
                None => println!("no cached plaintext for message_id={message_id}"),
            }
        }
        Command::ListConversation { conversation_id } => {
            let convo = ConversationId::from(conversation_id);
            for plaintext in storage.cached_conversation(&user, &convo).await? {
                println!("{}", serde_json::to_string(&plaintext)?);
            }
        }
        Command::ClearReceipts { conversation_id } => {
            let removed = storage
                .clear_read_receipts(&ConversationId::from(conversation_id.as_str()))
                .await?;
            println!("removed {removed} read receipts from conversation_id={conversation_id}");
        }
        Command::StateInfo => match storage.mls_state(&user).await? {
            Some(stored) => println!(
                "revision={}\tbytes={}",
                stored.revision,
                stored.state.len()
            ),
            None => println!("no mls state saved for user={user}"),
        },
        Command::ListEpochs { group_id } => {
            let group = hex::decode(&group_id)
                .with_context(|| format!("group id {group_id} is not hex"))?;
            for epoch in storage.retained_epochs(&user, &group).await? {
                println!("{epoch}");
            }
        }
    }

    Ok(())
}
