//! Chatseal admin binary.
//!
//! Operates on a redb conversation store without running a server.
//!
//! # Usage
//!
//! ```bash
//! # Generate a salt for a new user
//! chatseal-server new-salt
//!
//! # List a user's conversations
//! chatseal-server --db chatseal.redb list --user alice
//!
//! # Verify a conversation (server secret from the environment)
//! CHATSEAL_SERVER_SECRET=... chatseal-server verify --user alice --salt 00ff.. --conversation c1
//! ```

use std::path::PathBuf;

use chatseal_server::{
    AuthMethod, ConversationService, Notifier, RedbStorage, RequestContext, ServerSecret,
    ServiceConfig, Storage, SystemEnv, generate_user_salt, spawn_usage_logger,
};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Chatseal conversation store administration
#[derive(Parser, Debug)]
#[command(name = "chatseal-server")]
#[command(about = "Chatseal encrypted conversation store")]
#[command(version)]
struct Args {
    /// Path to the redb database
    #[arg(long, env = "CHATSEAL_DB", default_value = "chatseal.redb")]
    db: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// zstd level for newly packed messages (1-22)
    #[arg(long, env = "CHATSEAL_COMPRESSION_LEVEL", default_value_t = 3)]
    compression_level: i32,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a random user salt (hex)
    NewSalt,

    /// List a user's live conversations
    List {
        /// Owner user id
        #[arg(long)]
        user: String,
    },

    /// Verify a conversation's integrity chain
    Verify {
        #[command(flatten)]
        caller: Caller,

        /// Conversation id
        #[arg(long)]
        conversation: String,
    },

    /// Discard a conversation
    Discard {
        #[command(flatten)]
        caller: Caller,

        /// Conversation id
        #[arg(long)]
        conversation: String,
    },
}

/// Identity to act as.
#[derive(clap::Args, Debug)]
struct Caller {
    /// User id
    #[arg(long)]
    user: String,

    /// User salt (hex)
    #[arg(long)]
    salt: String,

    /// Server secret (hex)
    #[arg(long, env = "CHATSEAL_SERVER_SECRET", hide_env_values = true)]
    server_secret: String,
}

impl Caller {
    fn resolve(&self) -> Result<RequestContext, Box<dyn std::error::Error>> {
        let secret = ServerSecret::from_hex(&self.server_secret)?;
        let salt = hex::decode(self.salt.trim())?;
        Ok(RequestContext::resolve(&secret, &self.user, &salt, AuthMethod::ApiKey)?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    if let Command::NewSalt = args.command {
        let salt = generate_user_salt(&SystemEnv::new());
        tracing::info!(salt = %hex::encode(salt), "Generated user salt");
        return Ok(());
    }

    let config =
        ServiceConfig { compression_level: args.compression_level, ..ServiceConfig::default() };
    config.validate()?;

    tracing::info!(db = %args.db.display(), "Opening conversation store");
    let storage = RedbStorage::open(&args.db)?;

    let (usage_tx, usage_rx) = mpsc::channel(256);
    let usage_logger = spawn_usage_logger(usage_rx);

    let service = ConversationService::new(
        storage,
        SystemEnv::new(),
        config,
        Notifier::disabled().with_usage(usage_tx),
    )?;

    let outcome = run(&service, args.command);

    // Dropping the service closes the usage channel and lets the logger finish
    drop(service);
    usage_logger.await?;

    outcome
}

fn run(
    service: &ConversationService<RedbStorage, SystemEnv>,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::NewSalt => Ok(()),

        Command::List { user } => {
            let mut ids = service.storage().list_conversations(&user)?;
            ids.sort_unstable();
            tracing::info!(user = %user, count = ids.len(), "Conversations");
            for id in ids {
                tracing::info!(conversation_id = %id, "Conversation");
            }
            Ok(())
        },

        Command::Verify { caller, conversation } => {
            let ctx = caller.resolve()?;
            let report = service.verify(&ctx, &conversation)?;

            if report.valid {
                tracing::info!(
                    conversation_id = %conversation,
                    last_valid_sequence = ?report.last_valid_sequence,
                    root = %report.computed_root,
                    "Integrity verified"
                );
                return Ok(());
            }

            for issue in &report.errors {
                tracing::error!(conversation_id = %conversation, "{issue}");
            }
            Err(format!(
                "conversation {conversation} failed verification ({} issues)",
                report.errors.len()
            )
            .into())
        },

        Command::Discard { caller, conversation } => {
            let ctx = caller.resolve()?;
            service.discard_conversation(&ctx, &conversation)?;
            Ok(())
        },
    }
}
