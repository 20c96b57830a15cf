//! Media Catalog operator tool
//!
//! ## Usage
//!
//! ```bash
//! # Create the storage directory, config file and database
//! media-catalog init
//!
//! # Resolve raw items exported by a source adapter
//! media-catalog resolve items.json
//!
//! # Build a list as user 7
//! media-catalog --as 7 create-list "Friday night" --kind playlist
//! media-catalog --as 7 add 12 340
//! media-catalog --as 7 share 12 9 read
//!
//! # Refresh stale smart lists (for cron or a systemd timer)
//! media-catalog refresh-due
//! ```
//!
//! All output is JSON on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use media_catalog::db::accounts;
use media_catalog::services::{spawn_logging_listener, RawItem};
use media_catalog::{
    CatalogDb, Config, ContentType, CreateListInput, ItemId, Role, Services, SmartCriteria,
    UserId, Visibility, SYSTEM_ACTOR,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "media-catalog")]
#[command(about = "Canonical media catalog with shared and smart lists")]
struct Args {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, global = true, env = "MEDIA_CATALOG_DIR")]
    storage_dir: Option<PathBuf>,

    /// User to act as (0 is the system actor)
    #[arg(long = "as", global = true, env = "MEDIA_CATALOG_USER", default_value_t = SYSTEM_ACTOR)]
    actor: UserId,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create storage directory, config and database
    Init,

    /// Show database statistics
    Stats,

    /// Resolve raw items from a JSON file (one object or an array)
    Resolve { file: PathBuf },

    /// Create a list owned by the acting user
    CreateList {
        title: String,
        #[arg(long)]
        description: Option<String>,
        /// collection or playlist
        #[arg(long, default_value = "collection")]
        kind: ContentType,
        /// private, shared or public
        #[arg(long, default_value = "private")]
        visibility: Visibility,
        /// Smart list criteria as JSON
        #[arg(long)]
        criteria: Option<String>,
    },

    /// Show a list
    Show { list_id: ItemId },

    /// Lists owned by a user
    Lists {
        owner: UserId,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },

    /// Lists other users have shared with the acting user
    Shared,

    /// Append an item to a list
    Add { list_id: ItemId, item_id: ItemId },

    /// Remove an item from a list
    Remove {
        list_id: ItemId,
        item_id: ItemId,
        /// Only remove if the item sits at this position
        #[arg(long)]
        position: Option<u32>,
    },

    /// Reorder a list; every current member must be given exactly once
    Reorder {
        list_id: ItemId,
        #[arg(required = true)]
        item_ids: Vec<ItemId>,
    },

    /// Grant a user read or write access
    Share {
        list_id: ItemId,
        user_id: UserId,
        level: String,
    },

    /// Revoke a user's access
    Unshare { list_id: ItemId, user_id: UserId },

    /// Set or clear smart list criteria
    Criteria {
        list_id: ItemId,
        /// Criteria as JSON
        #[arg(long, conflicts_with = "clear")]
        json: Option<String>,
        /// Turn the list back into a manual list
        #[arg(long)]
        clear: bool,
    },

    /// Refresh a smart list now (Ctrl-C cancels)
    Refresh { list_id: ItemId },

    /// Refresh every smart list older than the configured max age
    RefreshDue {
        #[arg(long)]
        max_age_secs: Option<u64>,
    },

    /// Show the change history of a list
    History {
        list_id: ItemId,
        #[arg(long)]
        item: Option<ItemId>,
    },

    /// Set an account role (user or admin)
    SetRole { user_id: UserId, role: Role },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_raw_items(file: &Path) -> anyhow::Result<Vec<RawItem>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    let items = if value.is_array() {
        serde_json::from_value(value)?
    } else {
        vec![serde_json::from_value(value)?]
    };
    Ok(items)
}

fn parse_criteria(json: &str) -> anyhow::Result<SmartCriteria> {
    serde_json::from_str(json).context("invalid criteria JSON")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("media_catalog=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    std::fs::create_dir_all(&config.storage_dir)?;

    let db = Arc::new(CatalogDb::open(&config.database_path())?);
    let services = Services::new(db.clone(), &config);
    spawn_logging_listener(services.events.clone());

    let actor = args.actor;

    match args.command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            print_json(&serde_json::json!({
                "storage_dir": config.storage_dir,
                "database": config.database_path(),
                "config": config_path,
            }))?;
        }
        Command::Stats => print_json(&db.stats()?)?,
        Command::Resolve { file } => {
            let raws = load_raw_items(&file)?;
            print_json(&services.identity.resolve_batch(&raws))?;
        }
        Command::CreateList {
            title,
            description,
            kind,
            visibility,
            criteria,
        } => {
            let input = CreateListInput {
                title,
                description,
                kind,
                visibility,
                criteria: criteria.as_deref().map(parse_criteria).transpose()?,
            };
            print_json(&services.lists.create_with(actor, input)?)?;
        }
        Command::Show { list_id } => print_json(&services.lists.get(list_id, actor)?)?,
        Command::Lists {
            owner,
            limit,
            offset,
        } => print_json(&services.lists.find_by_owner(actor, owner, limit, offset)?)?,
        Command::Shared => print_json(&services.lists.shared_with(actor)?)?,
        Command::Add { list_id, item_id } => {
            print_json(&services.lists.add_item(list_id, item_id, actor)?)?
        }
        Command::Remove {
            list_id,
            item_id,
            position,
        } => {
            let list = match position {
                Some(position) => {
                    services
                        .lists
                        .remove_item_at_position(list_id, item_id, position, actor)?
                }
                None => services.lists.remove_item(list_id, item_id, actor)?,
            };
            print_json(&list)?;
        }
        Command::Reorder { list_id, item_ids } => {
            print_json(&services.lists.reorder(list_id, &item_ids, actor)?)?
        }
        Command::Share {
            list_id,
            user_id,
            level,
        } => print_json(&services.permissions.share_with(actor, list_id, user_id, &level)?)?,
        Command::Unshare { list_id, user_id } => {
            let removed = services
                .permissions
                .remove_collaborator(actor, list_id, user_id)?;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Command::Criteria {
            list_id,
            json,
            clear,
        } => {
            let criteria = match (json, clear) {
                (Some(json), false) => Some(parse_criteria(&json)?),
                (None, true) => None,
                _ => anyhow::bail!("pass either --json or --clear"),
            };
            print_json(&services.smart_lists.set_criteria(list_id, actor, criteria)?)?;
        }
        Command::Refresh { list_id } => {
            let (cancel_tx, cancel_rx) = broadcast::channel(1);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = cancel_tx.send(());
                }
            });
            let list = services
                .smart_lists
                .refresh_with_cancel(list_id, actor, cancel_rx)
                .await?;
            print_json(&list)?;
        }
        Command::RefreshDue { max_age_secs } => {
            let max_age =
                Duration::from_secs(max_age_secs.unwrap_or(config.smart_refresh_max_age_secs));
            print_json(&services.smart_lists.refresh_due(max_age).await?)?;
        }
        Command::History { list_id, item } => {
            let history = match item {
                Some(item_id) => services.lists.entry_history(list_id, item_id, actor)?,
                None => services.lists.history(list_id, actor)?,
            };
            print_json(&history)?;
        }
        Command::SetRole { user_id, role } => {
            if actor != SYSTEM_ACTOR && !services.permissions.is_admin(actor)? {
                anyhow::bail!("only the system actor or an administrator may set roles");
            }
            db.with_conn(|conn| accounts::set_role(conn, user_id, role))?;
            print_json(&serde_json::json!({ "user_id": user_id, "role": role }))?;
        }
    }

    Ok(())
}
