//! dirfed - query users and groups across federated directories

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::Settings;
use dirfed_core::{
    DirectoryEntity, DirectoryGroup, DirectoryProvider, DirectoryUser, Identity, Sid,
    UserSearchType,
};
use dirfed_directory::ProviderRegistry;

#[derive(Debug, Parser)]
#[command(name = "dirfed", version, about = "Federated directory lookups")]
struct Cli {
    /// Extra configuration file, read after config/default and config/local
    #[arg(short, long, env = "DIRFED_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Search users across every provider
    Search {
        term: String,
        /// username, display_name or email
        #[arg(short = 't', long = "type", default_value_t = UserSearchType::Username)]
        search_type: UserSearchType,
    },
    /// Look up a user by sid
    User { sid: String },
    /// Look up a group by sid
    Group { sid: String },
    /// List the direct members of a group
    Members { provider: String, group: String },
    /// Check whether a user belongs to a group, directly or through nested groups
    Check {
        provider: String,
        group: String,
        username: String,
    },
    /// List registered providers
    Providers,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let registry = register_providers(&settings).await?;
    run(&registry, cli.command).await
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,dirfed=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .init();
}

async fn register_providers(settings: &Settings) -> Result<ProviderRegistry> {
    let registry = ProviderRegistry::new();

    for provider in settings.enabled_providers() {
        let id = registry
            .register_config(provider)
            .await
            .with_context(|| format!("Failed to initialize provider {:?}", provider.details))?;
        info!("Provider {} ready", id);
    }

    let skipped = settings.providers.iter().filter(|p| !p.enabled).count();
    if skipped > 0 {
        warn!("{} disabled providers skipped", skipped);
    }
    Ok(registry)
}

async fn run(registry: &ProviderRegistry, command: Command) -> Result<()> {
    match command {
        Command::Search { term, search_type } => {
            let service = registry.service().await?;
            let users = service
                .search_users(&term, search_type)
                .await
                .with_context(|| format!("Search for '{}' failed", term))?;

            if users.is_empty() {
                println!("No users found");
            }
            for user in &users {
                print_user(user);
            }
        }

        Command::User { sid } => {
            let service = registry.service().await?;
            let user = service
                .get_user_by_id(&Sid::from(sid.as_str()))
                .await
                .with_context(|| format!("Failed to get user {}", sid))?;
            print_user(&user);
        }

        Command::Group { sid } => {
            let service = registry.service().await?;
            let group = service
                .get_group_by_id(&Sid::from(sid.as_str()))
                .await
                .with_context(|| format!("Failed to get group {}", sid))?;
            print_group(&group);
        }

        Command::Members { provider, group } => {
            let group = find_group(registry, &provider, &group).await?;
            let members = group.get_members().await?;

            print_group(&group);
            if members.is_empty() {
                println!("  (no members)");
            }
            for member in &members {
                println!("  {}", member);
            }
        }

        Command::Check {
            provider,
            group,
            username,
        } => {
            let group = find_group(registry, &provider, &group).await?;
            let users = registry
                .service()
                .await?
                .search_users(&username, UserSearchType::Username)
                .await?;
            if users.is_empty() {
                bail!("User '{}' not found in any provider", username);
            }

            for user in users {
                let label = format!("{}@{}", user.username, user.provider_id);
                let entity = DirectoryEntity::from(user);
                let verdict = if group.is_member(&entity).await? {
                    "is a member of"
                } else {
                    "is not a member of"
                };
                println!("{} {} '{}'", label, verdict, group.group_name());
            }
        }

        Command::Providers => {
            for id in registry.provider_ids().await {
                println!("{}", id);
            }
        }
    }

    Ok(())
}

async fn find_group(
    registry: &ProviderRegistry,
    provider_id: &str,
    group_name: &str,
) -> Result<DirectoryGroup> {
    let provider = registry.get_provider(provider_id).await?;
    match provider.find_group(group_name).await? {
        Some(group) => Ok(group),
        None => bail!("Group '{}' not found in provider {}", group_name, provider_id),
    }
}

fn print_user(user: &DirectoryUser) {
    println!(
        "{}\t{}\t{}\t{}\t{}",
        user.sid,
        user.provider_id,
        user.username,
        user.display_name,
        user.email.as_deref().unwrap_or("-")
    );
}

fn print_group(group: &DirectoryGroup) {
    println!(
        "{}\t{}\t{}\t{}",
        group.sid(),
        group.provider_id(),
        group.group_name(),
        group.description()
    );
}
