use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use kingraph::db::{migrate, Db};
use kingraph::discovery::DiscoveryLimits;
use kingraph::layout::LayoutSnapshot;
use kingraph::requests::Decision;
use kingraph::{Config, FamilyGraph, ProfileRef, RelationshipKind, Role};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "kingraph")]
#[command(about = "Family relationship graph: profiles, connection requests and graph views")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending migrations and verify the schema
    Migrate,
    /// Register an account and its profile
    Register {
        email: String,
        #[arg(long)]
        name: String,
    },
    /// Record a family member directly (no confirmation from the other side)
    Add {
        /// Profile doing the adding
        #[arg(long)]
        caller: String,
        #[command(flatten)]
        target: Target,
        /// Relationship kind, e.g. PARENT or aunt-uncle
        #[arg(long)]
        kind: RelationshipKind,
        #[arg(long)]
        role: Option<Role>,
    },
    /// Propose a relationship to another registered member
    Propose {
        #[arg(long)]
        sender: String,
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        kind: RelationshipKind,
        #[arg(long)]
        message: Option<String>,
    },
    /// Approve or decline a pending request
    Decide {
        request_id: String,
        #[arg(long)]
        receiver: String,
        /// APPROVE or DECLINE
        #[arg(long)]
        decision: Decision,
    },
    /// List requests a profile has sent and received
    Requests { profile: String },
    /// Print the positioned family graph around a profile
    Graph {
        profile: String,
        /// Override the configured hop ceiling
        #[arg(long)]
        max_hops: Option<usize>,
    },
    /// Store a layout snapshot (JSON file) for a profile
    SaveLayout { profile: String, file: PathBuf },
}

/// Who the operation is aimed at; exactly one of profile, email or name.
#[derive(Args, Debug)]
struct Target {
    /// Existing profile id
    #[arg(long)]
    profile: Option<String>,
    /// Email address (a placeholder is created when unknown)
    #[arg(long)]
    email: Option<String>,
    /// Display name only
    #[arg(long)]
    name: Option<String>,
    /// Display name to use with --email
    #[arg(long, requires = "email")]
    display_name: Option<String>,
}

impl Target {
    fn into_ref(self) -> Result<ProfileRef> {
        match (self.profile, self.email, self.name) {
            (Some(id), None, None) => Ok(ProfileRef::Existing(id)),
            (None, Some(email), None) => Ok(ProfileRef::Email { email, display_name: self.display_name }),
            (None, None, Some(name)) => Ok(ProfileRef::Name(name)),
            _ => anyhow::bail!("Give exactly one of --profile, --email or --name"),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load()?;

    // Logs go to stderr so stdout stays machine-readable
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or("RUST_LOG", config.kingraph.log_level.as_str()),
    )
    .init();

    let db = Db::new(config.db_path());
    let migrations_dir = config.migrations_dir().to_path_buf();
    let applied = db.with_connection(move |conn| migrate::run_migrations(conn, &migrations_dir)).await?;

    let graph = FamilyGraph::new(db, config);

    match cli.command {
        Command::Migrate => {
            // Pending migrations already ran above, including the schema check
            log::info!("Schema verified at {}", graph.db().path().display());
            print_json(&applied)?;
        }
        Command::Register { email, name } => {
            print_json(&graph.register_account(&email, &name).await?)?;
        }
        Command::Add { caller, target, kind, role } => {
            let edge = graph.add_family_member(&caller, target.into_ref()?, kind, role).await?;
            print_json(&edge)?;
        }
        Command::Propose { sender, target, kind, message } => {
            let request = graph.propose(&sender, target.into_ref()?, kind, message).await?;
            print_json(&request)?;
        }
        Command::Decide { request_id, receiver, decision } => {
            print_json(&graph.decide(&request_id, &receiver, decision).await?)?;
        }
        Command::Requests { profile } => {
            print_json(&graph.requests_for(&profile).await?)?;
        }
        Command::Graph { profile, max_hops } => {
            let mut limits: DiscoveryLimits = graph.config().discovery.into();
            if let Some(max_hops) = max_hops {
                limits.max_hops = max_hops;
            }
            let view = graph.family_view_within(&profile, limits).await?;
            print_json(&view)?;
        }
        Command::SaveLayout { profile, file } => {
            let snapshot: LayoutSnapshot = serde_json::from_str(&std::fs::read_to_string(&file)?)?;
            graph.save_layout(&profile, &snapshot).await?;
            log::info!("Saved layout for {} ({} nodes)", profile, snapshot.nodes.len());
        }
    }

    Ok(())
}
