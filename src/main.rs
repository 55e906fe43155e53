use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use profilemesh::{
    Contact, Identity, Node, NodeConfig, OwnerCommand, ProfileEvent, ProfileQueryRpc,
    ProfileUpdate, RpcResponse, admin_client, load_key_file,
};

#[derive(Parser, Debug)]
#[command(name = "profilemesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted.
    Run(RunArgs),
    /// Ask the node to send a connection request to CONTACT.
    Connect {
        #[command(flatten)]
        admin: AdminArgs,
        /// IDENTITY@HOST:PORT
        remote: Contact,
    },
    /// Accept a pending request from IDENTITY.
    Accept {
        #[command(flatten)]
        admin: AdminArgs,
        from: Identity,
    },
    /// Reject a pending request from IDENTITY.
    Reject {
        #[command(flatten)]
        admin: AdminArgs,
        from: Identity,
    },
    /// Send the acceptance confirmation to a connected IDENTITY again.
    Reconfirm {
        #[command(flatten)]
        admin: AdminArgs,
        peer: Identity,
    },
    /// Endorse SKILL on a connected node.
    Endorse {
        #[command(flatten)]
        admin: AdminArgs,
        target: Identity,
        skill: String,
        rating: u8,
        #[arg(short, long, default_value = "")]
        comment: String,
    },
    /// List incoming requests awaiting a decision.
    Pending {
        #[command(flatten)]
        admin: AdminArgs,
        /// List the node's own requests still awaiting an answer instead.
        #[arg(long)]
        outgoing: bool,
    },
    /// Print the node's endorsement summary.
    Summary {
        #[command(flatten)]
        admin: AdminArgs,
    },
    /// Print the node's profile.
    Profile {
        #[command(flatten)]
        admin: AdminArgs,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Holds node.key and state.bin. Without it the node is ephemeral.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Owner identity (hex). Defaults to the node's own identity.
    #[arg(short, long)]
    owner: Option<Identity>,

    /// Profile name to set on start.
    #[arg(long)]
    name: Option<String>,

    /// Skills to set on start (repeatable).
    #[arg(long = "skill", value_name = "SKILL")]
    skills: Vec<String>,

    /// Record endorsements even for skills not on the profile.
    #[arg(long)]
    allow_unlisted_skills: bool,

    #[arg(long, default_value = "30")]
    rpc_timeout: u64,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

#[derive(Args, Debug)]
struct AdminArgs {
    /// Node to administer, IDENTITY@HOST:PORT.
    #[arg(short, long)]
    node: Contact,

    /// Raw 32-byte owner secret key.
    #[arg(short, long)]
    key: PathBuf,

    #[arg(long, default_value = "30")]
    rpc_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Connect { admin, remote } => {
            owner_command(&admin, OwnerCommand::Connect { remote }).await?;
            println!("request delivered");
            Ok(())
        }
        Command::Accept { admin, from } => {
            match owner_command(&admin, OwnerCommand::Accept { from }).await? {
                RpcResponse::Accepted { confirmed: true } => println!("connected to {}", from),
                RpcResponse::Accepted { confirmed: false } => {
                    println!("connected to {} (requester not yet confirmed)", from)
                }
                other => bail!("unexpected response: {:?}", other),
            }
            Ok(())
        }
        Command::Reject { admin, from } => {
            owner_command(&admin, OwnerCommand::Reject { from }).await?;
            println!("rejected {}", from);
            Ok(())
        }
        Command::Reconfirm { admin, peer } => {
            owner_command(&admin, OwnerCommand::Reconfirm { peer }).await?;
            println!("confirmation delivered to {}", peer);
            Ok(())
        }
        Command::Endorse {
            admin,
            target,
            skill,
            rating,
            comment,
        } => {
            let command = OwnerCommand::Endorse {
                target,
                skill: skill.clone(),
                rating,
                comment,
            };
            owner_command(&admin, command).await?;
            println!("endorsed {} on {} ({}/10)", skill, target, rating);
            Ok(())
        }
        Command::Pending { admin, outgoing } => {
            let command = if outgoing {
                OwnerCommand::OutgoingRequests
            } else {
                OwnerCommand::PendingRequests
            };
            match owner_command(&admin, command).await? {
                RpcResponse::Identities(ids) => {
                    for id in ids {
                        println!("{}", id);
                    }
                }
                other => bail!("unexpected response: {:?}", other),
            }
            Ok(())
        }
        Command::Summary { admin } => {
            let client = admin_rpc(&admin)?;
            let summary = client.fetch_summary(&admin.node).await?;
            for row in summary.rows() {
                println!("{:<32} {:>3} endorsements, avg {:.2}", row.skill, row.count, row.average());
            }
            client.quit().await;
            Ok(())
        }
        Command::Profile { admin } => {
            let client = admin_rpc(&admin)?;
            let profile = client.fetch_profile(&admin.node).await?;
            println!("name:    {}", profile.name);
            println!("bio:     {}", profile.bio);
            println!("email:   {}", profile.email);
            println!("links:   {}", profile.links.join(", "));
            println!("skills:  {}", profile.skills.join(", "));
            println!("public:  {}", profile.is_public);
            client.quit().await;
            Ok(())
        }
    }
}

fn admin_rpc(admin: &AdminArgs) -> Result<profilemesh::RpcNode> {
    let keypair = load_key_file(&admin.key).context("failed to load owner key")?;
    admin_client(&keypair, Duration::from_secs(admin.rpc_timeout))
}

async fn owner_command(admin: &AdminArgs, command: OwnerCommand) -> Result<RpcResponse> {
    let client = admin_rpc(admin)?;
    let result = client.owner_command(&admin.node, command).await;
    client.quit().await;
    result
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = NodeConfig::default()
        .with_require_listed_skill(!args.allow_unlisted_skills)
        .with_rpc_timeout(Duration::from_secs(args.rpc_timeout));
    if let Some(dir) = args.data_dir {
        config = config.with_data_dir(dir);
    }
    if let Some(owner) = args.owner {
        config = config.with_owner(owner);
    }

    let node = Node::bind(&args.bind.to_string(), config).await?;
    info!("Node contact: {}@{}", node.identity(), node.local_addr()?);

    if args.name.is_some() || !args.skills.is_empty() {
        if node.owner() != node.identity() {
            warn!("profile seed ignored: node is owned by another key");
        } else {
            if let Some(name) = args.name {
                let current = node.profile().await?;
                let update = ProfileUpdate {
                    name,
                    bio: current.bio,
                    email: current.email,
                    links: current.links,
                };
                node.update_profile(update).await?;
            }
            if !args.skills.is_empty() {
                node.update_skills(args.skills).await?;
            }
        }
    }

    let mut events = node.events().await?;
    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(event) = events.recv() => {
                log_event(&event);
            }
            _ = interval.tick() => {
                let connections = node.connection_count().await?;
                let pending = node.pending_requests().await?.len();
                let outgoing = node.pending_outgoing().await?.len();
                let skills = node.skill_count().await?;
                let endorsements = node.endorsement_count().await?;
                let summary = node.endorsement_summary().await?;
                info!(
                    connections,
                    pending,
                    outgoing,
                    skills,
                    endorsements,
                    endorsed_skills = summary.total_skills,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

fn log_event(event: &ProfileEvent) {
    match event {
        ProfileEvent::ProfileUpdated { owner } => {
            info!(owner = %short(owner), "profile updated");
        }
        ProfileEvent::ConnectionRequested { from, to } => {
            info!(from = %short(from), to = %short(to), "connection requested");
        }
        ProfileEvent::ConnectionAccepted { requester, accepter } => {
            info!(requester = %short(requester), accepter = %short(accepter), "connection accepted");
        }
        ProfileEvent::SkillEndorsed {
            endorser,
            endorsed,
            skill,
            rating,
        } => {
            info!(
                endorser = %short(endorser),
                endorsed = %short(endorsed),
                skill = %skill,
                rating,
                "skill endorsed"
            );
        }
    }
}

fn short(id: &Identity) -> String {
    hex::encode(&id.as_bytes()[..8])
}
