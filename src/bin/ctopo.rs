/// ctopo - cluster topology command line tool
///
/// Runs a cluster node, and inspects or changes the topology of a running
/// cluster through a node's admin API.
///
/// Usage:
///   ctopo start <member-id> [--peer <id>=<addr>] [--members 0,1,2]  - Start a node
///   ctopo topology                                 - Show the cluster configuration
///   ctopo partitions                               - Show replicas per partition
///   ctopo status                                   - Show node status
///   ctopo apply <file-or-json>                     - Apply an operation list
///   ctopo add-member <id>...                       - Add members and rebalance
///   ctopo remove-member <id>                       - Remove a member
///   ctopo scale <count>                            - Increase the partition count
///   ctopo reassign <id>...                         - Redistribute partitions over members
///   ctopo join-partition <partition> <member>      - Add a replica
///   ctopo leave-partition <partition> <member>     - Remove a replica
///   ctopo set-priority <partition> <member> <n>    - Change a replica's priority
///   ctopo exporter enable|disable <name>           - Toggle an exporter everywhere
///   ctopo cancel | retry                           - Resolve a failed change
///   ctopo show --member <id>                       - Read the persisted configuration
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use clustertopo::http::{ChangeResponse, ErrorResponse, HttpServer, PartitionsResponse};
use clustertopo::network::DEFAULT_PORT;
use clustertopo::{
    ChangeExecutors, ChangeStatus, ClusterChangeOperation, ClusterConfiguration, ClusterNode,
    MemberId, NodeConfig, NodeStatus, PartitionMetadata, PeerStatus, StaticConfiguration,
    config::CONFIGURATION_FILE, persistence,
};
use colored::*;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADMIN_URL: &str = "http://127.0.0.1:9600";

// ============================================================================
// HTTP Client for Remote Operations
// ============================================================================

/// HTTP client for a node's admin API.
struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path)
    }

    async fn topology(&self) -> Result<ClusterConfiguration> {
        let response = self.client.get(self.url("topology")).send().await?;
        decode(response).await
    }

    async fn partitions(&self) -> Result<Vec<PartitionMetadata>> {
        let response = self.client.get(self.url("partitions")).send().await?;
        let data: PartitionsResponse = decode(response).await?;
        Ok(data.partitions)
    }

    async fn status(&self) -> Result<NodeStatus> {
        let response = self.client.get(self.url("status")).send().await?;
        decode(response).await
    }

    async fn apply(
        &self,
        operations: Vec<ClusterChangeOperation>,
        dry_run: bool,
        wait: bool,
    ) -> Result<ChangeResponse> {
        let body = serde_json::json!({
            "operations": operations,
            "dry_run": dry_run,
            "wait": wait,
        });
        let response = self.client.post(self.url("operations")).json(&body).send().await?;
        decode(response).await
    }

    async fn add_members(&self, members: Vec<String>, dry_run: bool, wait: bool) -> Result<ChangeResponse> {
        let body = serde_json::json!({
            "members": members,
            "dry_run": dry_run,
            "wait": wait,
        });
        let response = self.client.post(self.url("members")).json(&body).send().await?;
        decode(response).await
    }

    async fn remove_member(&self, member: &str, dry_run: bool, wait: bool) -> Result<ChangeResponse> {
        let response = self
            .client
            .delete(self.url(&format!("members/{}", member)))
            .query(&[("dry_run", dry_run), ("wait", wait)])
            .send()
            .await?;
        decode(response).await
    }

    async fn scale(&self, partition_count: u32, dry_run: bool, wait: bool) -> Result<ChangeResponse> {
        let body = serde_json::json!({
            "partition_count": partition_count,
            "dry_run": dry_run,
            "wait": wait,
        });
        let response = self.client.post(self.url("partitions/scale")).json(&body).send().await?;
        decode(response).await
    }

    async fn reassign(
        &self,
        members: Vec<String>,
        replication_factor: Option<u32>,
        dry_run: bool,
        wait: bool,
    ) -> Result<ChangeResponse> {
        let body = serde_json::json!({
            "members": members,
            "replication_factor": replication_factor,
            "dry_run": dry_run,
            "wait": wait,
        });
        let response = self.client.post(self.url("partitions/reassign")).json(&body).send().await?;
        decode(response).await
    }

    async fn join_partition(
        &self,
        partition: u32,
        member: &str,
        priority: u32,
        dry_run: bool,
        wait: bool,
    ) -> Result<ChangeResponse> {
        let body = serde_json::json!({
            "member": member,
            "priority": priority,
            "dry_run": dry_run,
            "wait": wait,
        });
        let response = self
            .client
            .post(self.url(&format!("partitions/{}/replicas", partition)))
            .json(&body)
            .send()
            .await?;
        decode(response).await
    }

    async fn leave_partition(&self, partition: u32, member: &str, dry_run: bool, wait: bool) -> Result<ChangeResponse> {
        let response = self
            .client
            .delete(self.url(&format!("partitions/{}/replicas/{}", partition, member)))
            .query(&[("dry_run", dry_run), ("wait", wait)])
            .send()
            .await?;
        decode(response).await
    }

    async fn set_priority(
        &self,
        partition: u32,
        member: &str,
        priority: u32,
        dry_run: bool,
        wait: bool,
    ) -> Result<ChangeResponse> {
        let body = serde_json::json!({
            "priority": priority,
            "dry_run": dry_run,
            "wait": wait,
        });
        let response = self
            .client
            .put(self.url(&format!("partitions/{}/replicas/{}", partition, member)))
            .json(&body)
            .send()
            .await?;
        decode(response).await
    }

    async fn exporter(&self, name: &str, action: &str, dry_run: bool, wait: bool) -> Result<ChangeResponse> {
        let response = self
            .client
            .post(self.url(&format!("exporters/{}/{}", name, action)))
            .query(&[("dry_run", dry_run), ("wait", wait)])
            .send()
            .await?;
        decode(response).await
    }

    async fn cancel(&self) -> Result<ChangeResponse> {
        let response = self.client.post(self.url("changes/cancel")).send().await?;
        decode(response).await
    }

    async fn retry(&self) -> Result<ChangeResponse> {
        let response = self.client.post(self.url("changes/retry")).send().await?;
        decode(response).await
    }
}

/// Decode a success body, or turn the API's error body into an error.
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    match response.json::<ErrorResponse>().await {
        Ok(error) => anyhow::bail!("{} ({}): {}", error.message, error.error, status),
        Err(_) => anyhow::bail!("Request failed with status {}", status),
    }
}

// ============================================================================
// Command line
// ============================================================================

/// ctopo - cluster topology management
///
/// Keeps partition placement consistent across the members of a cluster.
#[derive(Parser)]
#[command(name = "ctopo")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Admin API URL of the node to talk to
    #[arg(short, long, global = true, default_value = DEFAULT_ADMIN_URL)]
    url: String,

    /// Log filter, overrides RUST_LOG (e.g. debug, clustertopo=trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node
    ///
    /// Examples:
    ///   ctopo start 0 --members 0,1,2 --partitions 3 --replication-factor 3 --http 127.0.0.1:9600
    ///   ctopo start 1 --bind 0.0.0.0:26503 --peer 0=10.0.0.1:26502
    Start {
        /// This node's member id
        member_id: String,

        /// Address for cluster messaging (default: 0.0.0.0:26502)
        #[arg(short, long)]
        bind: Option<SocketAddr>,

        /// Known peer as <member-id>=<address> (repeatable)
        #[arg(long = "peer", value_parser = parse_peer)]
        peers: Vec<(MemberId, SocketAddr)>,

        /// Directory for the persisted configuration (default: ~/.clustertopo/<member-id>)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Initial members, comma separated. The lowest one bootstraps the cluster.
        #[arg(long, value_delimiter = ',')]
        members: Vec<String>,

        /// Initial partition count
        #[arg(long, default_value_t = 1)]
        partitions: u32,

        /// Replicas per partition
        #[arg(long, default_value_t = 1)]
        replication_factor: u32,

        /// Exporter enabled on every partition (repeatable)
        #[arg(long = "exporter")]
        exporters: Vec<String>,

        /// Seconds to wait for an initialized peer
        #[arg(long, default_value_t = 30)]
        init_timeout: u64,

        /// Serve the admin API on this address
        #[arg(long)]
        http: Option<SocketAddr>,
    },

    /// Show the cluster configuration
    Topology,

    /// Show replicas and preferred leader per partition
    Partitions,

    /// Show node status and peers
    Status,

    /// Apply an explicit operation list
    ///
    /// The argument is a JSON file or a JSON string holding an array of
    /// operations, e.g.:
    ///   ctopo apply '[{"PartitionJoin": {"member": "0", "partition": 1, "priority": 1}}]'
    Apply {
        /// Path to a JSON file, or inline JSON
        operations: String,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Add members and rebalance partitions over them
    AddMember {
        /// Member ids to add
        #[arg(required = true)]
        members: Vec<String>,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Remove a member after moving its replicas away
    RemoveMember {
        /// Member id to remove
        member: String,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Increase the partition count
    Scale {
        /// Desired partition count
        partition_count: u32,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Move partitions so they are spread evenly over exactly these members
    ///
    /// Members not listed leave the cluster.
    Reassign {
        /// Target member ids
        #[arg(required = true)]
        members: Vec<String>,

        /// Must match the current replication factor
        #[arg(long)]
        replication_factor: Option<u32>,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Add a replica of a partition on a member
    JoinPartition {
        partition: u32,
        member: String,

        /// Priority of the new replica; the highest becomes preferred leader
        #[arg(long, default_value_t = 1)]
        priority: u32,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Remove a member's replica of a partition
    LeavePartition {
        partition: u32,
        member: String,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Change the priority of a replica
    SetPriority {
        partition: u32,
        member: String,
        priority: u32,

        #[command(flatten)]
        change: ChangeArgs,
    },

    /// Enable or disable an exporter on every replica
    Exporter {
        #[command(subcommand)]
        action: ExporterAction,
    },

    /// Cancel the remaining operations of a failed change
    Cancel,

    /// Retry a failed change from the operation that failed
    Retry,

    /// Read the persisted configuration of a stopped node
    Show {
        /// Member id; its default data directory is used
        #[arg(short, long)]
        member: Option<String>,

        /// Data directory holding the configuration file
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ExporterAction {
    /// Enable the exporter where it is not running yet
    Enable {
        name: String,

        #[command(flatten)]
        change: ChangeArgs,
    },
    /// Disable the exporter wherever it runs
    Disable {
        name: String,

        #[command(flatten)]
        change: ChangeArgs,
    },
}

#[derive(clap::Args)]
struct ChangeArgs {
    /// Print the expected result without committing
    #[arg(long)]
    dry_run: bool,

    /// Return right after the change is committed
    #[arg(long)]
    no_wait: bool,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Parse `<member-id>=<address>`.
fn parse_peer(s: &str) -> Result<(MemberId, SocketAddr), String> {
    let (member, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("expected <member-id>=<address>, got '{}'", s))?;
    let addr = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    };
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
    Ok((MemberId::new(member), addr))
}

/// Get the default data directory (~/.clustertopo/<member-id>)
fn default_data_dir(member: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".clustertopo").join(member))
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read operations from a file, or parse the argument itself as JSON.
fn read_operations(source: &str) -> Result<Vec<ClusterChangeOperation>> {
    let path = Path::new(source);
    let json = if path.is_file() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?
    } else {
        source.to_string()
    };
    serde_json::from_str(&json).context("Invalid operation list")
}

/// Format a timestamp in a human-readable way
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn print_configuration(config: &ClusterConfiguration) {
    if config.is_uninitialized() {
        println!("{}", "Not initialized".yellow());
        return;
    }

    println!("{}", "Cluster Configuration".bold().cyan());
    println!("  {} {}", "Version:".bright_white(), config.version);
    println!(
        "  {} {} (replication factor {})",
        "Partitions:".bright_white(),
        config.partition_config.partition_count,
        config.partition_config.replication_factor
    );
    println!();

    println!("{}", "Members:".bold());
    for (member, state) in &config.members {
        println!(
            "  {} {} {}",
            member.to_string().cyan(),
            format!("{:?}", state.status).bright_black(),
            format!("v{}", state.version).bright_black()
        );
        for (partition, replica) in &state.partitions {
            println!(
                "    partition {:<4} priority {:<3} {:?}",
                partition, replica.priority, replica.status
            );
        }
    }

    if let Some(plan) = &config.pending_changes {
        println!();
        match &plan.status {
            ChangeStatus::InProgress => {
                println!("{} {}", "Change in progress:".bold().yellow(), plan.id)
            }
            ChangeStatus::Failed { operation, reason } => {
                println!("{} {}", "Change failed:".bold().red(), plan.id);
                println!("  {} {}: {}", "Failed:".bright_white(), operation, reason);
            }
        }
        println!("  {} {}", "Completed:".bright_white(), plan.completed.len());
        for operation in &plan.pending {
            println!("  {} {}", "-".bright_black(), operation);
        }
    }

    if let Some(change) = &config.last_change {
        println!();
        println!(
            "{} {} {:?} at {}",
            "Last change:".bold(),
            change.id,
            change.status,
            format_timestamp(&change.completed_at)
        );
    }
}

fn print_partitions(partitions: &[PartitionMetadata]) {
    if partitions.is_empty() {
        println!("{}", "No partitions".yellow());
        return;
    }
    for partition in partitions {
        let replicas: Vec<String> = partition
            .priorities
            .iter()
            .map(|(member, priority)| format!("{}({})", member, priority))
            .collect();
        let primary = partition
            .primary
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string());
        let replicas = replicas.join(", ");
        let line = format!(
            "  partition {:<4} primary {:<6} replicas [{}]",
            partition.partition_id, primary, replicas
        );
        if partition.is_fully_replicated() {
            println!("{}", line);
        } else {
            println!("{} {}", line, "under-replicated".yellow());
        }
    }
}

fn print_status(status: &NodeStatus) {
    println!("{}", "Node Status".bold().cyan());
    println!("  {} {}", "Member:".bright_white(), status.member_id);
    println!("  {} {}", "Address:".bright_white(), status.address);
    println!("  {} {}", "Running:".bright_white(), status.running);
    println!("  {} {}", "Started:".bright_white(), format_timestamp(&status.started_at));
    println!("  {} {}", "Version:".bright_white(), status.version);
    println!("  {} {}", "Initialized:".bright_white(), status.initialized);
    println!("  {} {}", "Members:".bright_white(), status.member_count);
    println!("  {} {}", "Partitions:".bright_white(), status.partition_count);
    println!("  {} {}", "In-flight requests:".bright_white(), status.in_flight_requests);

    if let Some(change) = &status.pending_change {
        println!();
        let label = if change.failed {
            "Change failed:".bold().red()
        } else {
            "Change in progress:".bold().yellow()
        };
        println!("{} {}", label, change.id);
        if let Some(failure) = &change.failure {
            println!("  {}", failure);
        }
        for operation in &change.pending_operations {
            println!("  {} {}", "-".bright_black(), operation);
        }
    }

    println!();
    println!("{}", "Peers:".bold());
    if status.peers.is_empty() {
        println!("  {}", "none".bright_black());
    }
    for peer in &status.peers {
        let state = match peer.status {
            PeerStatus::Healthy => "healthy".green(),
            PeerStatus::Unreachable => "unreachable".red(),
            PeerStatus::Unknown => "unknown".bright_black(),
        };
        println!(
            "  {} {} {} (last seen {})",
            peer.member_id.to_string().cyan(),
            peer.address,
            state,
            format_timestamp(&peer.last_seen)
        );
    }
}

fn print_change(response: &ChangeResponse, dry_run: bool) {
    if dry_run {
        println!("{}", "Dry run".bold().yellow());
    } else if response.planned.is_empty() && response.change_id.is_none() {
        println!("{}", "No change needed".green());
    } else if response.completed {
        println!("{}", "OK".green().bold());
    } else {
        println!("{}", "Committed".cyan().bold());
    }

    if let Some(id) = response.change_id {
        println!("  {} {}", "Change:".bright_white(), id);
    }
    if !response.planned.is_empty() {
        println!("  {}", "Operations:".bright_white());
        for operation in &response.planned {
            println!("    {} {}", "-".bright_black(), operation);
        }
    }
    println!(
        "  {} {}",
        "Version:".bright_white(),
        response.configuration.version
    );
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let client = HttpClient::new(cli.url);

    match cli.command {
        Commands::Start {
            member_id,
            bind,
            peers,
            data_dir,
            members,
            partitions,
            replication_factor,
            exporters,
            init_timeout,
            http,
        } => {
            let data_dir = match data_dir {
                Some(dir) => dir,
                None => default_data_dir(&member_id)?,
            };
            let mut config = NodeConfig::new(member_id.as_str())
                .bind_addr(bind.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))))
                .data_dir(data_dir)
                .initialization_timeout(Duration::from_secs(init_timeout));
            for (member, addr) in peers {
                config = config.peer(member, addr);
            }
            if !members.is_empty() {
                let bootstrap = exporters.into_iter().fold(
                    StaticConfiguration::new(members, partitions, replication_factor),
                    |bootstrap, exporter| bootstrap.with_exporter(exporter),
                );
                config = config.bootstrap(bootstrap);
            }
            run_node(config, http).await
        }

        Commands::Topology => {
            let config = client.topology().await?;
            print_configuration(&config);
            Ok(())
        }

        Commands::Partitions => {
            let partitions = client.partitions().await?;
            print_partitions(&partitions);
            Ok(())
        }

        Commands::Status => {
            let status = client.status().await?;
            print_status(&status);
            Ok(())
        }

        Commands::Apply { operations, change } => {
            let operations = read_operations(&operations)?;
            let response = client
                .apply(operations, change.dry_run, !change.no_wait)
                .await
                .context("Failed to apply operations")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::AddMember { members, change } => {
            let response = client
                .add_members(members, change.dry_run, !change.no_wait)
                .await
                .context("Failed to add members")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::RemoveMember { member, change } => {
            let response = client
                .remove_member(&member, change.dry_run, !change.no_wait)
                .await
                .context("Failed to remove member")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::Scale {
            partition_count,
            change,
        } => {
            let response = client
                .scale(partition_count, change.dry_run, !change.no_wait)
                .await
                .context("Failed to scale partitions")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::Reassign {
            members,
            replication_factor,
            change,
        } => {
            let response = client
                .reassign(members, replication_factor, change.dry_run, !change.no_wait)
                .await
                .context("Failed to reassign partitions")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::JoinPartition {
            partition,
            member,
            priority,
            change,
        } => {
            let response = client
                .join_partition(partition, &member, priority, change.dry_run, !change.no_wait)
                .await
                .context("Failed to add replica")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::LeavePartition {
            partition,
            member,
            change,
        } => {
            let response = client
                .leave_partition(partition, &member, change.dry_run, !change.no_wait)
                .await
                .context("Failed to remove replica")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::SetPriority {
            partition,
            member,
            priority,
            change,
        } => {
            let response = client
                .set_priority(partition, &member, priority, change.dry_run, !change.no_wait)
                .await
                .context("Failed to change priority")?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::Exporter { action } => {
            let (name, action, change) = match action {
                ExporterAction::Enable { name, change } => (name, "enable", change),
                ExporterAction::Disable { name, change } => (name, "disable", change),
            };
            let response = client
                .exporter(&name, action, change.dry_run, !change.no_wait)
                .await
                .with_context(|| format!("Failed to {} exporter {}", action, name))?;
            print_change(&response, change.dry_run);
            Ok(())
        }

        Commands::Cancel => {
            let response = client.cancel().await.context("Failed to cancel change")?;
            println!("{}", "Cancelled".yellow().bold());
            if let Some(id) = response.change_id {
                println!("  {} {}", "Change:".bright_white(), id);
            }
            Ok(())
        }

        Commands::Retry => {
            let response = client.retry().await.context("Failed to retry change")?;
            print_change(&response, false);
            Ok(())
        }

        Commands::Show {
            member,
            data_dir,
            json,
        } => {
            let dir = match (data_dir, member) {
                (Some(dir), _) => dir,
                (None, Some(member)) => default_data_dir(&member)?,
                (None, None) => anyhow::bail!("Either --member or --data-dir is required"),
            };
            let path = dir.join(CONFIGURATION_FILE);
            let config = persistence::load(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?
                .with_context(|| format!("No configuration at {}", path.display()))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print_configuration(&config);
            }
            Ok(())
        }
    }
}

/// Run a node until Ctrl+C.
async fn run_node(config: NodeConfig, http: Option<SocketAddr>) -> Result<()> {
    let member = config.member_id.clone();
    let data_dir = config.data_dir.clone();

    println!("{}", "Starting cluster node...".bold().cyan());
    println!();

    let node = Arc::new(
        ClusterNode::open(config, ChangeExecutors::noop())
            .await
            .context("Failed to open cluster node")?,
    );
    let outcome = node.start().await.context("Failed to start cluster node")?;

    println!("  {} {}", "Member:".bright_white(), member);
    println!("  {} {}", "Address:".bright_white(), node.local_addr());
    if let Some(dir) = &data_dir {
        println!("  {} {}", "Data:".bright_white(), dir.display());
    }
    println!("  {} {:?}", "Configuration:".bright_white(), outcome);
    println!("  {} {}", "Version:".bright_white(), node.configuration().version);

    if let Some(addr) = http {
        let server = HttpServer::new(Arc::clone(&node));
        tokio::spawn(async move {
            if let Err(e) = server.bind(&addr.to_string()).await {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
        println!("  {} http://{}", "Admin API:".bright_white(), addr);
    }

    println!();
    println!("{}", "Node is running. Press Ctrl+C to stop.".green());

    signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    println!();
    println!("{}", "Shutting down...".yellow());
    node.stop().await.context("Failed to stop cluster node")?;
    Ok(())
}
