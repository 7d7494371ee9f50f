//! QuartzFS Balancer CLI
//!
//! Out-of-band coordinator that evens byte occupancy across the storage
//! nodes of a QuartzFS cluster. Deployments wire a real name-service
//! connector through [`quartzfs_balancer::run_balancer`]; without one
//! configured, the binary runs in development mode against an in-process
//! mock cluster.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use clap::{CommandFactory, Parser};
use tracing::{info, Level};

use quartzfs_balancer::balancer::BalancerParams;
use quartzfs_balancer::config::Config;
use quartzfs_balancer::error::{ConfigError, ExitStatus, ServiceError};
use quartzfs_balancer::policy::PolicyKind;
use quartzfs_balancer::service::{
    BlockWithLocations, InsecureKeyManager, KeyManager, NameService, NodeInfo, NodeStorageReport,
    PlainChannel, StallTracker, StorageReport, StorageType,
};
use quartzfs_balancer::{runner, util};

#[derive(Parser)]
#[command(name = "quartzfs-balancer")]
#[command(about = "QuartzFS byte-occupancy balancing tool")]
struct Cli {
    /// Balancing policy: "node" (whole-node utilization) or "pool"
    /// (per-storage-type utilization)
    #[arg(long, default_value = "node")]
    policy: String,

    /// Allowed deviation from average utilization, in percent [1.0, 100.0]
    #[arg(long, default_value_t = 10.0)]
    threshold: f64,

    /// Comma-separated hosts excluded from balancing
    #[arg(long)]
    exclude: Option<String>,

    /// File of hosts excluded from balancing, one per line
    #[arg(long)]
    exclude_file: Option<PathBuf>,

    /// Comma-separated hosts; when given, only these participate
    #[arg(long)]
    include: Option<String>,

    /// File of hosts to include, one per line
    #[arg(long)]
    include_file: Option<PathBuf>,

    /// Treat the cluster topology as node-group aware
    #[arg(long, default_value = "false")]
    node_group_aware: bool,
}

fn host_set(
    flag: &str,
    list: &Option<String>,
    file: &Option<PathBuf>,
) -> Result<HashSet<String>, ConfigError> {
    match (list, file) {
        (Some(_), Some(_)) => Err(ConfigError::InvalidValue {
            key: flag.to_string(),
            value: "both a host list and a host file were given".to_string(),
        }),
        (Some(list), None) => Ok(util::parse_host_list(list)),
        (None, Some(path)) => util::read_host_file(path),
        (None, None) => Ok(HashSet::new()),
    }
}

fn build_params(cli: &Cli) -> Result<BalancerParams, ConfigError> {
    let params = BalancerParams {
        policy: PolicyKind::parse(&cli.policy)?,
        threshold: cli.threshold,
        excluded: host_set("--exclude", &cli.exclude, &cli.exclude_file)?,
        included: host_set("--include", &cli.include, &cli.include_file)?,
        node_group_aware: cli.node_group_aware,
    };
    params.validate()?;
    Ok(params)
}

/// Development-mode name service: a small balanced in-process cluster.
struct MockNameService {
    reports: Vec<NodeStorageReport>,
    lease: AtomicBool,
    stall: StallTracker,
}

impl MockNameService {
    fn balanced_cluster() -> Self {
        const GIB: u64 = 1 << 30;
        let reports = (1u16..=3)
            .map(|i| NodeStorageReport {
                node: NodeInfo {
                    node_uuid: format!("dn-{}", i),
                    hostname: format!("dn{}.local", i),
                    ip_addr: "127.0.0.1".to_string(),
                    transfer_port: 9860 + i,
                    rack: "/default-rack".to_string(),
                    node_group: None,
                    decommissioned: false,
                    decommissioning: false,
                },
                storages: vec![StorageReport {
                    storage_type: StorageType::Disk,
                    capacity: 100 * GIB,
                    used: 50 * GIB,
                    remaining: 50 * GIB,
                }],
            })
            .collect();
        Self {
            reports,
            lease: AtomicBool::new(false),
            stall: StallTracker::default(),
        }
    }
}

#[async_trait::async_trait]
impl NameService for MockNameService {
    fn block_pool_id(&self) -> String {
        "BP-mock".to_string()
    }

    async fn acquire_lease(&self) -> Result<(), ServiceError> {
        if self.lease.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning {
                path: "/system/balancer.id".to_string(),
            });
        }
        Ok(())
    }

    async fn storage_reports(&self) -> Result<Vec<NodeStorageReport>, ServiceError> {
        Ok(self.reports.clone())
    }

    async fn blocks_on_node(
        &self,
        _node_uuid: &str,
        _size_bytes: u64,
    ) -> Result<Vec<BlockWithLocations>, ServiceError> {
        Ok(Vec::new())
    }

    fn key_manager(&self) -> Arc<dyn KeyManager> {
        Arc::new(InsecureKeyManager)
    }

    fn should_continue(&self, bytes_moved: u64) -> bool {
        self.stall.should_continue(bytes_moved)
    }

    async fn close(&self) -> Result<(), ServiceError> {
        self.lease.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn run(cli: Cli) -> ExitStatus {
    let params = match build_params(&cli) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("{}.  Exiting ...", e);
            eprintln!("{}", Cli::command().render_long_help());
            return ExitStatus::IllegalArgs;
        }
    };

    let config = Config::from_env();
    info!("Development mode: using in-process mock name service");
    let services: Vec<Arc<dyn NameService>> = vec![Arc::new(MockNameService::balanced_cluster())];

    runner::run_balancer(services, Arc::new(PlainChannel), params, config).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    let cli = Cli::parse();
    let start = Instant::now();

    let status = run(cli).await;

    println!(
        "{:<24} Balancing took {}",
        chrono::Local::now()
            .format("%b %-d, %Y %-I:%M:%S %p")
            .to_string(),
        util::time_desc(start.elapsed())
    );
    std::process::exit(status.code());
}
