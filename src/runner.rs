//! Multi-service balancing run.
//!
//! Sweeps every configured name service once per round, in shuffled order,
//! until all of them report a terminal status. Any terminal non-success
//! aborts the whole run with that status. Leases are acquired up front and
//! every connector is closed on every exit path.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::balancer::{Balancer, BalancerParams};
use crate::config::Config;
use crate::error::ExitStatus;
use crate::service::{ChannelAuthenticator, NameService};

/// Run the balancer against every configured name service until done.
pub async fn run_balancer(
    services: Vec<Arc<dyn NameService>>,
    authenticator: Arc<dyn ChannelAuthenticator>,
    params: BalancerParams,
    config: Config,
) -> ExitStatus {
    info!(
        services = services.len(),
        policy = params.policy.name(),
        threshold = params.threshold,
        bandwidth_per_sec = config.bandwidth_per_sec,
        "starting balancer"
    );

    for service in &services {
        if let Err(e) = service.acquire_lease().await {
            warn!(error = %e, "failed to acquire balancer lease");
            println!("{}.  Exiting ...", e);
            let status = ExitStatus::from(&e);
            close_all(&services).await;
            return status;
        }
    }

    println!(
        "Time Stamp               Iteration#  Bytes Already Moved  Bytes Left To Move  Bytes Being Moved"
    );

    let status = tokio::select! {
        status = balance_rounds(&services, &authenticator, &params, &config) => status,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            ExitStatus::Interrupted
        }
    };

    close_all(&services).await;
    status
}

async fn balance_rounds(
    services: &[Arc<dyn NameService>],
    authenticator: &Arc<dyn ChannelAuthenticator>,
    params: &BalancerParams,
    config: &Config,
) -> ExitStatus {
    let mut balancers: Vec<Balancer> = services
        .iter()
        .map(|service| {
            Balancer::new(
                service.clone(),
                authenticator.clone(),
                params.clone(),
                config.clone(),
            )
        })
        .collect();

    let mut order: Vec<usize> = (0..balancers.len()).collect();
    for iteration in 0.. {
        let mut done = true;
        order.shuffle(&mut rand::thread_rng());
        for &idx in &order {
            let status = balancers[idx].run_iteration(iteration).await;
            balancers[idx].reset_data();
            match status {
                ExitStatus::InProgress => done = false,
                ExitStatus::Success => {}
                other => return other,
            }
        }
        if done {
            break;
        }
        tokio::time::sleep(config.round_sleep()).await;
    }
    ExitStatus::Success
}

async fn close_all(services: &[Arc<dyn NameService>]) {
    for service in services {
        if let Err(e) = service.close().await {
            warn!(error = %e, "failed to close name service connector");
        }
    }
}
