use std::{process::exit, sync::Arc};

use config::AgentConfig;
use kube::Client;
use leadership::{elector::LeaderElector, LeadershipGate};
use log::{error, info, warn};
use pool::PoolManager;
use server::{serve_health, serve_webhook, Readiness};
use sweeper::run_sweeper;
use sync::rebuild_allocations;
use watchers::{watch_pods, watch_virtual_machines, WatchSync};
use webhook::{
    dispatcher::Dispatcher,
    namespaces::{start_namespace_reflector, NamespaceFilter},
};

mod assignments;
mod config;
mod leadership;
mod pool;
mod server;
mod sweeper;
mod sync;
mod watchers;
mod webhook;

#[tokio::main]
async fn main() {
    configure_logger();

    let config = get_config();
    let client = create_client().await;

    let gate = LeadershipGate::new();
    let readiness = Readiness::new(gate.clone());

    tokio::spawn(serve_health(config.health_probe_bind_address, readiness.clone()));

    match config.election.clone() {
        Some(election) => {
            tokio::spawn(LeaderElector::new(&client, election, gate.clone()).run());
        }
        None => {
            info!("Leader election is disabled, assuming leadership...");
            gate.promote();
        }
    }

    let epoch = gate.wait_for_leadership().await;
    info!("Leading as epoch {}, rebuilding allocations for {}...", epoch.id(), config.range);

    let table = match rebuild_allocations(&client, config.range).await {
        Ok(table) => table,
        Err(error) => {
            error!("Couldn't rebuild address allocations! {error}");
            exit(8)
        }
    };
    let pool = Arc::new(PoolManager::new(table, epoch));
    let virtual_machines_sync = WatchSync::default();

    let (namespace_reflector, namespace_store) = start_namespace_reflector(&client);
    tokio::spawn(namespace_reflector);
    tokio::spawn(run_sweeper(pool.clone(), config.sweeper));
    tokio::spawn(watch_pods(client.clone(), pool.clone()));
    tokio::spawn(watch_virtual_machines(
        client.clone(),
        pool.clone(),
        virtual_machines_sync.clone(),
    ));

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        NamespaceFilter::new(namespace_store),
        virtual_machines_sync,
    ));

    readiness.set_ready();

    tokio::select! {
        _ = serve_webhook(config.webhook_bind_address, config.tls.clone(), dispatcher) => {
            error!("Admission webhook server stopped!");
            exit(31)
        }
        _ = pool.epoch().ended() => {
            warn!("Lost leadership, exiting so the next epoch starts from the cluster state...");
            exit(32)
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }
}

fn get_config() -> AgentConfig {
    match AgentConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!("Invalid configuration! {error}");
            exit(5)
        }
    }
}

async fn create_client() -> Client {
    match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            error!("Couldn't create client! {error:?}");
            exit(6)
        }
    }
}

fn configure_logger() {
    env_logger::builder()
        .default_format()
        .format_module_path(false)
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init()
}
