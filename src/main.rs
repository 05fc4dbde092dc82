use std::{process, sync::Arc, time::Duration};

use tokio::time::{self, Instant, Interval};

use ptp4u_tx::{
    client::{GrandmasterProfile, Job, SubscriptionClient},
    configuration::{Configuration, Parser},
    interface,
    protocol::MessageType,
    server::Server,
    stats::WorkerStats,
    timestamp_mode::TimestampMode,
};

#[tokio::main]
async fn main() {
    env_logger::init();

    let conf = Configuration::parse();
    if let Err(e) = conf.validate() {
        eprintln!("Configuration error: {}", e);
        process::exit(1);
    }
    log::info!("Configuration valid. Starting up...");

    let clock_identity = match interface::clock_identity(&conf.interface) {
        Some(id) => id,
        None if conf.timestamp_type == TimestampMode::Hardware => {
            eprintln!("Cannot read the MAC address of {}", conf.interface);
            process::exit(1);
        }
        None => {
            log::warn!(
                "No MAC address on {}, announcing clock identity 0",
                conf.interface
            );
            0
        }
    };
    log::info!("Clock identity {:016x}", clock_identity);

    let conf = Arc::new(conf);

    #[cfg(feature = "metrics")]
    let metrics_server = if conf.metrics {
        match ptp4u_tx::metrics::init(conf.metrics_addr).await {
            Ok(server) => Some(server),
            Err(e) => {
                eprintln!("Failed to start metrics server: {}", e);
                process::exit(1);
            }
        }
    } else {
        None
    };

    let stats = WorkerStats::new(conf.workers);
    #[cfg(feature = "metrics")]
    let stats = stats.with_metrics(conf.metrics);
    let stats = Arc::new(stats);

    let server = match Server::start(conf.clone(), stats.clone()) {
        Ok(server) => server,
        Err(e) => {
            eprintln!("Failed to start send workers: {}", e);
            process::exit(1);
        }
    };

    let clients = static_clients(&conf, clock_identity);
    if clients.is_empty() {
        log::warn!("No clients configured, workers will stay idle");
    }

    let grant = Duration::from_secs(conf.subscription_secs);
    // Renew well before the grant runs out.
    let mut renew = time::interval(grant / 2);
    let mut report = (conf.report_interval > 0).then(|| {
        let period = Duration::from_secs(conf.report_interval);
        time::interval_at(Instant::now() + period, period)
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = renew.tick() => {
                for client in &clients {
                    server.renew(client.clone(), grant);
                }
            }
            _ = next_report(&mut report) => {
                stats.snapshot_and_reset().print(conf.output_format);
            }
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    log::error!("Failed to listen for Ctrl-C: {}", e);
                }
                break;
            }
        }
    }

    log::info!("Shutting down...");
    stats.snapshot().print(conf.output_format);

    #[cfg(feature = "metrics")]
    if let Some(server) = metrics_server {
        server.shutdown();
    }

    if let Err(e) = server.shutdown().await {
        eprintln!("Send worker failed: {}", e);
        process::exit(1);
    }
}

/// Sync and Announce subscriptions for every `--client`.
fn static_clients(conf: &Configuration, clock_identity: u64) -> Vec<Job> {
    let profile = Arc::new(GrandmasterProfile::from_config(conf, clock_identity));
    let subscriptions = [
        (MessageType::Sync, Duration::from_millis(conf.sync_interval_ms)),
        (
            MessageType::Announce,
            Duration::from_millis(conf.announce_interval_ms),
        ),
    ];

    conf.clients
        .iter()
        .flat_map(|ip| {
            let profile = profile.clone();
            subscriptions.into_iter().map(move |(message_type, interval)| {
                Arc::new(SubscriptionClient::for_ip(
                    message_type,
                    *ip,
                    interval,
                    profile.clone(),
                ))
            })
        })
        .collect()
}

async fn next_report(report: &mut Option<Interval>) {
    match report {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
