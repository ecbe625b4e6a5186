use std::io::IsTerminal;
use std::time::Duration;

use exitcode::ExitCode;
use hetzner_sd::config::{self, Config, Opts};
use hetzner_sd::discovery::DiscoveryWorker;
use hetzner_sd::hetzner::HetznerClient;
use hetzner_sd::server::{self, Router};
use hetzner_sd::store::SnapshotStore;
use hetzner_sd::targets::TargetFormatter;
use hetzner_sd::tls::MaybeTlsListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn main() {
    let opts: Opts = argh::from_env();

    if opts.version {
        #[allow(clippy::print_stdout)]
        {
            println!("hetzner-sd {}", hetzner_sd::get_version());
        }
        return;
    }

    let levels = opts
        .log_level
        .clone()
        .or_else(|| std::env::var("HETZNER_SD_LOG_LEVEL").ok())
        .unwrap_or_else(|| config::DEFAULT_LOG_LEVEL.to_string());
    hetzner_sd::trace::init(std::io::stdout().is_terminal(), &levels);

    std::process::exit(match run(&opts) {
        Ok(()) => exitcode::OK,
        Err(code) => code,
    });
}

fn run(opts: &Opts) -> Result<(), ExitCode> {
    let config = Config::load(opts).map_err(|err| {
        error!(message = "invalid configuration", %err);
        exitcode::CONFIG
    })?;

    let threads = opts.threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
    });
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(threads)
        .thread_name("hetzner-sd-worker")
        .enable_io()
        .enable_time()
        .build()
        .map_err(|err| {
            error!(message = "failed to build the runtime", %err);
            exitcode::OSERR
        })?;

    let result = runtime.block_on(serve_and_discover(config));

    runtime.shutdown_timeout(Duration::from_secs(5));

    result
}

async fn serve_and_discover(config: Config) -> Result<(), ExitCode> {
    let addr = config.listen_addr().map_err(|err| {
        error!(message = "invalid configuration", %err);
        exitcode::CONFIG
    })?;
    let listener = MaybeTlsListener::bind(&addr, config.tls()).await.map_err(|err| {
        error!(message = "failed to bind the listener", %addr, %err);
        exitcode::UNAVAILABLE
    })?;
    let client =
        HetznerClient::new(&config.api_endpoint, config.api_token.clone()).map_err(|err| {
            error!(message = "failed to build the Hetzner client", %err);
            exitcode::CONFIG
        })?;

    let store = SnapshotStore::new();
    let formatter = TargetFormatter {
        node_port: config.node_port,
        node_network: config.node_network.clone(),
        label_prefix: config.node_label_prefix.clone(),
    };
    let router = Router::new(
        store.clone(),
        formatter,
        config.auth.as_ref(),
        &config.metrics_endpoint,
        config.debug,
    );

    let shutdown = CancellationToken::new();
    let worker = DiscoveryWorker::new(
        client,
        store,
        config.filter.clone(),
        config.refresh_interval(),
    );
    let mut discovery = tokio::spawn(worker.run(shutdown.clone()));

    let serving = server::serve(listener, router).with_graceful_shutdown(shutdown.clone());
    let server = tokio::spawn(serving.into_future());

    info!(
        message = "server is running",
        address = %addr,
        https = config.https,
        refresh_interval = ?config.refresh_interval(),
    );

    let mut sigint = signal(SignalKind::interrupt()).map_err(|_| exitcode::OSERR)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(|_| exitcode::OSERR)?;

    let result = tokio::select! {
        _ = sigint.recv() => {
            info!(message = "SIGINT received, shutting down");
            Ok(())
        }
        _ = sigterm.recv() => {
            info!(message = "SIGTERM received, shutting down");
            Ok(())
        }
        result = &mut discovery => {
            shutdown.cancel();
            let _ = server.await;

            // the worker already logged the cause
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(exitcode::SOFTWARE),
                Err(err) => {
                    error!(message = "discovery task failed", %err);
                    Err(exitcode::SOFTWARE)
                }
            };
        }
    };

    shutdown.cancel();

    if let Err(err) = discovery.await {
        error!(message = "discovery task failed", %err);
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(message = "http server exited with error", %err),
        Err(err) => error!(message = "server task failed", %err),
    }

    result
}
