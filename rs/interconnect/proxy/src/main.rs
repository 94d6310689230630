use clap::Parser;
use motion_proxy::{Cli, Config, Proxy};
use slog::{info, o, Drain, Logger};
use slog_async::AsyncGuard;

fn get_logger(config: &Config) -> (Logger, AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator)
        .build()
        .filter_level(config.logger.slog_level())
        .fuse();
    let (drain, guard) = slog_async::Async::new(drain).build_with_guard();
    (Logger::root(drain.fuse(), o!()), guard)
}

pub fn main() {
    let cli = Cli::parse();
    let config = match cli.get_config() {
        Ok(config) => config,
        Err(err) => {
            panic!("An error occurred while getting the config: {}", err);
        }
    };
    let (logger, _async_log_guard) = get_logger(&config);

    info!(
        logger,
        "starting the interconnect proxy with config: {}",
        serde_json::to_string_pretty(&config).unwrap()
    );

    // Every table lives in the one event loop; a single-threaded runtime is
    // all the concurrency this daemon has.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime");
    let exit_code = rt.block_on(async {
        let registry = prometheus::Registry::new();
        let (proxy, _handle) =
            Proxy::new(config, Some(cli.config.clone()), logger.clone(), &registry)
                .expect("failed to initialize the proxy");
        proxy.run().await
    });
    std::process::exit(exit_code);
}
