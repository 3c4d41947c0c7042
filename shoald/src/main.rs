use clap::{App, Arg};
use keel::allowlist::{self, AllowlistHandle};
use keel::logging;
use shoal::buf::CHUNK_SIZE;
use shoal::cluster::ServerPool;
use shoal::msg::MsgArena;
use shoal::net::endpoint::Endpoint;
use std::time::Duration;

mod config;

use config::ProxyConfig;

pub fn main() {
    let matches = App::new("shoald")
        .version("0.1.0")
        .author("Bush Hammer Industries")
        .about("Runs the redis cluster proxy.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_path = matches.value_of("CONFIG_FILE").unwrap();
    let config = ProxyConfig::load(config_path);

    let (log, log_level) =
        logging::init(&config.log_settings()).expect("Error building the logger");

    // SIGTTIN raises verbosity, SIGTTOU lowers it; the endpoint applies the
    // requests on its tick.
    let admin = logging::signal_controls();

    logging::info!(log, "starting proxy";
                   "listen" => %config.listen.address,
                   "pool" => %config.pool.name,
                   "seeds" => config.pool.servers.len());

    let allowlist = match &config.listen.allowlist_file {
        Some(path) => allowlist::spawn(
            path.into(),
            Duration::from_secs(config.listen.allowlist_interval_secs),
            log.new(logging::o!("thread" => "allowlist")),
        ),
        None => AllowlistHandle::disabled(),
    };

    let pool = ServerPool::new(
        config.pool_config(),
        log.new(logging::o!("pool" => config.pool.name.clone())),
    );

    let mut endpoint = Endpoint::new(
        &config.listen.address,
        pool,
        MsgArena::new(CHUNK_SIZE),
        allowlist,
        log_level,
        Some(admin),
        Duration::from_millis(config.tick_interval_ms),
        log.clone(),
    )
    .expect("Error binding the proxy endpoint");

    logging::info!(log, "proxy running");

    if let Err(err) = endpoint.run() {
        logging::crit!(log, "proxy loop failed"; "err" => ?err);
        std::process::exit(1);
    }
}
