use bridged::config::BridgeConfig;
use bridged::daemon::{self, DaemonError};
use clap::{App, Arg};
use ferrite::logging;
use std::process::exit;

// Exit codes: 0 clean shutdown, 1 configuration rejected, 2 crypto
// self-test failure, 3 unrecoverable supervised-task failure.
const EXIT_CONFIG: i32 = 1;
const EXIT_CRYPTO: i32 = 2;
const EXIT_TASK: i32 = 3;

pub fn main() {
    let matches = App::new("Bridge Daemon")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Bridges an MCU serial link to an MQTT v5 broker.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the config file")
                .required(true),
        )
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();

    let config = match BridgeConfig::load(config_file_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration rejected: {}", error);
            exit(EXIT_CONFIG);
        }
    };

    let logger = match config.log_config {
        Some(ref path) => match logging::init_from_file(path) {
            Ok(logger) => logger,
            Err(error) => {
                eprintln!("configuration rejected: log config: {}", error);
                exit(EXIT_CONFIG);
            }
        },
        None => logging::init(),
    };

    // No serial activity before the primitives prove themselves.
    if let Err(failure) = ferrite::crypto::self_test() {
        logging::crit!(logger, "crypto self test failed"; "failure" => ?failure);
        exit(EXIT_CRYPTO);
    }

    logging::info!(logger, "starting bridge daemon";
                   "serial_port" => &config.serial.port,
                   "mqtt_host" => &config.mqtt.host,
                   "topic_prefix" => &config.mqtt.topic_prefix);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Error building the runtime");

    let local = tokio::task::LocalSet::new();
    let result = local.block_on(&runtime, daemon::run(config, logger.clone()));

    match result {
        Ok(()) => {
            logging::info!(logger, "clean shutdown");
        }
        Err(DaemonError::Setup(detail)) => {
            logging::crit!(logger, "startup failed"; "error" => &detail);
            exit(EXIT_CONFIG);
        }
        Err(DaemonError::TaskFailed(detail)) => {
            logging::crit!(logger, "supervised task failed"; "error" => &detail);
            exit(EXIT_TASK);
        }
    }
}
