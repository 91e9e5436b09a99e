use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use run_router_xds::app::{App, BuildError};
use run_router_xds::config::{Args, Config, Environment};

const EXIT_LOGGER: i32 = 100;
const EXIT_SOURCE_CLIENT: i32 = 101;
const EXIT_SUBSCRIBE: i32 = 102;
const EXIT_FLAGS: i32 = 103;
const EXIT_ENVIRONMENT: i32 = 104;
const EXIT_ABORTED: i32 = 200;

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
    {
        eprintln!("failed to initialize logging: {e}");
        return EXIT_LOGGER;
    }

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // clap renders its own usage and help output.
            let _ = e.print();
            return if e.use_stderr() { EXIT_FLAGS } else { 0 };
        },
    };

    let env = match Environment::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!("{e}");
            return EXIT_ENVIRONMENT;
        },
    };

    let config = match Config::new(&args, &env) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return EXIT_FLAGS;
        },
    };

    let app = match App::build(config) {
        Ok(app) => app,
        Err(e @ BuildError::SourceClient(_)) => {
            error!("{e}");
            return EXIT_SOURCE_CLIENT;
        },
        Err(e @ BuildError::Subscribe(_)) => {
            error!("{e}");
            return EXIT_SUBSCRIBE;
        },
    };

    match app.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("the control plane aborted: {e:#}");
            EXIT_ABORTED
        },
    }
}
