use tracing_subscriber::EnvFilter;

use pbx::{run, Config, USAGE};

fn init_logging(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("PBX_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> anyhow::Result<()> {
    let config = match Config::from_args(std::env::args_os().skip(1).collect())? {
        Some(config) => config,
        None => {
            println!("{}", USAGE);
            return Ok(());
        }
    };
    init_logging(config.verbose);
    run(config)
}
