mod cmd;
mod util;

use argp::FromArgs;
use tracing_subscriber::{EnvFilter, filter::LevelFilter};
use typed_path::Utf8NativePathBuf;

use crate::util::{load_config, native_path};

#[derive(FromArgs, PartialEq, Debug)]
/// Operator tools for the diffcast pipeline.
struct TopLevel {
    #[argp(subcommand)]
    command: SubCommand,
    #[argp(option, short = 'c', from_str_fn(native_path))]
    /// configuration file (default: $DIFFCAST_CONFIG or config.yml)
    config: Option<Utf8NativePathBuf>,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argp(subcommand)]
enum SubCommand {
    TestStage(cmd::test_stage::Args),
    Run(cmd::run::Args),
    Status(cmd::status::Args),
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt().with_env_filter(env_filter).with_writer(std::io::stderr).init();

    let args: TopLevel = argp::parse_args_or_exit(argp::DEFAULT);
    let config_path = args.config.unwrap_or_else(|| {
        Utf8NativePathBuf::from(
            std::env::var("DIFFCAST_CONFIG").unwrap_or_else(|_| "config.yml".to_string()),
        )
    });
    let result = match load_config(&config_path) {
        Ok(config) => match args.command {
            SubCommand::TestStage(c_args) => cmd::test_stage::run(c_args, &config).await,
            SubCommand::Run(c_args) => cmd::run::run(c_args, &config).await,
            SubCommand::Status(c_args) => cmd::status::run(c_args, &config).await,
        },
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        eprintln!("Failed: {e:?}");
        std::process::exit(1);
    }
}
