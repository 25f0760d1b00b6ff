//! relaymux: real-time media routing server.
//!
//! Exit codes: 0 on normal shutdown, 1 on fatal initialization error.

mod core;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use relaymux_core::Conf;

#[derive(Parser)]
#[command(name = "relaymux", about = "Real-time media routing server", version)]
struct Args {
    /// Path to the configuration file (JSON, YAML or TOML).
    #[arg(long, env = "RMX_CONF")]
    conf: Option<PathBuf>,
}

fn load_conf(path: Option<&PathBuf>) -> anyhow::Result<Arc<Conf>> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path.clone()));
    }
    builder = builder.add_source(config::Environment::with_prefix("RMX"));

    let doc: serde_json::Value = builder.build()?.try_deserialize()?;
    let conf = Conf::from_json_value(doc)?;
    conf.validate()?;
    Ok(Arc::new(conf))
}

fn main() -> ExitCode {
    let args = Args::parse();

    let conf = match load_conf(args.conf.as_ref()) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = relaymux_core::logging::init_logging(&conf) {
        eprintln!("logging error: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("runtime error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(core::run(conf)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
