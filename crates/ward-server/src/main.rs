//! HTTP front end of the ward allocator

mod config;
mod http;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use eyre::{bail, eyre, Result, WrapErr};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ward_core::{RequestHandler, SystemClock};

use crate::config::Settings;

/// Command line options
#[derive(Debug)]
struct Opts {
    settings: Settings,
}

impl Opts {
    /// Read the settings file, then apply the command line flags on top
    fn from_args() -> Result<Self> {
        let mut config_path: Option<PathBuf> = None;
        let mut flags: Vec<(String, String)> = Vec::new();

        let mut option: Option<String> = None;
        for arg in std::env::args().skip(1) {
            if let Some(opt) = option.take() {
                if opt == "-config" {
                    config_path = Some(PathBuf::from(arg));
                } else {
                    flags.push((opt, arg));
                }
            } else {
                option = Some(arg);
            }
        }
        if let Some(opt) = option {
            bail!("leftover option {opt}");
        }

        let mut settings = Settings::load(config_path.as_deref())?;
        for (opt, arg) in flags {
            match opt.as_str() {
                "-port" => {
                    settings.server.port = arg
                        .parse()
                        .map_err(|_| eyre!("-port takes a decimal u16"))?
                }
                "-host" => settings.server.host = arg,
                "-workers" => {
                    settings.server.workers = arg
                        .parse()
                        .map_err(|_| eyre!("-workers takes a decimal u32"))?
                }
                "-database" => settings.allocator.database = Some(PathBuf::from(arg)),
                "-return-secs" => {
                    settings.allocator.ambulance_return_secs = arg
                        .parse()
                        .map_err(|_| eyre!("-return-secs takes a decimal u32"))?
                }
                "-sweep-secs" => {
                    settings.allocator.sweep_interval_secs = Some(
                        arg.parse()
                            .map_err(|_| eyre!("-sweep-secs takes a decimal u32"))?,
                    )
                }
                _ => bail!("unknown option {opt}"),
            }
        }

        if settings.server.workers == 0 {
            bail!("at least one worker is required");
        }
        Ok(Opts { settings })
    }
}

fn http_loop<H: RequestHandler>(server: &tiny_http::Server, handler: &H) {
    loop {
        let rq = match server.recv() {
            Ok(rq) => rq,
            Err(err) => {
                warn!(%err, "HTTP receive failed");
                continue;
            }
        };
        if let Some(rq) = http::parse(rq) {
            handler.handle(rq);
        }
    }
}

fn main() -> Result<()> {
    let opts = Opts::from_args()?;
    let settings = &opts.settings;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.logging.filter))
        .wrap_err("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = ward_allocator::open_store(&settings.allocator)?;
    let desk = ward_allocator::launch(&settings.allocator, store, Arc::new(SystemClock))?;

    let addr = (settings.server.host.as_str(), settings.server.port);
    let server = tiny_http::Server::http(addr)
        .map_err(|err| eyre!("could not listen on {}:{}: {err}", addr.0, addr.1))?;
    info!(
        host = addr.0,
        port = addr.1,
        workers = settings.server.workers,
        database = ?settings.allocator.database,
        "ward allocator listening"
    );

    thread::scope(|s| -> Result<()> {
        for i in 0..settings.server.workers {
            thread::Builder::new()
                .name(format!("http_{i}"))
                .spawn_scoped(s, || http_loop(&server, &desk))?;
        }
        Ok(())
    })?;

    desk.shutdown();
    Ok(())
}
