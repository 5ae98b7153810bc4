mod cli;
mod config;
mod endpoint;
mod engine;
mod router;

use std::io::{self, Write};

use anyhow::{Context, Result};

use crate::cli::DebugTimer;
use crate::config::{Config, Settings};
use crate::endpoint::{PtyEndpoint, SourcePort};
use crate::engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();
    let timer = DebugTimer::new(args.profile);
    timer.log("args parsed");

    let file_config = Config::load()?;
    let settings = Settings::resolve(&args, &file_config)?;
    timer.log("settings validated");

    if args.save_defaults {
        Config::from(&settings)
            .save()
            .context("failed to save defaults")?;
        timer.log("defaults saved");
    }

    let source = SourcePort::open(&settings.source)?;
    timer.log("source opened");

    let mut endpoints = Vec::with_capacity(settings.endpoint_count);
    for index in 0..settings.endpoint_count {
        let endpoint = PtyEndpoint::allocate()
            .with_context(|| format!("failed to allocate endpoint {index}"))?;
        timer.log(&format!(
            "endpoint {index} allocated at {}",
            endpoint.path().display()
        ));
        endpoints.push(endpoint);
    }

    // Startup contract: one line per endpoint, in index order, naming the
    // path other processes open. Nothing else goes to stdout after this.
    for endpoint in &endpoints {
        println!("{}", endpoint.path().display());
    }
    io::stdout().flush().context("failed to flush endpoint report")?;
    timer.dump();

    Engine::new(&settings, source, endpoints).run().await
}
