//! Development runner: seeds the in-memory stores from a fixtures file, feeds
//! newline-delimited JSON events from stdin through the engine and prints the
//! resulting delivery log as JSON lines on stdout.

use anyhow::Context;
use envconfig::Envconfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use formplug_engine::{Engine, EngineConfig, Fixtures};
use formplug_events::Event;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::init_from_env().context("failed to read FORMPLUG_* configuration")?;
    formplug_observability::init(config.log_format);

    let fixtures = config.fixtures.clone();
    let engine = Engine::start(config)?;

    if let Some(path) = fixtures {
        let summary = Fixtures::load(&path)?.apply(&engine)?;
        info!(path = %path, forms = summary.forms, responses = summary.responses, plugins = summary.plugins, "fixtures loaded");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut published = 0usize;
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => {
                engine.publish(event)?;
                published += 1;
            }
            Err(e) => warn!(line = line_no, error = %e, "skipping malformed event"),
        }
    }

    info!(published, "input closed; draining");
    engine.shutdown().await;

    for record in engine.deliveries().all()? {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}
