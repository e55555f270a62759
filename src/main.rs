use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::interval;
use tracing::{info, warn};

use catalog_import_sync::{
    extract_urls, init_tracing, overlay_percent, parse_url_csv, AppConfig, ConnectionBanner,
    HttpVideoApi, ImportSync, RenderState, TelemetryClient, WebSocketTransport,
};

/// Submits a bulk video import and follows it until every video settles.
#[derive(Parser, Debug)]
#[command(name = "import-sync")]
#[command(version)]
struct Args {
    /// List (collection) the videos are imported into
    #[arg(short, long, env = "IMPORT_LIST_ID")]
    list: String,

    /// CSV file to read video URLs from
    #[arg(long)]
    csv: Option<PathBuf>,

    /// How often to print card states
    #[arg(long, default_value = "250")]
    render_every_ms: u64,

    /// Video URLs (free text is fine; anything that is not a URL is ignored)
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = AppConfig::from_env();

    let mut urls = extract_urls(&args.urls.join(" "));
    if let Some(path) = &args.csv {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        for url in parse_url_csv(&bytes).context("failed to parse CSV")? {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
    }
    if urls.is_empty() {
        bail!("no video URLs found in arguments or CSV");
    }

    let telemetry = TelemetryClient::new(&config.telemetry_dir, &config)
        .context("failed to open telemetry journal")?;
    let api = HttpVideoApi::new(&config.api_base_url, config.http_timeout())
        .context("failed to build REST client")?;
    let transport = WebSocketTransport::new(config.realtime_url.clone());
    let sync = ImportSync::start(&config, Arc::new(api), Arc::new(transport), telemetry);

    let batch = sync
        .submit_batch(&args.list, &urls)
        .await
        .context("bulk import request failed")?;
    info!(
        created = batch.created.len(),
        failed = batch.failed.len(),
        "batch submitted"
    );
    for failure in &batch.failed {
        println!("rejected  {}  {}", failure.url, failure.error);
    }

    let mut poll = Box::pin(batch.poll.wait());
    let mut connection = sync.connection();
    let mut ticker = interval(Duration::from_millis(args.render_every_ms.max(10)));
    let mut last_shown: HashMap<String, String> = HashMap::new();

    let outcome = loop {
        tokio::select! {
            outcome = &mut poll => break outcome.context("batch poll task failed")?,
            changed = connection.changed() => {
                if changed.is_err() {
                    continue;
                }
                let state = *connection.borrow_and_update();
                match ConnectionBanner::from_state(state) {
                    Some(banner) => println!("[{}]", banner.message()),
                    None => println!("[live updates connected]"),
                }
            }
            _ = ticker.tick() => {
                for video in sync.cache().list(&args.list) {
                    if !batch.created.contains(&video.id) {
                        continue;
                    }
                    let Some(state) = sync.render_state(&video.id) else {
                        continue;
                    };
                    let line = describe(&state);
                    if last_shown.get(&video.id) != Some(&line) {
                        println!("{}  {line}", video.id);
                        last_shown.insert(video.id, line);
                    }
                }
            }
        }
    };

    for id in &batch.created {
        if let Some(state) = sync.render_state(id) {
            println!("{id}  {}", describe(&state));
        }
    }
    if let Some(banner) = ConnectionBanner::from_state(sync.connection_state()) {
        info!(banner = %banner.message(), "live updates were not connected at exit");
    }
    sync.record_batch_outcome(&outcome);
    sync.shutdown();
    if outcome.failed_polls > 0 {
        warn!(failed_polls = outcome.failed_polls, "some polls failed along the way");
    }
    info!(polls = outcome.polls, "all imports settled");
    Ok(())
}

fn describe(state: &RenderState) -> String {
    match state {
        RenderState::Importing {
            stage, progress, ..
        } => format!("{:>3}%  {}", overlay_percent(*progress), stage.label()),
        RenderState::Error { message } => {
            format!("error  {}", message.as_deref().unwrap_or("import failed"))
        }
        RenderState::Idle => "ready".to_string(),
    }
}
