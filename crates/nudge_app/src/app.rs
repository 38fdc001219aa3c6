use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use nudge_domain::{
    config::EngineConfig,
    store::{MemoryStore, ReminderStore},
    ReminderService,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::ConsoleChannel,
    session::{Flow, Session},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppConfig {
    pub(crate) state_file: Option<PathBuf>,
    pub(crate) check_interval: Duration,
    pub(crate) retry_period: Duration,
    pub(crate) owner: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Unset or unparsable values keep their defaults.
    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup("NUDGE_STATE_FILE") {
            let path = path.trim();
            if !path.is_empty() {
                config.state_file = Some(PathBuf::from(path));
            }
        }
        if let Some(secs) = lookup("NUDGE_CHECK_INTERVAL_SECS") {
            if let Ok(value) = secs.trim().parse::<i64>() {
                if value > 0 {
                    config.check_interval = Duration::seconds(value);
                }
            }
        }
        if let Some(secs) = lookup("NUDGE_RETRY_SECS") {
            if let Ok(value) = secs.trim().parse::<i64>() {
                if value > 0 {
                    config.retry_period = Duration::seconds(value);
                }
            }
        }
        if let Some(owner) = lookup("NUDGE_OWNER") {
            let owner = owner.trim();
            if !owner.is_empty() {
                config.owner = owner.to_string();
            }
        }
        config
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_fallback_check_interval(self.check_interval)
            .with_retry_period(self.retry_period)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            state_file: None,
            check_interval: engine.fallback_check_interval,
            retry_period: engine.retry_period,
            owner: "me".to_string(),
        }
    }
}

fn open_store(config: &AppConfig) -> Result<Arc<dyn ReminderStore>> {
    let store = match &config.state_file {
        Some(path) => {
            info!(path = %path.display(), "opening state file");
            MemoryStore::open(path)
                .with_context(|| format!("failed to open state file {}", path.display()))?
        }
        None => {
            warn!("NUDGE_STATE_FILE not set, reminders will not survive a restart");
            MemoryStore::new()
        }
    };
    Ok(Arc::new(store))
}

/// Runs the console front end until `quit`, end of input or Ctrl-C.
pub async fn run(config: AppConfig) -> Result<()> {
    let store = open_store(&config)?;
    let service = ReminderService::builder(Arc::new(ConsoleChannel::stdout()))
        .with_store(store)
        .with_config(config.engine_config())
        .build();

    let shutdown = CancellationToken::new();
    service
        .start(&shutdown)
        .await
        .context("failed to start reminder service")?;
    info!(
        owner = %config.owner,
        check_secs = config.check_interval.num_seconds(),
        retry_secs = config.retry_period.num_seconds(),
        "nudge ready"
    );
    println!("{}", Session::help());

    let session = Session::new(&service, config.owner.clone());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            result = &mut interrupt => {
                if let Err(err) = result {
                    warn!(%err, "unable to listen for interrupt");
                }
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read command")? else {
                    debug!("end of input");
                    break;
                };
                match session.handle_line(&line).await {
                    Ok(Flow::Continue(reply)) => {
                        if !reply.is_empty() {
                            println!("{reply}");
                        }
                    }
                    Ok(Flow::Quit) => break,
                    Err(err) => println!("error: {err:#}"),
                }
            }
        }
    }

    shutdown.cancel();
    service.shutdown().await;
    Ok(())
}
