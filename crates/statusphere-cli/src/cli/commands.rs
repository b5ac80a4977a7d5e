use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use statusphere_core::firehose::{ConsumerConfig, ConsumerParts, JetstreamSource};
use statusphere_core::identity::{HttpIdentityService, IdResolver};
use statusphere_core::lexicon::StatusValidator;
use statusphere_core::repo::XrpcRepoClient;
use statusphere_core::stats::SharedIngestStats;
use statusphere_core::{CursorStore, Database, Materializer, StatusService, Supervisor};
use tracing::info;

use super::config::{Account, CliConfig};

/// Shared handles for one CLI invocation
pub struct App {
    pub config: CliConfig,
    pub db: Database,
    pub service: StatusService,
}

impl App {
    pub fn open(config: CliConfig) -> Result<Self> {
        let db = open_database(&config)?;
        let core = &config.core;

        let identity = HttpIdentityService::new(
            &core.handle_resolver_url,
            &core.plc_directory_url,
            core.resolver_timeout(),
        )
        .context("Failed to build identity client")?;
        let resolver = Arc::new(IdResolver::new(Arc::new(identity)));

        let mut repo =
            XrpcRepoClient::new(core.resolver_timeout()).context("Failed to build PDS client")?;
        if let Some(account) = &config.account {
            repo = repo.with_access_token(account.access_token.clone());
        }

        let service = StatusService::new(
            db.clone(),
            resolver,
            Arc::new(repo),
            Arc::new(StatusValidator::new()),
        );
        Ok(Self {
            config,
            db,
            service,
        })
    }
}

pub fn open_database(config: &CliConfig) -> Result<Database> {
    match config.core.database_path() {
        Some(path) => Database::open(path),
        None => Database::in_memory(),
    }
}

/// Run the ingester until Ctrl-C, then persist the cursor.
pub async fn ingest(app: &App) -> Result<Value> {
    let core = &app.config.core;
    let parts = ConsumerParts {
        source: Arc::new(JetstreamSource::new(core.jetstream_url.clone())),
        validator: Arc::new(StatusValidator::new()),
        materializer: Materializer::new(&app.db),
        cursors: CursorStore::with_interval(&app.db, core.cursor_write_interval()),
        stats: SharedIngestStats::new(),
    };
    let consumer_config = ConsumerConfig {
        collections: core.wanted_collections.clone(),
        cursor_stream: core.cursor_stream.clone(),
    };
    let supervisor = Supervisor::new(parts, consumer_config, core.backoff());

    let mut states = supervisor.subscribe_state();
    let state_log = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            info!(?state, "Supervisor state changed");
        }
    });

    supervisor.start();
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    eprintln!("Shutting down...");

    supervisor.stop().await.context("Failed to save cursor")?;
    state_log.abort();

    let cursor = CursorStore::new(&app.db).read(&core.cursor_stream)?;
    Ok(json!({
        "cursor": cursor,
        "stats": supervisor.stats(),
    }))
}

pub async fn statuses(app: &App, limit: usize) -> Result<Value> {
    let views = app.service.recent(limit).await?;
    Ok(json!({ "statuses": views }))
}

pub async fn user(app: &App, handle: &str) -> Result<Value> {
    let views = app.service.statuses_by_handle(handle).await?;
    Ok(json!({ "statuses": views }))
}

fn configured_account(app: &App) -> Result<&Account> {
    match &app.config.account {
        Some(account) => Ok(account),
        None => bail!(
            "No account configured; add \"account\" with did and accessToken to the config file"
        ),
    }
}

/// Profile and latest status of the configured account
pub async fn me(app: &App) -> Result<Value> {
    let account = configured_account(app)?;
    let info = app.service.user_info(&account.did).await?;
    Ok(serde_json::to_value(info)?)
}

pub async fn send(app: &App, status: &str) -> Result<Value> {
    let account = configured_account(app)?;
    let outcome = app.service.send_status(&account.did, status).await?;
    if let Some(warning) = &outcome.warning {
        eprintln!("Warning: {}", warning);
    }
    Ok(json!({ "uri": outcome.uri, "status": outcome.status }))
}

pub fn cursor(db: &Database, stream: &str) -> Result<Value> {
    let seq = CursorStore::new(db).read(stream)?;
    Ok(json!({ "stream": stream, "cursor": seq }))
}

pub fn print_json(value: &Value, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", text);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &std::path::Path) -> CliConfig {
        let mut config = CliConfig::default();
        config.core.data_dir = dir.to_path_buf();
        config
    }

    #[test]
    fn test_open_database_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let db = open_database(&config).unwrap();
        CursorStore::new(&db).force_write("jetstream", 42).unwrap();
        drop(db);

        assert!(dir.path().join("statusphere.db").exists());
        let db = open_database(&config).unwrap();
        assert_eq!(
            cursor(&db, "jetstream").unwrap(),
            json!({ "stream": "jetstream", "cursor": 42 })
        );
    }

    #[test]
    fn test_cursor_for_fresh_database_is_null() {
        let db = Database::in_memory().unwrap();
        assert_eq!(
            cursor(&db, "jetstream").unwrap(),
            json!({ "stream": "jetstream", "cursor": null })
        );
    }

    #[tokio::test]
    async fn test_send_requires_account() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(config_in(dir.path())).unwrap();
        let err = send(&app, "👍").await.unwrap_err();
        assert!(err.to_string().contains("No account configured"));
    }

    #[tokio::test]
    async fn test_me_requires_account() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(config_in(dir.path())).unwrap();
        let err = me(&app).await.unwrap_err();
        assert!(err.to_string().contains("No account configured"));
    }

    #[tokio::test]
    async fn test_statuses_on_empty_cache() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::open(config_in(dir.path())).unwrap();
        assert_eq!(statuses(&app, 10).await.unwrap(), json!({ "statuses": [] }));
    }
}
