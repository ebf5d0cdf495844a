use std::env;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use repdash_adapters::credentials::KeyringVault;
use repdash_adapters::http::{HttpReportingApi, HttpSetupError};
use repdash_adapters::mock::MockReportingApi;
use repdash_core::api::SharedApi;
use repdash_core::cache::{default_cache_path, CacheError, CacheWriter, FileCache};
use repdash_core::config::{config_dir, AppConfig, ConfigError};
use repdash_core::connection_manager::ConnectionManager;
use repdash_core::credentials::{MemoryVault, SharedVault};
use repdash_core::dashboard::DashboardComposer;
use repdash_core::health::HealthMonitor;
use repdash_core::history::HistoryCoordinator;
use repdash_core::identity::ApiMode;
use repdash_core::notices::notice_channel;
use repdash_core::optimistic::CancellationToken;
use repdash_core::query_builder::QueryBuilder;
use repdash_core::reports::ReportRunner;
use repdash_core::schema::SchemaLoader;
use repdash_core::store::{AppStore, SharedStore, StoreSnapshot};
use repdash_tui::{Services, TuiError};
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "repdash.log";

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Http(#[from] HttpSetupError),
    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("failed to set up logging: {0}")]
    Logging(String),
    #[error(transparent)]
    Tui(#[from] TuiError),
}

fn init_tracing(config: &AppConfig) -> Result<WorkerGuard, AppError> {
    let log_dir = config_dir()?.join("logs");
    fs::create_dir_all(&log_dir).map_err(|error| AppError::Logging(error.to_string()))?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .map_err(|error| AppError::Logging(error.to_string()))?;
    Ok(guard)
}

fn build_api(config: &AppConfig) -> Result<SharedApi, AppError> {
    match config.api_mode() {
        ApiMode::Mock => Ok(Arc::new(MockReportingApi::seeded())),
        ApiMode::Live => Ok(Arc::new(HttpReportingApi::new(&config.api_base_url)?)),
    }
}

fn build_vault(config: &AppConfig) -> SharedVault {
    match config.api_mode() {
        ApiMode::Mock => Arc::new(MemoryVault::new()),
        ApiMode::Live => Arc::new(KeyringVault::default()),
    }
}

fn cache_for(config: &AppConfig) -> Result<FileCache, AppError> {
    let path = match &config.cache_path {
        Some(path) => path.clone(),
        None => default_cache_path()?,
    };
    Ok(FileCache::from_path(path))
}

fn run_app(
    config: &AppConfig,
    run_tui: impl FnOnce(Services) -> Result<(), TuiError>,
) -> Result<(), AppError> {
    let mode = config.api_mode();
    let api = build_api(config)?;
    let vault = build_vault(config);

    let cache = cache_for(config)?;
    let snapshot = match cache.read() {
        Ok(snapshot) => snapshot,
        Err(error) => {
            tracing::warn!(%error, "ignoring unreadable cache; starting empty");
            StoreSnapshot::default()
        }
    };
    let mut store = AppStore::new(snapshot);
    store.subscribe(Box::new(CacheWriter::new(cache)));
    let store = SharedStore::new(store);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("repdash-worker")
        .enable_all()
        .build()
        .map_err(AppError::Runtime)?;
    // Coordinators spawn timers from the UI thread.
    let _context = runtime.enter();

    let (notifier, notices) = notice_channel();
    let schema = SchemaLoader::new(api.clone(), notifier.clone(), mode, config.schema_ttl());
    let health = HealthMonitor::new(api.clone(), notifier.clone(), config.health_poll_interval());
    let stop = CancellationToken::new();
    let health_task = health.spawn(stop.clone());

    let services = Services {
        runtime: runtime.handle().clone(),
        connections: ConnectionManager::new(
            api.clone(),
            store.clone(),
            vault,
            schema,
            notifier.clone(),
            mode,
            config.name_check_debounce(),
        ),
        reports: ReportRunner::new(api.clone(), store.clone(), notifier.clone(), mode),
        history: HistoryCoordinator::new(api.clone(), notifier.clone(), config.undo_window()),
        query: QueryBuilder::new(api.clone(), store.clone(), notifier.clone(), mode),
        dashboard: DashboardComposer::new(api, store.clone(), notifier, mode),
        store,
        health,
        notices,
        export_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };

    tracing::info!(?mode, base_url = %config.api_base_url, "starting repdash");
    let result = run_tui(services);
    stop.cancel();
    health_task.abort();
    tracing::info!("repdash stopped");
    result.map_err(AppError::from)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load_default()?;
    if cfg!(feature = "mock") {
        config.mock_mode = true;
    }
    let _log_guard = init_tracing(&config)?;
    run_app(&config, repdash_tui::run)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io;

    use repdash_core::config::AppConfig;
    use repdash_core::identity::ApiMode;
    use tempfile::TempDir;

    use super::{build_api, run_app, AppError};

    fn mock_config(temp_dir: &TempDir) -> AppConfig {
        AppConfig {
            mock_mode: true,
            cache_path: Some(temp_dir.path().join("cache.json")),
            ..AppConfig::default()
        }
    }

    #[test]
    fn run_app_returns_ok_when_tui_runner_succeeds() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let result = run_app(&mock_config(&temp_dir), |services| {
            assert!(services.store.read(|store| store.connections().is_empty()));
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn run_app_propagates_tui_errors() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let result = run_app(&mock_config(&temp_dir), |_| {
            Err(repdash_tui::TuiError::Io(io::Error::other("boom")))
        });
        assert!(matches!(result, Err(AppError::Tui(_))));
    }

    #[test]
    fn corrupt_cache_starts_empty() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let config = mock_config(&temp_dir);
        std::fs::write(temp_dir.path().join("cache.json"), "{not json")
            .expect("failed to write cache");

        let result = run_app(&config, |services| {
            assert!(services.store.read(|store| store.connections().is_empty()));
            Ok(())
        });
        assert!(result.is_ok());
    }

    #[test]
    fn live_mode_rejects_a_bad_base_url() {
        let config = AppConfig {
            api_base_url: "not a url".to_string(),
            ..AppConfig::default()
        };
        assert_eq!(config.api_mode(), ApiMode::Live);
        assert!(matches!(build_api(&config), Err(AppError::Http(_))));
    }
}
