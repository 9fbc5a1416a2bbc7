use std::path::PathBuf;
use std::sync::Arc;

use bi_dashboard::bootstrap::Bootstrap;
use bi_dashboard::config::{ConfigError, DashboardConfig};
use bi_dashboard::dashboard_api::{
    ColumnMapping, CreateDatasetRequest, DEFAULT_HISTORY_LIMIT, DEFAULT_METRICS_MONTHS, HistoryQuery, SystemField,
    UpsertMappingsRequest,
};
use bi_dashboard::http::{ApiError, ApiRequest};
use bi_dashboard::identity::{
    DeviceCode, DevicePrompt, DisabledIdentityProvider, GoogleIdentityProvider, IdentityProvider, ProviderError,
};
use bi_dashboard::routes::{Route, RouteDecision, Router};
use bi_dashboard::state::AppState;
use bi_dashboard::storage::{CredentialStore, FileCredentialStore};
use bi_dashboard::types::AuthError;
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing_subscriber::filter::LevelFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid query parameter `{0}`; expected key=value")]
    InvalidQuery(String),
    #[error("invalid column mapping `{0}`; expected column=Field")]
    InvalidMapping(String),
    #[error("cannot read {}: {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "dashboard-cli", about = "BI dashboard session and API CLI")]
struct Cli {
    /// Backend API root; overrides `DASHBOARD_API_BASE_URL`.
    #[arg(long, env = "DASHBOARD_API_BASE_URL")]
    base_url: Option<String>,

    /// Refresh-token file; overrides `DASHBOARD_CREDENTIALS_PATH`.
    #[arg(long, env = "DASHBOARD_CREDENTIALS_PATH")]
    credentials: Option<PathBuf>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with Google (device code) and exchange for a backend session.
    Login,
    /// Revoke the backend session and forget local credentials.
    Logout,
    /// Restore the session and print the auth state.
    Status,
    /// Print where the route guard sends a location.
    Route { location: String },
    Api(ApiCommand),
    /// List the signed-in user's dataset ids.
    Datasets,
    Dataset(DatasetCommand),
    History(HistoryArgs),
    /// Upload a CSV file into a dataset.
    Upload(UploadArgs),
    Batch(BatchCommand),
    Metrics(MetricsArgs),
}

#[derive(Args, Debug)]
struct ApiCommand {
    #[command(subcommand)]
    command: ApiSubcommand,
}

#[derive(Subcommand, Debug)]
enum ApiSubcommand {
    /// Authenticated GET against any API path.
    Get {
        path: String,
        /// `key=value`, repeatable.
        #[arg(long = "query", short = 'q')]
        query: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct DatasetCommand {
    #[command(subcommand)]
    command: DatasetSubcommand,
}

#[derive(Subcommand, Debug)]
enum DatasetSubcommand {
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Delete {
        dataset_id: i64,
    },
}

#[derive(Args, Debug)]
struct HistoryArgs {
    #[arg(long)]
    dataset_id: i64,
    #[arg(long, default_value_t = DEFAULT_HISTORY_LIMIT)]
    limit: u32,
    #[arg(long, default_value_t = 0)]
    offset: u32,
}

#[derive(Args, Debug)]
struct UploadArgs {
    #[arg(long)]
    dataset_id: i64,
    file: PathBuf,
}

#[derive(Args, Debug)]
struct BatchCommand {
    #[command(subcommand)]
    command: BatchSubcommand,
}

#[derive(Subcommand, Debug)]
enum BatchSubcommand {
    Show { batch_id: i64 },
    Delete { batch_id: i64 },
    /// Parsed columns and the fields they can map to.
    Mapping { batch_id: i64 },
    /// Map columns to dashboard fields.
    Map {
        batch_id: i64,
        /// `column=Field`, repeatable; `Field` is e.g. `Age`, `Region` or `None`.
        #[arg(long = "column", short = 'c', required = true)]
        columns: Vec<String>,
    },
}

#[derive(Args, Debug)]
struct MetricsArgs {
    #[arg(long)]
    dataset_id: i64,
    #[arg(long, default_value_t = DEFAULT_METRICS_MONTHS)]
    months: u32,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let level = if cli.verbose { LevelFilter::DEBUG } else { LevelFilter::WARN };
    tracing_subscriber::fmt().with_writer(std::io::stderr).with_max_level(level).init();

    let config = load_config(cli.base_url, cli.credentials)?;
    let credentials: Arc<dyn CredentialStore> = Arc::new(FileCredentialStore::new(config.credentials_path.clone()));
    let provider = identity_provider(&credentials);
    let app = AppState::new(&config, credentials, provider, Arc::new(Router::new()))?;

    let mut mounted = Bootstrap::mount(&app);
    mounted.ready().await;

    let result = run(&app, cli.command).await;
    mounted.unmount();
    result
}

fn load_config(base_url: Option<String>, credentials: Option<PathBuf>) -> Result<DashboardConfig, CliError> {
    let mut config = DashboardConfig::from_env()?;
    if let Some(url) = base_url {
        config.api_base_url = url.trim().trim_end_matches('/').to_owned();
    }
    if let Some(path) = credentials {
        config.credentials_path = path;
    }
    Ok(config)
}

fn identity_provider(credentials: &Arc<dyn CredentialStore>) -> Arc<dyn IdentityProvider> {
    let prompt: DevicePrompt = Arc::new(|code: &DeviceCode| {
        eprintln!("To sign in, visit {} and enter code {}", code.verification_url, code.user_code);
    });
    match GoogleIdentityProvider::from_env(prompt) {
        Ok(provider) => Arc::new(provider.with_credentials(credentials.clone())),
        Err(e) => {
            tracing::debug!(error = %e, "google sign-in unavailable");
            Arc::new(DisabledIdentityProvider::new())
        }
    }
}

async fn run(app: &AppState, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login => {
            let user = app.auth.sign_in_with_google().await?;
            print_json(&serde_json::to_value(user)?)
        }
        Command::Logout => {
            app.auth.logout().await;
            println!("signed out");
            Ok(())
        }
        Command::Status => print_status(app),
        Command::Route { location } => {
            let decision = app.router.navigate(&location, &app.store.snapshot());
            let (action, route) = match decision {
                RouteDecision::Loading => ("loading", Route::resolve(&location)),
                RouteDecision::Redirect(route) => ("redirect", route),
                RouteDecision::Render(route) => ("render", route),
            };
            print_json(&json!({ "decision": action, "route": route.path() }))
        }
        Command::Api(api) => run_api(app, api).await,
        Command::Datasets => {
            let ids = app.dashboard().my_datasets().await?;
            print_json(&serde_json::to_value(ids)?)
        }
        Command::Dataset(dataset) => run_dataset(app, dataset).await,
        Command::History(args) => {
            let query = HistoryQuery { dataset_id: args.dataset_id, limit: args.limit, offset: args.offset };
            let history = app.dashboard().upload_history(query).await?;
            print_json(&serde_json::to_value(history)?)
        }
        Command::Upload(args) => {
            let contents = std::fs::read(&args.file).map_err(|source| CliError::ReadFile { path: args.file.clone(), source })?;
            let filename = args
                .file
                .file_name()
                .map_or_else(|| "upload.csv".to_owned(), |name| name.to_string_lossy().into_owned());
            let receipt = app.dashboard().upload_csv(args.dataset_id, &filename, contents).await?;
            print_json(&receipt)
        }
        Command::Batch(batch) => run_batch(app, batch).await,
        Command::Metrics(args) => {
            let metrics = app.dashboard().all_metrics(args.dataset_id, args.months).await?;
            print_json(&serde_json::to_value(metrics)?)
        }
    }
}

fn print_status(app: &AppState) -> Result<(), CliError> {
    let state = app.store.snapshot();
    print_json(&json!({
        "authenticated": state.is_authenticated(),
        "fullyAuthenticated": state.is_fully_authenticated(),
        "loading": state.loading,
        "identityUser": state.identity_user,
        "backendUser": state.backend_user,
        "error": state.error,
    }))
}

async fn run_api(app: &AppState, api: ApiCommand) -> Result<(), CliError> {
    match api.command {
        ApiSubcommand::Get { path, query } => {
            let mut request = ApiRequest::get(path);
            for pair in query {
                let (key, value) = parse_query_pair(&pair)?;
                request = request.query(key, value);
            }
            let response = app.api.send(request).await?;
            let body: Value = response.json()?;
            print_json(&body)
        }
    }
}

async fn run_dataset(app: &AppState, dataset: DatasetCommand) -> Result<(), CliError> {
    match dataset.command {
        DatasetSubcommand::Create { name, description } => {
            let created = app.dashboard().create_dataset(&CreateDatasetRequest { name, description }).await?;
            print_json(&serde_json::to_value(created)?)
        }
        DatasetSubcommand::Delete { dataset_id } => {
            app.dashboard().delete_dataset(dataset_id).await?;
            println!("deleted dataset {dataset_id}");
            Ok(())
        }
    }
}

async fn run_batch(app: &AppState, batch: BatchCommand) -> Result<(), CliError> {
    match batch.command {
        BatchSubcommand::Show { batch_id } => {
            let details = app.dashboard().batch_details(batch_id).await?;
            print_json(&serde_json::to_value(details)?)
        }
        BatchSubcommand::Delete { batch_id } => {
            app.dashboard().delete_batch(batch_id).await?;
            println!("deleted batch {batch_id}");
            Ok(())
        }
        BatchSubcommand::Mapping { batch_id } => {
            let info = app.dashboard().mapping_info(batch_id).await?;
            print_json(&serde_json::to_value(info)?)
        }
        BatchSubcommand::Map { batch_id, columns } => {
            let mappings = columns.iter().map(|pair| parse_mapping(pair)).collect::<Result<Vec<_>, _>>()?;
            app.dashboard().update_mappings(&UpsertMappingsRequest { batch_id, mappings }).await?;
            println!("updated mappings for batch {batch_id}");
            Ok(())
        }
    }
}

fn parse_mapping(pair: &str) -> Result<ColumnMapping, CliError> {
    let invalid = || CliError::InvalidMapping(pair.to_owned());
    let (column, field) = pair.rsplit_once('=').ok_or_else(invalid)?;
    if column.is_empty() {
        return Err(invalid());
    }
    let system_field = field.parse::<SystemField>().map_err(|_| invalid())?;
    Ok(ColumnMapping { source_column: column.to_owned(), system_field })
}

fn parse_query_pair(pair: &str) -> Result<(String, String), CliError> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(CliError::InvalidQuery(pair.to_owned())),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_pairs_split_on_first_equals() {
        assert_eq!(parse_query_pair("datasetId=5").unwrap(), ("datasetId".into(), "5".into()));
        assert_eq!(parse_query_pair("q=a=b").unwrap(), ("q".into(), "a=b".into()));
        assert!(matches!(parse_query_pair("novalue"), Err(CliError::InvalidQuery(_))));
        assert!(matches!(parse_query_pair("=5"), Err(CliError::InvalidQuery(_))));
    }

    #[test]
    fn mappings_parse_column_and_field() {
        let mapping = parse_mapping("order total=OrderAmount").unwrap();
        assert_eq!(mapping.source_column, "order total");
        assert_eq!(mapping.system_field, SystemField::OrderAmount);
        assert_eq!(parse_mapping("notes=none").unwrap().system_field, SystemField::None);
        assert!(matches!(parse_mapping("age"), Err(CliError::InvalidMapping(_))));
        assert!(matches!(parse_mapping("=Age"), Err(CliError::InvalidMapping(_))));
        assert!(matches!(parse_mapping("age=Salary"), Err(CliError::InvalidMapping(_))));
    }

    #[test]
    fn cli_parses_history_defaults() {
        let cli = Cli::try_parse_from(["dashboard-cli", "history", "--dataset-id", "5"]).unwrap();
        match cli.command {
            Command::History(args) => {
                assert_eq!(args.dataset_id, 5);
                assert_eq!(args.limit, DEFAULT_HISTORY_LIMIT);
                assert_eq!(args.offset, 0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_parses_repeated_api_queries() {
        let cli = Cli::try_parse_from(["dashboard-cli", "api", "get", "/uploads/history", "-q", "datasetId=5", "-q", "limit=2"])
            .unwrap();
        match cli.command {
            Command::Api(ApiCommand { command: ApiSubcommand::Get { path, query } }) => {
                assert_eq!(path, "/uploads/history");
                assert_eq!(query, vec!["datasetId=5", "limit=2"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
