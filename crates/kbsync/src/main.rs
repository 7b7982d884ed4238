use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kbsync_core::config::{AppConfig, load_config};
use kbsync_core::endpoint::{ApiResponse, Collaborators, handle_request, ingest_payload};
use kbsync_core::files::FileBlobStore;
use kbsync_core::mirror::{HttpImageFetcher, ImageMirror};
use kbsync_core::runtime::{
    PathOverrides, ResolvedPaths, init_layout, normalize_path, resolve_paths,
};
use kbsync_core::settings::{Settings, SyncMode, encode_secret};
use kbsync_core::sqlite_store::{
    SqliteAliasStore, SqliteDocumentStore, SqliteSettingsStore, SqliteTermStore, open_connection,
    provision_document_type,
};
use kbsync_core::store::{KNOWLEDGE_BASE_TYPE, SettingsStore};

#[derive(Debug, Parser)]
#[command(
    name = "kbsync",
    version,
    about = "Synchronize CRM knowledge-base XML feeds into the content repository"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Create the runtime layout, database schema, and seeded settings")]
    Init,
    #[command(about = "Run the XML ingest endpoint")]
    Serve(ServeArgs),
    #[command(about = "Run one payload file through the full sync pipeline")]
    Import(ImportArgs),
    #[command(about = "Inspect or change the stored credential and sync mode")]
    Settings(SettingsArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    #[arg(long, value_name = "ADDR", help = "Listen address (overrides config)")]
    listen: Option<String>,
}

#[derive(Debug, Args)]
struct ImportArgs {
    file: PathBuf,
    #[arg(long, value_name = "MODE", help = "Override the stored sync mode for this run")]
    mode: Option<String>,
}

#[derive(Debug, Args)]
struct SettingsArgs {
    #[command(subcommand)]
    command: SettingsCommand,
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Show,
    #[command(name = "set-password")]
    SetPassword { value: String },
    #[command(name = "set-mode")]
    SetMode { value: String },
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let paths = resolve_paths(&PathOverrides {
        project_root: cli.project_root.clone(),
        data_dir: cli.data_dir.clone(),
        config: cli.config.clone(),
    })?;
    if cli.diagnostics {
        println!("[diagnostics]\n{}", paths.diagnostics());
    }

    match cli.command {
        Commands::Init => run_init(&paths),
        Commands::Serve(args) => run_serve(&paths, args),
        Commands::Import(args) => run_import(&paths, args),
        Commands::Settings(args) => run_settings(&paths, args),
    }
}

fn run_init(paths: &ResolvedPaths) -> Result<()> {
    let report = init_layout(paths)?;
    let connection = open_connection(&paths.db_path)?;
    provision_document_type(&connection, KNOWLEDGE_BASE_TYPE)?;
    drop(connection);
    let mut settings = SqliteSettingsStore::open(&paths.db_path)?;
    let seeded = settings.seed_defaults()?;

    println!("Initialized kbsync runtime layout");
    println!("project_root: {}", normalize_path(&paths.project_root));
    println!("data_dir: {}", normalize_path(&paths.data_dir));
    println!("db_path: {}", normalize_path(&paths.db_path));
    println!("files_dir: {}", normalize_path(&paths.files_dir));
    println!("config_path: {}", normalize_path(&paths.config_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("seeded_settings: {seeded}");
    Ok(())
}

fn run_settings(paths: &ResolvedPaths, args: SettingsArgs) -> Result<()> {
    let mut store = SqliteSettingsStore::open(&paths.db_path)?;
    match args.command {
        SettingsCommand::Show => match store.load()? {
            Some(settings) => {
                println!("mode: {}", settings.mode.as_str());
                println!("password: set");
            }
            None => println!("no settings stored; run `kbsync init` first"),
        },
        SettingsCommand::SetPassword { value } => {
            let mut settings = store.load()?.unwrap_or_else(Settings::seeded);
            settings.password_encoded = encode_secret(&value);
            store.save(&settings)?;
            println!("password updated");
        }
        SettingsCommand::SetMode { value } => {
            let mode = SyncMode::parse(&value)?;
            let mut settings = store.load()?.unwrap_or_else(Settings::seeded);
            settings.mode = mode;
            store.save(&settings)?;
            println!("mode set to {}", mode.as_str());
        }
    }
    Ok(())
}

fn run_import(paths: &ResolvedPaths, args: ImportArgs) -> Result<()> {
    let body = fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let config = load_config(&paths.config_path)?;

    let mut settings = SqliteSettingsStore::open(&paths.db_path)?;
    let stored = settings
        .load()?
        .context("no settings stored; run `kbsync init` first")?;
    let mode = match args.mode {
        Some(value) => SyncMode::parse(&value)?,
        None => stored.mode,
    };

    let mut documents = SqliteDocumentStore::open(&paths.db_path)?;
    let mut terms = SqliteTermStore::open(&paths.db_path)?;
    let mut aliases = SqliteAliasStore::open(&paths.db_path)?;
    let mut blobs = FileBlobStore::new(&paths.files_dir, config.files_prefix());

    let mut mirror_storage;
    let mirror = if mode.mirrors_images() {
        let fetcher = HttpImageFetcher::new(config.mirror_timeout_ms())?;
        mirror_storage = ImageMirror::new(
            Box::new(fetcher),
            Box::new(FileBlobStore::new(&paths.files_dir, config.files_prefix())),
            config.source_domain(),
        );
        Some(&mut mirror_storage)
    } else {
        None
    };

    let response = ingest_payload(
        &body,
        mode,
        &mut documents,
        &mut terms,
        &mut blobs,
        &mut aliases,
        mirror,
    );
    println!("status: {}", response.status);
    println!("{}", serde_json::to_string_pretty(&response.body)?);
    Ok(())
}

#[derive(Clone)]
struct AppState {
    paths: Arc<ResolvedPaths>,
    config: Arc<AppConfig>,
}

fn run_serve(paths: &ResolvedPaths, args: ServeArgs) -> Result<()> {
    let config = load_config(&paths.config_path)?;
    let listen_addr = args.listen.unwrap_or_else(|| config.listen_addr());
    let state = AppState {
        paths: Arc::new(paths.clone()),
        config: Arc::new(config),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(serve(listen_addr, state))
}

async fn serve(listen_addr: String, state: AppState) -> Result<()> {
    let app = Router::new()
        .route("/ingest/xml", post(ingest))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(listen_addr, "kbsync ingest endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server terminated")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for shutdown signal");
    }
}

async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string);

    // The whole pipeline is synchronous by design; keep it off the
    // async workers.
    let result =
        tokio::task::spawn_blocking(move || process_request(&state, auth_header.as_deref(), &body))
            .await;
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            error!("ingest task failed: {err}");
            ApiResponse {
                status: 500,
                body: json!({ "error": "internal error" }),
            }
        }
    };

    (
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        Json(response.body),
    )
}

fn process_request(state: &AppState, auth_header: Option<&str>, body: &[u8]) -> ApiResponse {
    match try_process(state, auth_header, body) {
        Ok(response) => response,
        Err(err) => {
            error!("request setup failed: {err:#}");
            ApiResponse {
                status: 500,
                body: json!({ "error": "internal error" }),
            }
        }
    }
}

fn try_process(state: &AppState, auth_header: Option<&str>, body: &[u8]) -> Result<ApiResponse> {
    let db_path = &state.paths.db_path;
    let mut documents = SqliteDocumentStore::open(db_path)?;
    let mut terms = SqliteTermStore::open(db_path)?;
    let mut aliases = SqliteAliasStore::open(db_path)?;
    let mut settings = SqliteSettingsStore::open(db_path)?;
    let mut blobs = FileBlobStore::new(&state.paths.files_dir, state.config.files_prefix());

    let fetcher = HttpImageFetcher::new(state.config.mirror_timeout_ms())?;
    let mut mirror = ImageMirror::new(
        Box::new(fetcher),
        Box::new(FileBlobStore::new(
            &state.paths.files_dir,
            state.config.files_prefix(),
        )),
        state.config.source_domain(),
    );

    Ok(handle_request(
        auth_header,
        body,
        Collaborators {
            documents: &mut documents,
            terms: &mut terms,
            blobs: &mut blobs,
            aliases: &mut aliases,
            settings: &mut settings,
            mirror: Some(&mut mirror),
        },
    ))
}
