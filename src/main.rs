use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::bail;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use metaphor::auth::{TokenGenerator, TokenOwner};
use metaphor::config::{EngineConfig, ServerConfig};
use metaphor::engine::{Engine, Parent, Principal, sweeper};
use metaphor::plan::Filter;
use metaphor::schema::USER_SPEC;
use metaphor::server::{AppState, create_router};
use metaphor::store::{SqliteStore, Store};
use metaphor::types::{TYPE, doc_id};

#[cfg(unix)]
fn set_restrictive_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to set permissions on {}: {e}", path.display());
    }
}

#[derive(Parser)]
#[command(name = "metaphor")]
#[command(about = "A schema-driven document server with calculated fields", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Administrative commands
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },

    /// Start the server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind to
        #[arg(long, short, default_value = "8080")]
        port: u16,

        /// Data directory for the database and engine settings
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum AdminCommands {
    /// Initialize the server (create database and admin token)
    Init {
        /// Data directory for the database and engine settings
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Also create a user with this username and print its token
        #[arg(long)]
        user: Option<String>,
    },

    /// Show schema and store statistics
    Info {
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

fn open_engine(config: &ServerConfig) -> anyhow::Result<Engine> {
    let store = SqliteStore::new(config.db_path())?;
    store.initialize()?;
    let engine_config = EngineConfig::load(&config.engine_config_path())?;
    Ok(Engine::open(Arc::new(store), engine_config)?)
}

fn print_token(label: &str, raw_token: &str) {
    println!();
    println!("========================================");
    println!("{label} (save this, it won't be shown again):");
    println!();
    println!("  {raw_token}");
    println!();
    println!("========================================");
    println!();
}

fn run_init(data_dir: PathBuf, user: Option<String>) -> anyhow::Result<()> {
    fs::create_dir_all(&data_dir)?;
    let config = ServerConfig {
        data_dir,
        ..ServerConfig::default()
    };
    let engine = open_engine(&config)?;
    let store = engine.store();

    let token_file = config.data_dir.join(".admin_token");

    if store.has_admin_token()? {
        bail!(
            "Server already initialized. Admin token exists at: {}",
            token_file.display()
        );
    }

    let generator = TokenGenerator::new();
    let (token, raw_token) = generator.issue(&TokenOwner::Admin, None)?;

    store.create_token(&token)?;
    fs::write(&token_file, &raw_token)?;

    #[cfg(unix)]
    set_restrictive_permissions(&token_file);

    print_token("Admin token", &raw_token);
    println!("Token also written to: {}", token_file.display());

    if let Some(username) = user {
        let ctx = engine.context(Principal::System);
        let mut fields = metaphor::types::Document::new();
        fields.insert("username".into(), json!(username));
        let doc = engine
            .updater(&ctx)
            .create_resource(USER_SPEC, &Parent::root("users"), fields)?;
        let Some(user_id) = doc_id(&doc) else {
            bail!("created user has no id");
        };
        let (token, raw_token) = generator.issue(&TokenOwner::User(user_id.clone()), None)?;
        store.create_token(&token)?;
        println!("Created user '{username}' ({})", user_id.encode());
        print_token("User token", &raw_token);
    }

    Ok(())
}

fn run_info(data_dir: PathBuf, as_json: bool) -> anyhow::Result<()> {
    let config = ServerConfig {
        data_dir,
        ..ServerConfig::default()
    };
    if !config.db_path().exists() {
        bail!("Server not initialized. Run 'metaphor admin init' first.");
    }
    let engine = open_engine(&config)?;
    let schema = engine.schema();
    let store = engine.store();

    let mut counts = serde_json::Map::new();
    for spec in schema.registry.specs() {
        if spec.name == metaphor::types::ROOT_SPEC {
            continue;
        }
        counts.insert(
            spec.name.clone(),
            json!(store.count(&Filter::eq(TYPE, spec.name.as_str()))?),
        );
    }
    let pending = store.list_updates(true)?.len();
    let calcs = schema.calcs.entries().count();

    if as_json {
        let info = json!({
            "schema": schema.id(),
            "calcs": calcs,
            "pending_updates": pending,
            "resources": counts,
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("Schema:          {}", schema.id());
        println!("Calcs:           {calcs}");
        println!("Pending updates: {pending}");
        for (spec, count) in &counts {
            println!("  {spec}: {count}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("metaphor=info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Admin { command } => match command {
            AdminCommands::Init { data_dir, user } => {
                run_init(data_dir, user)?;
            }
            AdminCommands::Info { data_dir, json } => {
                run_info(data_dir, json)?;
            }
        },
        Commands::Serve {
            host,
            port,
            data_dir,
        } => {
            let config = ServerConfig {
                host,
                port,
                data_dir,
            };

            let token_file = config.data_dir.join(".admin_token");
            if !token_file.exists() {
                bail!(
                    "Server not initialized. Run 'metaphor admin init' first to create the database and admin token."
                );
            }

            let engine = Arc::new(open_engine(&config)?);
            if !engine.store().has_admin_token()? {
                bail!(
                    "Server not initialized. Run 'metaphor admin init' first to create the database and admin token."
                );
            }

            info!("Admin token available at {}", token_file.display());
            info!(schema = %engine.schema().id(), "engine ready");

            let _sweeper = sweeper::spawn(Arc::clone(&engine));

            let state = Arc::new(AppState::new(engine));
            let app = create_router(state);
            let addr = config.socket_addr()?;

            info!("Starting server on {}", addr);

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }
    }

    Ok(())
}
