use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sheetsync_augment::PgAugmentationStore;
use sheetsync_core::ResourceId;
use sheetsync_storage::{SheetsApiUpstream, UpstreamConfig, UpstreamSource};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sheetsync")]
#[command(about = "Live-sync multiplexer for shared spreadsheet resources")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the websocket and HTTP server.
    Serve,
    /// Read one resource from upstream and print its raw snapshot as JSON.
    Fetch {
        #[arg(long)]
        resource: String,
    },
    /// Apply augmentation store migrations to DATABASE_URL.
    Migrate,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sheetsync=info,tower_http=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            sheetsync_web::serve_from_env().await?;
        }
        Commands::Fetch { resource } => {
            let upstream = SheetsApiUpstream::new(&UpstreamConfig::from_env())?;
            let resource_id = ResourceId::from(resource);
            let snapshot = upstream
                .read(&resource_id)
                .await
                .with_context(|| format!("failed to read resource {resource_id}"))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::Migrate => {
            let url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set to migrate")?;
            let store = PgAugmentationStore::connect(&url)
                .await
                .context("failed to connect to augmentation store")?;
            store.migrate().await.context("failed to apply migrations")?;
            info!("augmentation store migrations applied");
        }
    }

    Ok(())
}
