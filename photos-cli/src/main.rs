//! Photos CLI - administer and serve the photo index.

use anyhow::Result;
use clap::{Parser, Subcommand};
use photos_core::{OwnerId, PhotoId, Rgb, SurfaceId};
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_codes;
mod utils;

use exit_codes::ExitCode;

const EXIT_CODES_HELP: &str = "\
Exit codes:
  0   Success
  1   General error
  2   Invalid arguments
  65  Rejected input (validation, unknown photo, failed download)
  69  Store unavailable
  70  Integrity problem
  74  Bitmap could not be saved
  75  Photo is busy, retry later";

#[derive(Parser)]
#[command(name = "photos")]
#[command(author, version, about = "Downloadable, ownable photos on shared surfaces", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the index: render cycles and periodic sync until Ctrl-C
    Serve,

    /// Create a photo
    Create {
        /// Photo name
        #[arg(long, value_parser = utils::parse_name)]
        name: String,

        /// Palette name, #RRGGBB or r,g,b (random when omitted)
        #[arg(long)]
        color: Option<Rgb>,

        /// Owner id
        #[arg(long)]
        owner: Option<OwnerId>,
    },

    /// Give an owner a free photo with a random color
    Grant {
        #[arg(value_name = "OWNER")]
        owner: OwnerId,
    },

    /// Download an image into a photo
    Load {
        #[arg(value_name = "ID")]
        id: PhotoId,

        /// http(s) URL of the image
        #[arg(value_name = "URL")]
        url: String,

        /// Ignore the download size cap
        #[arg(long)]
        force: bool,
    },

    /// Rename a photo
    Rename {
        #[arg(value_name = "ID")]
        id: PhotoId,

        #[arg(value_name = "NAME", value_parser = utils::parse_name)]
        name: String,
    },

    /// Change a photo's color
    Recolor {
        #[arg(value_name = "ID")]
        id: PhotoId,

        /// Palette name, #RRGGBB or r,g,b
        #[arg(value_name = "COLOR")]
        color: Rgb,
    },

    /// Give a photo to another owner
    Transfer {
        #[arg(value_name = "ID")]
        id: PhotoId,

        #[arg(value_name = "OWNER")]
        owner: OwnerId,
    },

    /// Take a photo away from its owner
    Confiscate {
        #[arg(value_name = "ID")]
        id: PhotoId,
    },

    /// Move every photo of one owner to another (or to nobody)
    TransferAll {
        #[arg(value_name = "FROM")]
        from: OwnerId,

        /// Leave the photos unowned when omitted
        #[arg(value_name = "TO")]
        to: Option<OwnerId>,
    },

    /// Delete a photo
    Delete {
        #[arg(value_name = "ID")]
        id: PhotoId,
    },

    /// Show one photo
    Info {
        #[arg(value_name = "ID", required_unless_present = "surface")]
        id: Option<PhotoId>,

        /// Look the photo up by its surface instead
        #[arg(long, conflicts_with = "id")]
        surface: Option<i64>,
    },

    /// List the photos of an owner
    List {
        #[arg(value_name = "OWNER")]
        owner: OwnerId,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Find photos without a bitmap and mappings without a photo
    Prune {
        /// Delete what was found instead of only reporting it
        #[arg(long)]
        confirm: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let exit = match run(cli.command).await {
        Ok(()) => ExitCode::success(),
        Err(e) => ExitCode::from_anyhow(&e),
    };
    if let Some(message) = exit.message {
        eprintln!("Error: {message}");
    }
    std::process::exit(exit.code);
}

async fn run(command: Commands) -> Result<()> {
    use commands::{admin, photo, serve};

    match command {
        Commands::Serve => serve::execute().await,
        Commands::Create { name, color, owner } => photo::create(owner, name, color).await,
        Commands::Grant { owner } => photo::grant(owner).await,
        Commands::Load { id, url, force } => photo::load(id, url, force).await,
        Commands::Rename { id, name } => photo::rename(id, name).await,
        Commands::Recolor { id, color } => photo::recolor(id, color).await,
        Commands::Transfer { id, owner } => photo::transfer(id, owner).await,
        Commands::Confiscate { id } => photo::confiscate(id).await,
        Commands::Delete { id } => photo::delete(id).await,
        Commands::Info { id, surface } => photo::info(id, surface.map(SurfaceId)).await,
        Commands::List { owner, json } => photo::list(owner, json).await,
        Commands::TransferAll { from, to } => admin::transfer_all(from, to).await,
        Commands::Prune { confirm } => admin::prune(confirm).await,
    }
}
