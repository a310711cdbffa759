use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use album_uploader::config::{self, Config};
use album_uploader::media::NoProbe;
use album_uploader::security::InputValidator;
use album_uploader::source::{self, FileSource, FileSourceOptions};
use album_uploader::uploader::{
    HttpBackend, HttpBackendConfig, Peer, ProgressTracker, Uploader, UploaderOptions,
};

/// Peer id the backend resolves to the sender's own chat
const SELF_PEER: &str = "me";

#[derive(Parser)]
#[command(name = "album-uploader", version, about = "Upload files to a chat in order, as albums or one by one")]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload files and directories to a chat
    Upload(UploadArgs),
    /// Inspect or change the stored configuration
    Config {
        #[command(subcommand)]
        sub: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Restore defaults, backing up the current file
    Reset,
    /// Store the API endpoint and optional token
    SetEndpoint {
        url: String,
        #[arg(long)]
        token: Option<String>,
    },
}

#[derive(Args)]
struct UploadArgs {
    /// Destination chat (username or numeric id); your own saved messages
    /// when omitted
    #[arg(long, default_value = SELF_PEER)]
    chat: String,

    /// Files or directories, uploaded in walk order
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// File extensions to skip
    #[arg(long)]
    exclude: Vec<String>,

    /// Send as albums instead of one message per file
    #[arg(long)]
    album: bool,

    #[arg(long)]
    max_album_size: Option<usize>,

    /// Send images as photos rather than documents
    #[arg(long)]
    photo: bool,

    /// Delete local files once they have been sent
    #[arg(long)]
    remove: bool,

    /// Files uploaded at the same time
    #[arg(long)]
    limit: Option<usize>,

    /// Parts uploaded at the same time per file
    #[arg(long)]
    threads: Option<usize>,

    #[arg(long)]
    caption_header: Option<String>,

    #[arg(long)]
    caption_body: Option<String>,

    #[arg(long)]
    caption_footer: Option<String>,
}

impl UploadArgs {
    /// Command line values take precedence over the config file for this run
    fn apply(&self, config: &mut Config) {
        config.as_album |= self.album;
        config.as_photo |= self.photo;
        config.remove |= self.remove;
        if let Some(n) = self.max_album_size {
            config.max_album_size = n;
        }
        if let Some(n) = self.limit {
            config.limit = n;
        }
        if let Some(n) = self.threads {
            config.threads = n;
        }
        config.excludes.extend(self.exclude.iter().cloned());
        if let Some(s) = &self.caption_header {
            config.caption.header = s.clone();
        }
        if let Some(s) = &self.caption_body {
            config.caption.body = s.clone();
        }
        if let Some(s) = &self.caption_footer {
            config.caption.footer = s.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Start permissive so config loading can report problems; the configured
    // level takes over once the file is read.
    let rust_log = std::env::var_os("RUST_LOG").is_some();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("trace")).init();
    if !rust_log {
        log::set_max_level(log::LevelFilter::Warn);
    }

    let mut cfg = config::read_config(cli.config.as_deref()).context("Failed to read configuration")?;
    if !rust_log {
        log::set_max_level(config_level(&cfg));
    }

    match cli.command {
        Commands::Config { sub } => run_config(sub, cli.config.as_deref(), cfg),
        Commands::Upload(args) => {
            args.apply(&mut cfg);
            config::validate_config(&cfg).context("Invalid upload settings")?;
            run_upload(args, cfg).await
        }
    }
}

fn config_level(cfg: &Config) -> log::LevelFilter {
    cfg.log_level.parse().unwrap_or(log::LevelFilter::Info)
}

fn run_config(
    sub: ConfigCommands,
    path: Option<&std::path::Path>,
    cfg: Config,
) -> anyhow::Result<()> {
    let shown = match sub {
        ConfigCommands::Show => cfg,
        ConfigCommands::Reset => config::reset_config(path)?,
        ConfigCommands::SetEndpoint { url, token } => {
            let updated = Config {
                endpoint: url.trim().trim_end_matches('/').to_string(),
                api_token: token.or(cfg.api_token.clone()),
                ..cfg
            };
            config::save_config(path, &updated)?;
            updated
        }
    };

    let mut redacted = shown;
    if redacted.api_token.is_some() {
        redacted.api_token = Some("***".to_string());
    }
    println!("{}", serde_json::to_string_pretty(&redacted)?);
    Ok(())
}

async fn run_upload(args: UploadArgs, cfg: Config) -> anyhow::Result<()> {
    InputValidator::validate_peer(&args.chat)?;
    for path in &args.paths {
        InputValidator::validate_file_path(&path.to_string_lossy())?;
    }

    let mut files = source::walk(&args.paths, &cfg.excludes, &NoProbe);
    files = source::filter_file_size(files, cfg.max_file_size_bytes());
    if files.is_empty() {
        log::warn!("No files to upload");
        return Ok(());
    }
    source::build_captions(&mut files, cfg.as_album, &cfg.caption);
    log::info!("Found {} files to upload", files.len());

    let backend = Arc::new(HttpBackend::new(HttpBackendConfig::from(&cfg))?);
    let tracker = ProgressTracker::new(files.len());

    let uploader = Uploader::new(UploaderOptions {
        transfer: backend.clone(),
        registrar: backend.clone(),
        sender: backend,
        progress: Arc::new(tracker.clone()),
        threads: cfg.threads,
        limit: cfg.limit,
        as_album: cfg.as_album,
        max_album_size: cfg.max_album_size,
    })?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        log::info!("Received Ctrl+C, finishing completed uploads...");
        on_interrupt.cancel();
    })
    .context("Error setting Ctrl-C handler")?;

    let peer = Arc::new(Peer::new(args.chat.trim()));
    let mut items = FileSource::new(
        files,
        FileSourceOptions {
            peer: peer.clone(),
            as_photo: cfg.as_photo,
            remove: cfg.remove,
            delay: Duration::from_millis(cfg.item_delay_ms),
        },
    );

    match uploader.run(&cancel, &mut items, peer).await {
        Ok(summary) => {
            tracker.mark_session_completed();
            println!(
                "Session {}: sent {}, failed {}",
                summary.session_id, summary.sent, summary.failed
            );
            Ok(())
        }
        Err(e) => {
            if e.is_cancelled() {
                tracker.mark_session_cancelled();
            } else {
                tracker.mark_session_failed();
            }
            if let Some(progress) = tracker.snapshot() {
                for failed in &progress.failed_uploads {
                    eprintln!("failed: {} ({})", failed.file_path, failed.error);
                }
            }
            Err(e.into())
        }
    }
}
