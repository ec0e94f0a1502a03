mod api;
mod auth;
mod cli;
mod config;
mod guard;
mod http;
mod journal;
mod session;
mod storage;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::cell::RefCell;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "uniportal",
    about = "Command-line client for the university ERP portal"
)]
pub struct Args {
    #[arg(long, env = "UNIPORTAL_API_BASE", help = "Backend API base URL")]
    pub api_base: Option<String>,

    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Session file path")]
    pub session_file: Option<PathBuf>,

    #[arg(long, help = "Keep the session in memory only (nothing is persisted)")]
    pub ephemeral: bool,

    #[arg(long, help = "Debug output (print HTTP details and settings)")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Sign in and store the session
    Login {
        #[arg(short, long)]
        username: String,
        #[arg(long, env = "UNIPORTAL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long, default_value = "admin", help = "Portal: student, institute, admin")]
        portal: String,
    },
    /// Sign out and remove the stored session
    Logout,
    /// Show the current session
    Status,
    /// GET a backend path with the session's credential
    Get {
        path: String,
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
        headers: Vec<String>,
    },
    /// Send an arbitrary request with the session's credential
    Request {
        method: String,
        path: String,
        #[arg(short, long, help = "Request body (JSON)")]
        data: Option<String>,
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
        headers: Vec<String>,
    },
    /// Open a portal view if the session's role allows it
    Open { view: String },
    /// List portal views and who may open them
    Views {
        #[arg(long, help = "Only views for this role (id or name)")]
        role: Option<String>,
    },
    /// Request student portal access
    Register {
        #[arg(long)]
        enrollment_number: String,
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        full_name: String,
        #[arg(long, env = "UNIPORTAL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Ask for a password reset link
    ForgotPassword { email: String },
    /// Set a new password with a reset token
    ResetPassword {
        token: String,
        #[arg(long, env = "UNIPORTAL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Change the signed-in user's password
    ChangePassword {
        #[arg(long, env = "UNIPORTAL_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Print the effective configuration
    Config,
    /// Interactive shell (the default)
    Shell,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.debug);

    // Load configuration
    let mut cfg = if let Some(config_path) = &args.config {
        config::Config::load_from(config_path)?
    } else {
        config::Config::load()?
    };

    // CLI and environment take priority over files
    if let Some(api_base) = &args.api_base {
        cfg.api_base = Some(api_base.clone());
    }
    if let Some(session_file) = &args.session_file {
        cfg.session.path = Some(session_file.clone());
    }

    if let Err(errors) = cfg.validate() {
        let details: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(anyhow!("Invalid configuration:\n  {}", details.join("\n  ")));
    }

    if args.debug {
        eprintln!("[DEBUG] API base: {}", cfg.api_base());
        if args.ephemeral {
            eprintln!("[DEBUG] Session: in memory");
        } else {
            eprintln!("[DEBUG] Session file: {}", cfg.session_path().display());
        }
        eprintln!("[DEBUG] Recheck expiry on fetch: {}", cfg.recheck_on_fetch());
    }

    let storage: Box<dyn storage::KeyValueStorage> = if args.ephemeral {
        Box::new(storage::MemoryStorage::new())
    } else {
        Box::new(storage::FileStorage::new(&cfg.session_path()))
    };

    let run_id = uuid::Uuid::new_v4().to_string();
    let journal = match cfg.journal_path() {
        Some(path) => match journal::Journal::open(&path, &run_id) {
            Ok(journal) => Some(journal),
            Err(e) => {
                tracing::warn!(error = %e, "Journal disabled");
                None
            }
        },
        None => None,
    };

    let gateway = auth::AuthGateway::new(
        session::SessionStore::new(storage, cfg.storage_keys()),
        http::UreqTransport::new(cfg.timeout()),
        session::SystemClock,
        auth::GatewayOptions {
            recheck_on_fetch: cfg.recheck_on_fetch(),
            journal,
        },
    );

    let ctx = cli::Context {
        api: api::PortalApi::new(&cfg.api_base()),
        guard: guard::RouteGuard::new(&cfg.entry_point()),
        gateway: RefCell::new(gateway),
        ephemeral: args.ephemeral,
        config: cfg,
        run_id,
    };

    match args.command {
        Some(Command::Shell) | None => cli::run_repl(ctx),
        Some(command) => cli::run_command(&ctx, command),
    }
}
