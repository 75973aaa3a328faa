use std::sync::{Arc, Mutex, PoisonError};

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tratios_session::{
    ApiRequest, ConfigError, ExpiryNotice, GuardDecision, LoginOutcome, Navigator, OtpProof, Redirect,
    SessionConfig, SessionContext, SessionError, SessionNotice, TransportError,
};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("http client setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("{} ({})", .0, .0.error_code())]
    Session(#[from] SessionError),
    #[error("not signed in; run `tratios login` first")]
    NotSignedIn,
    #[error("pass exactly one of --code or --backup-code")]
    MissingOtpProof,
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "tratios", about = "Tratios account session CLI")]
struct Cli {
    /// Path of the current screen, used to decide whether an expiry interrupts.
    #[arg(long, env = "TRATIOS_CURRENT_PATH", default_value = "/cuenta")]
    current_path: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with email and password.
    Login(LoginArgs),
    /// Complete a pending second-factor challenge.
    Otp(OtpArgs),
    /// Drop the stored session.
    Logout,
    /// Show the stored session and its validity.
    Status,
    /// Fetch the profile from the server.
    Whoami,
    /// Exchange the refresh token for a new session now.
    Refresh,
    /// Authenticated GET against the API.
    Get { path: String },
    /// Evaluate a route guard for a navigation.
    Guard {
        url: String,
        #[arg(long, default_value_t = false)]
        admin: bool,
    },
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[arg(long, env = "TRATIOS_EMAIL")]
    email: String,
    #[arg(long, env = "TRATIOS_PASSWORD", hide_env_values = true)]
    password: String,
}

#[derive(Args, Debug)]
struct OtpArgs {
    #[arg(long)]
    challenge: String,
    #[arg(long, conflicts_with = "backup_code")]
    code: Option<String>,
    #[arg(long)]
    backup_code: Option<String>,
}

// =============================================================================
// TERMINAL INTERRUPTIONS
// =============================================================================

/// Tracks a virtual current path and prints redirects instead of routing.
struct TerminalNavigator {
    current: Mutex<String>,
}

#[async_trait::async_trait]
impl Navigator for TerminalNavigator {
    fn current_path(&self) -> String {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn navigate(&self, redirect: Redirect) -> Result<(), String> {
        let url = redirect.to_url();
        eprintln!("-> {url}");
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = redirect.path;
        Ok(())
    }
}

struct TerminalNotice;

#[async_trait::async_trait]
impl SessionNotice for TerminalNotice {
    async fn session_expired(&self, notice: ExpiryNotice) {
        eprintln!("{}: {}", notice.title, notice.message);
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), CliError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let config = SessionConfig::from_env()?;
    let navigator = Arc::new(TerminalNavigator { current: Mutex::new(cli.current_path) });
    let ctx = SessionContext::from_config(config, navigator, Arc::new(TerminalNotice))?;

    let outcome = ctx.bootstrap().run().await;
    tracing::debug!(?outcome, "bootstrap finished");

    match cli.command {
        Command::Login(args) => run_login(&ctx, args).await,
        Command::Otp(args) => run_otp(&ctx, args).await,
        Command::Logout => {
            ctx.auth().logout();
            println!("signed out");
            Ok(())
        }
        Command::Status => run_status(&ctx),
        Command::Whoami => {
            let user = ctx.auth().refresh_profile().await?;
            print_json(&serde_json::to_value(user)?)
        }
        Command::Refresh => run_refresh(&ctx).await,
        Command::Get { path } => {
            let response = ctx.send(ApiRequest::get(path)).await?;
            eprintln!("HTTP {}", response.status);
            print_json(&response.body)
        }
        Command::Guard { url, admin } => run_guard(&ctx, &url, admin).await,
    }
}

async fn run_login(ctx: &SessionContext, args: LoginArgs) -> Result<(), CliError> {
    match ctx.auth().login(&args.email, &args.password).await? {
        LoginOutcome::Authenticated(session) => {
            println!("signed in as {} ({})", session.user.name, session.user.role);
        }
        LoginOutcome::OtpRequired(challenge) => {
            println!("second factor required ({})", challenge.otp_methods.join(", "));
            println!("run: tratios otp --challenge {} --code <CODE>", challenge.challenge_token);
        }
    }
    Ok(())
}

async fn run_otp(ctx: &SessionContext, args: OtpArgs) -> Result<(), CliError> {
    let proof = match (args.code, args.backup_code) {
        (Some(code), None) => OtpProof::Code(code),
        (None, Some(code)) => OtpProof::BackupCode(code),
        _ => return Err(CliError::MissingOtpProof),
    };
    let session = ctx.auth().complete_otp(&args.challenge, &proof).await?;
    println!("signed in as {} ({})", session.user.name, session.user.role);
    Ok(())
}

fn run_status(ctx: &SessionContext) -> Result<(), CliError> {
    let Some(session) = ctx.store().get() else {
        return Err(CliError::NotSignedIn);
    };
    let remaining_secs = (session.expires_at - ctx.store().now_ms()) / 1000;
    let status = serde_json::json!({
        "user": session.user.email,
        "role": session.user.role,
        "expires_at": session.expires_at,
        "expires_in_secs": remaining_secs,
        "valid": ctx.store().is_valid(ctx.config().buffers.default_ms),
        "refreshable": session.refresh_token.is_some(),
    });
    print_json(&status)
}

async fn run_refresh(ctx: &SessionContext) -> Result<(), CliError> {
    let Some(token) = ctx.store().refresh_token() else {
        return Err(CliError::NotSignedIn);
    };
    let session = ctx.refresh().refresh(&token).await?;
    println!("session renewed until {}", session.expires_at);
    Ok(())
}

async fn run_guard(ctx: &SessionContext, url: &str, admin: bool) -> Result<(), CliError> {
    let decision = if admin {
        ctx.guards().admin_guard(url).await
    } else {
        ctx.guards().auth_guard(url).await
    };
    match decision {
        GuardDecision::Allow => println!("allow {url}"),
        GuardDecision::Redirect(redirect) => {
            println!("redirect {}", redirect.to_url());
            if let Some(notice) = redirect.notice {
                eprintln!("{}: {}", notice.title, notice.message);
            }
        }
    }
    Ok(())
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
