use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "oidcflow")]
#[command(about = "oidcflow CLI: sign in to an OpenID Connect provider from the terminal")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Client configuration file (TOML)
    #[arg(short, long, global = true, env = "OIDCFLOW_CONFIG", default_value = "oidcflow.toml")]
    pub config: PathBuf,

    /// Configuration to use when the file defines several clients
    #[arg(long, global = true, env = "OIDCFLOW_CONFIG_ID")]
    pub config_id: Option<String>,

    /// Session store (defaults to ~/.oidcflow/store.json)
    #[arg(long, global = true, env = "OIDCFLOW_STORE")]
    pub store: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,
}

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start an interactive login and print the authorize URL
    Login(LoginArgs),
    /// Complete a login with the URL the browser was redirected to
    Callback(CallbackArgs),
    /// Renew the tokens with the refresh token grant
    Refresh,
    /// Show the authentication state of every configuration
    Status,
    /// Fetch the user info claims
    Userinfo,
    /// Log off
    Logout(LogoutArgs),
    /// Keep the session fresh and print engine events until interrupted
    Monitor(MonitorArgs),
}

#[derive(clap::Args)]
pub struct LoginArgs {
    /// `prompt` parameter (e.g. login, consent)
    #[arg(long)]
    pub prompt: Option<String>,
    /// Extra authorize parameters as key=value pairs
    #[arg(long = "param")]
    pub params: Vec<String>,
}

#[derive(clap::Args)]
pub struct CallbackArgs {
    /// Redirect URL including its query or fragment
    pub url: String,
}

#[derive(clap::Args)]
pub struct LogoutArgs {
    /// Revoke the refresh and access tokens first
    #[arg(long)]
    pub revoke: bool,
    /// Only clear the local session
    #[arg(long, conflicts_with = "revoke")]
    pub local: bool,
}

#[derive(clap::Args)]
pub struct MonitorArgs {
    /// Stop after this many seconds
    #[arg(long)]
    pub duration: Option<u64>,
}
