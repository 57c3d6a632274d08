use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

mod auth_store;
mod backend;
mod commands;
mod error;
mod gateway;
mod images;
#[cfg(test)]
mod memory_backend;
mod posts_store;
mod session_store;
mod supabase;
mod types;

use crate::{
    commands::{format_post, App, ComposeOutcome, SignUpOutcome},
    gateway::Gateway,
    session_store::FileSessionStore,
    supabase::{SupabaseClient, SupabaseConfig},
};

#[derive(Parser)]
#[command(name = "postboard")]
#[command(about = "Share short text and image posts to a shared feed")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[arg(long, env = "SUPABASE_URL")]
    supabase_url: String,

    #[arg(long, env = "SUPABASE_ANON_KEY", hide_env_values = true)]
    supabase_anon_key: String,

    #[arg(
        long,
        env = "POSTBOARD_SESSION_FILE",
        default_value = ".postboard-session.json"
    )]
    session_file: PathBuf,

    /// How long sign-up waits for a server-side confirm before signing in
    #[arg(long, env = "POSTBOARD_CONFIRM_DELAY_MS", default_value_t = 500)]
    confirm_delay_ms: u64,
}

#[derive(Subcommand)]
enum Command {
    /// Create an account and its profile
    SignUp {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        username: String,
    },
    /// Sign in with email and password
    SignIn {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Sign out and forget the stored session
    SignOut,
    /// Show the shared feed, newest first
    Feed,
    /// Show your profile and your posts
    Whoami,
    /// Share a post
    Post {
        #[arg(default_value = "")]
        content: String,
        #[arg(long)]
        image: Option<PathBuf>,
    },
    /// Delete one of your posts
    Delete { post_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
    dotenvy::dotenv().ok();

    let args = Args::parse();

    if args.supabase_url.trim().is_empty() || args.supabase_anon_key.trim().is_empty() {
        bail!("SUPABASE_URL and SUPABASE_ANON_KEY must be set");
    }

    let sessions = Arc::new(FileSessionStore::new(&args.session_file));
    let backend = Arc::new(SupabaseClient::new(
        SupabaseConfig {
            url: args.supabase_url.clone(),
            anon_key: args.supabase_anon_key.clone(),
        },
        sessions,
    )?);
    debug!("Using backend at {}", args.supabase_url);

    let gateway =
        Gateway::new(backend).with_confirm_delay(Duration::from_millis(args.confirm_delay_ms));
    let app = App::start(Arc::new(gateway)).await;
    let outcome = run(&app, args.command).await;
    app.shutdown().await;
    outcome
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::SignUp {
            email,
            password,
            username,
        } => match app.sign_up(&email, &password, &username).await? {
            SignUpOutcome::SignedIn(user) => {
                println!("Welcome, {}! You are signed in.", user.display_name());
            }
            SignUpOutcome::PendingConfirmation => {
                println!("Check your inbox to verify your email, then sign in.");
            }
        },
        Command::SignIn { email, password } => {
            let user = app.sign_in(&email, &password).await?;
            println!("Signed in as {}", user.display_name());
        }
        Command::SignOut => {
            app.sign_out().await?;
            println!("Signed out");
        }
        Command::Feed => {
            let view = app.feed().await;
            if let Some(message) = view.error {
                bail!(message);
            }
            if view.posts.is_empty() {
                println!("No posts yet. Share your first post and inspire the community!");
            }
            for post in &view.posts {
                println!("{}\n", format_post(post));
            }
        }
        Command::Whoami => {
            let view = app.account().await?;
            match &view.profile {
                Some(profile) => {
                    println!("{} <{}>", profile.username, profile.email);
                    if let Some(bio) = &profile.bio {
                        println!("{}", bio);
                    }
                    if let Some(avatar) = &profile.avatar_url {
                        println!("avatar: {}", avatar);
                    }
                }
                None => println!("{} (no profile)", view.user.display_name()),
            }
            if let Some(message) = view.error {
                bail!(message);
            }
            println!("{} post(s)\n", view.posts.len());
            for post in &view.posts {
                println!("{}\n", format_post(post));
            }
        }
        Command::Post { content, image } => match app.compose(&content, image.as_deref()).await {
            ComposeOutcome::Shared => println!("Posted"),
            ComposeOutcome::SharedWithWarning(message) => {
                println!("Posted");
                warn!("{}", message);
            }
            ComposeOutcome::Empty => println!("Nothing to post"),
            ComposeOutcome::NotSignedIn => bail!("Sign in before posting"),
            ComposeOutcome::Failed(message) => bail!(message),
        },
        Command::Delete { post_id } => {
            app.delete(&post_id).await?;
            println!("Deleted {}", post_id);
        }
    }
    Ok(())
}
