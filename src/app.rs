use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::cli::{
    Cli, Command, ConfigCommand, DebugTarget, TokensCommand, UploadCommand, VideosArgs,
};
use crate::client::{AuthenticatedClient, ClientConfig, ClientError};
use crate::config::{self, Config};
use crate::holo::{self, JobAccepted, UserInfo, Video};
use crate::session::{self, LoginCheck};
use crate::storage::{self, CredentialStore};

pub fn run(cli: Cli) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: cli.config.clone(),
        env_prefix: None,
    })
    .context("load config")?;

    let command = match cli.command {
        Command::Config(cmd) => return run_config(cmd, cli.config, &cfg),
        other => other,
    };

    let store = storage::Store::open(storage::Options {
        path: cfg.storage.path.clone(),
    })
    .context("open storage")?;
    let credentials = CredentialStore::new(Arc::new(store));

    let base_url = cli
        .base_url
        .clone()
        .unwrap_or_else(|| cfg.backend.base_url.clone());
    let http = AuthenticatedClient::new(
        credentials,
        ClientConfig {
            user_agent: cfg.backend.user_agent.clone(),
            base_url: Some(base_url),
            timeout: Some(cfg.backend.timeout),
            http_client: None,
        },
    )
    .context("build backend client")?;
    let api = Arc::new(holo::Client::new(Arc::new(http)));

    if command.needs_backend() && cfg.backend.fetch_remote_config && cli.base_url.is_none() {
        match api.apply_remote_config() {
            Ok(remote) => debug!(api_base_url = ?remote.api_base_url, "remote config loaded"),
            Err(err) => warn!(error = %err, "could not load backend config, using local base url"),
        }
    }

    let session = session::Manager::new(api);
    dispatch(&session, &cfg, cli.config, command)
}

fn dispatch(
    session: &session::Manager,
    cfg: &Config,
    config_file: Option<PathBuf>,
    command: Command,
) -> Result<()> {
    let api = session.api();
    match command {
        Command::Login { no_browser } => {
            let url = api.login_url()?;
            println!("Login URL: {url}");
            if !no_browser {
                if let Err(err) = webbrowser::open(url.as_str()) {
                    warn!(error = %err, "could not open a browser");
                }
            }
            println!("After the callback page loads, store its tokens with `holo tokens set <access> <refresh>`.");
        }
        Command::Logout => {
            session.logout()?;
            println!("Logged out.");
        }
        Command::Tokens(TokensCommand::Set { access, refresh }) => {
            if session.save_tokens(&access, &refresh)? {
                println!("Tokens saved.");
            } else {
                println!("Tokens saved, but no access token is stored.");
            }
            println!("{}", session.status_line());
        }
        Command::Tokens(TokensCommand::Clear) => {
            session.clear_tokens()?;
            println!("Tokens cleared.");
        }
        Command::Tokens(TokensCommand::Show) => {
            println!("{}", session.status_line());
            if let Some(subject) = api.http().credentials().subject_id() {
                println!("open_id={subject}");
            }
        }
        Command::Me => match session.check_login() {
            LoginCheck::NoToken => {
                println!("Not logged in. Run `holo login`, then `holo tokens set`.");
            }
            LoginCheck::Active(user) => {
                println!("Logged in.");
                print!("{}", render_user(&user));
            }
            LoginCheck::Expired(err) => {
                debug!(error = %err, "session check failed");
                println!("Session expired, please log in again.");
            }
        },
        Command::Videos(args) => run_videos(session, cfg, args)?,
        Command::Query { ids } => {
            let ids: Vec<String> = ids
                .iter()
                .map(String::as_str)
                .flat_map(holo::parse_video_ids)
                .collect();
            let result = session.query_videos(&ids)?;
            print_json(&result)?;
        }
        Command::Profile => print!("{}", render_user(&api.display_profile()?)),
        Command::CreatorInfo => print_json(&api.creator_info()?)?,
        Command::ClientToken => print_json(&api.client_token()?)?,
        Command::Debug { target } => {
            let value = match target {
                DebugTarget::Display => api.display_debug()?,
                DebugTarget::Content => api.content_debug()?,
            };
            print_json(&value)?;
        }
        Command::Upload(cmd) => {
            let accepted = match cmd {
                UploadCommand::File { path, mode } => api
                    .upload_file(&path, mode)
                    .with_context(|| format!("upload {}", path.display()))?,
                UploadCommand::Url { source_url, mode } => api
                    .upload_url(&source_url, mode)
                    .context("create pull-by-url job (the URL may not be whitelisted)")?,
            };
            report_job(&accepted)?;
        }
        Command::Status { job_id } => {
            let status = api.job_status(&job_id)?;
            print_json(&status)?;
            println!(
                "state: {}",
                status.status.state.as_deref().unwrap_or("unknown")
            );
        }
        Command::Publish {
            job_id,
            privacy,
            caption,
        } => {
            let response = api.publish(&job_id, privacy, caption.as_deref())?;
            print_json(&response)?;
            if response.result.ok {
                println!("Published ({privacy}).");
            } else {
                println!(
                    "Not published: {}",
                    response.result.reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        Command::Config(cmd) => run_config(cmd, config_file, cfg)?,
    }
    Ok(())
}

fn run_config(cmd: ConfigCommand, config_file: Option<PathBuf>, cfg: &Config) -> Result<()> {
    match cmd {
        ConfigCommand::Init { base_url } => {
            let path = config::save_backend(config_file, &base_url)?;
            println!("Wrote {}", path.display());
        }
        ConfigCommand::Show => {
            let rendered = serde_yaml::to_string(cfg).context("render config")?;
            print!("{rendered}");
        }
    }
    Ok(())
}

fn run_videos(session: &session::Manager, cfg: &Config, args: VideosArgs) -> Result<()> {
    let max_count = args.max_count.unwrap_or(cfg.videos.page_size);
    let resuming = args.cursor.is_some();
    session.resume_from(args.cursor);

    for page_no in 0..args.pages.max(1) {
        let first_page = page_no == 0 && !resuming;
        let page = match session.load_videos(first_page, max_count) {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(err) => {
                if let Some(ClientError::Unauthorized) = err.downcast_ref::<ClientError>() {
                    println!("Session expired, please log in again.");
                }
                return Err(err);
            }
        };
        if page.videos.is_empty() {
            println!("No videos.");
        }
        for video in &page.videos {
            println!("{}", render_video(video));
        }
        if session.state().next_cursor.is_none() {
            break;
        }
    }
    println!(
        "cursor: {}",
        session.state().next_cursor.as_deref().unwrap_or("-")
    );
    Ok(())
}

fn report_job(accepted: &JobAccepted) -> Result<()> {
    print_json(accepted)?;
    match accepted.job_id() {
        Some(id) => println!("job_id={id}"),
        None => println!("Request accepted, but the response carried no job id."),
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("render response")?;
    println!("{rendered}");
    Ok(())
}

pub fn render_user(user: &UserInfo) -> String {
    let text = |value: &Option<String>| {
        value
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("-")
            .to_string()
    };
    format!(
        "display_name: {}\nopen_id: {}\nprofile: {}\navatar: {}\nfollowers: {}  following: {}  likes: {}  videos: {}\n",
        text(&user.display_name),
        text(&user.open_id),
        text(&user.profile_deep_link),
        user.avatar().unwrap_or("-"),
        fmt_count(user.follower_count),
        fmt_count(user.following_count),
        fmt_count(user.likes_count),
        fmt_count(user.video_count),
    )
}

pub fn render_video(video: &Video) -> String {
    format!(
        "{}  {}  likes {} · comments {} · shares {} · views {}  {}",
        video.id.as_deref().unwrap_or("-"),
        video.display_title(),
        fmt_count(video.like_count),
        fmt_count(video.comment_count),
        fmt_count(video.share_count),
        fmt_count(video.view_count),
        video.link().unwrap_or("-"),
    )
}

/// Formats a count with thousands separators; `-` when absent.
pub fn fmt_count(value: Option<i64>) -> String {
    let Some(n) = value else {
        return "-".to_string();
    };
    let digits = n.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if n < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
