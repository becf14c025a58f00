use autoposter_tiktok::callback::CallbackServer;
use autoposter_tiktok::credentials::{
    self, Credential, CredentialStore, JsonFileCredentialStore, SubjectId,
};
use autoposter_tiktok::publish_log::JsonLinesPublishLog;
use autoposter_tiktok::{
    OAuthManager, OAuthStateStore, Publisher, TikTokConfig, publish_and_record,
    publish_for_subject,
};
use clap::{Parser, Subcommand};
use eyre::Context;
use jiff::Timestamp;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Publish videos to TikTok from the command line.
///
/// OAuth settings come from `TIKTOK_CLIENT_KEY`, `TIKTOK_CLIENT_SECRET`, and
/// `TIKTOK_REDIRECT_URI`; `TIKTOK_ACCESS_TOKEN` is used when no subject or token is given.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Where linked TikTok credentials are kept.
    #[arg(long, global = true, default_value = "tokens.json")]
    credentials: PathBuf,

    /// Where publish attempts are recorded, one JSON object per line.
    #[arg(long, global = true, default_value = "posts.jsonl")]
    log: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Link a TikTok account to a subject through the browser.
    Login {
        #[arg(long)]
        subject: i64,
    },
    /// Upload a video and post it.
    Publish {
        file: PathBuf,
        /// Use (and refresh if needed) the credential stored for this subject.
        #[arg(long, conflicts_with = "access_token")]
        subject: Option<i64>,
        #[arg(long)]
        access_token: Option<String>,
    },
    /// Check on a publish job once.
    Status {
        publish_id: String,
        #[arg(long)]
        subject: Option<i64>,
    },
    /// Refresh a subject's stored credential now.
    Refresh {
        #[arg(long)]
        subject: i64,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_ansi(std::io::stdout().is_terminal())
        .init();

    let cli = Cli::parse();

    let config = TikTokConfig::from_env().context("load TikTok configuration")?;
    let http = config.http_client()?;
    let publisher = Publisher::new(&config, http.clone());
    let oauth = OAuthManager::new(config, http);
    let store = JsonFileCredentialStore::new(&cli.credentials);

    match cli.command {
        Command::Login { subject } => login(&oauth, &store, SubjectId(subject)).await?,
        Command::Publish {
            file,
            subject,
            access_token,
        } => {
            let log = JsonLinesPublishLog::new(&cli.log);
            let outcome = match subject {
                Some(subject) => {
                    publish_for_subject(
                        &publisher,
                        &oauth,
                        &store,
                        &log,
                        SubjectId(subject),
                        &file,
                    )
                    .await
                }
                None => {
                    publish_and_record(&publisher, &log, None, &file, access_token.as_deref())
                        .await
                }
            }
            .with_context(|| format!("publish {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Status {
            publish_id,
            subject,
        } => {
            let token = match subject {
                Some(subject) => Some(
                    credentials::load_fresh_credential(&store, &oauth, SubjectId(subject))
                        .await?
                        .access_token,
                ),
                None => None,
            };
            let status = publisher
                .fetch_status(&publish_id, token.as_ref().map(|t| t.secret().as_str()))
                .await
                .with_context(|| format!("fetch status of {publish_id}"))?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Refresh { subject } => {
            let subject = SubjectId(subject);
            let credential = store
                .load(subject)
                .await?
                .ok_or_else(|| eyre::eyre!("subject {subject} has no linked TikTok account"))?;
            let refresh_token = credential.refresh_token.clone().ok_or_else(|| {
                eyre::eyre!("subject {subject} has no refresh token; run `login` again")
            })?;
            let refreshed =
                credentials::refresh_credential(&store, &oauth, credential, refresh_token).await?;
            match refreshed.expires_at {
                Some(expires_at) => eprintln!("refreshed; access token valid until {expires_at}"),
                None => eprintln!("refreshed"),
            }
        }
    }

    Ok(())
}

async fn login(
    oauth: &OAuthManager,
    store: &JsonFileCredentialStore,
    subject: SubjectId,
) -> eyre::Result<()> {
    let redirect_uri = oauth
        .config()
        .redirect_uri
        .clone()
        .ok_or_else(|| eyre::eyre!("TIKTOK_REDIRECT_URI must be set to log in"))?;

    let states = Arc::new(OAuthStateStore::new(oauth.config().state_ttl));
    let sweeper = Arc::clone(&states).spawn_sweeper(Duration::from_secs(60));

    // listen before sending the user off so the redirect cannot beat us
    let server = CallbackServer::bind(&redirect_uri).await?;
    let (url, state) = oauth.authorization_url()?;
    states.remember(&state, subject);

    eprintln!("Opening {url}");
    if let Err(e) = webbrowser::open(url.as_str()) {
        tracing::warn!(error = %e, "could not open browser");
        eprintln!("Visit the URL above to authorize access.");
    }

    let result = server.wait_for_authorization(Arc::clone(&states)).await;
    sweeper.abort();
    let (subject, code) = result.context("wait for TikTok authorization")?;

    let bundle = oauth
        .exchange_code(&code)
        .await
        .context("exchange authorization code")?;
    let open_id = bundle.open_id.clone();
    store
        .save(Credential::from_token_bundle(subject, bundle, Timestamp::now()))
        .await?;

    tracing::info!(%subject, ?open_id, "linked TikTok account");
    eprintln!("TikTok account linked for subject {subject}");
    Ok(())
}
