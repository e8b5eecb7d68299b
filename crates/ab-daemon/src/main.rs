//! gitops-autobot daemon: wires config, clients, checkouts, the bot loop,
//! and the HTTP surface together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ab_changers::changemaker::ChangerRegistry;
use ab_changers::helm::HelmChangerFactory;
use ab_changers::helm_repo::HelmRepoLoader;
use ab_changers::shell::ShellChangerFactory;
use ab_changers::time::TimeChangerFactory;
use ab_core::cache::Cache;
use ab_core::checkout::Checkout;
use ab_core::config::AutobotConfig;
use ab_daemon::bot::GitopsBot;
use ab_daemon::creator::PrCreator;
use ab_daemon::http;
use ab_daemon::merger::PrMerger;
use ab_daemon::reviewer::PrReviewer;
use ab_daemon::shutdown::ShutdownSignal;
use ab_github::cached::CachedGithub;
use ab_github::client::GithubClient;
use ab_github::GithubApi;

/// Process-level knobs from the environment; the reconciliation config
/// itself lives in the YAML file.
struct ServiceConfig {
    listen_addr: String,
    log_level: String,
    config_file: String,
    cron_interval: Duration,
}

impl ServiceConfig {
    fn from_env() -> Self {
        Self {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8080"),
            log_level: env_or("LOG_LEVEL", "info"),
            config_file: env_or("GITOPS_CONFIG_FILE", "gitops-autobot.yaml"),
            cron_interval: Duration::from_secs(
                env_or("CRON_INTERVAL", "90").parse().unwrap_or(90),
            ),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}

#[tokio::main]
async fn main() -> Result<()> {
    let service = ServiceConfig::from_env();
    init_logging(&service.log_level);
    info!(config_file = %service.config_file, "gitops-autobot starting");

    let mut config = AutobotConfig::load(&service.config_file)
        .with_context(|| format!("unable to load config file {}", service.config_file))?;

    // Both identities share one cache, so a PR opened through the creator
    // invalidates the listing the reviewer reads.
    let cache = Arc::new(Cache::new());
    let creator_transport: Arc<dyn GithubApi> = Arc::new(
        GithubClient::from_config(&config.pr_creator)
            .await
            .context("unable to build pr creator client")?,
    );
    let creator_github: Arc<dyn GithubApi> =
        Arc::new(CachedGithub::new(creator_transport, Arc::clone(&cache)));
    let creator_identity = creator_github.current_user().await?;
    info!(login = %creator_identity.login, "pr creator authenticated");

    let reviewer_github: Option<Arc<dyn GithubApi>> = match &config.pr_reviewer {
        Some(reviewer_cfg) => {
            let transport: Arc<dyn GithubApi> = Arc::new(
                GithubClient::from_config(reviewer_cfg)
                    .await
                    .context("unable to build pr reviewer client")?,
            );
            let cached: Arc<dyn GithubApi> =
                Arc::new(CachedGithub::new(transport, Arc::clone(&cache)));
            let identity = cached.current_user().await?;
            info!(login = %identity.login, "pr reviewer authenticated");
            Some(cached)
        }
        None => None,
    };

    // Blank tracked branches default to the remote's default branch.
    for repo in &mut config.repos {
        if repo.branch.is_empty() {
            repo.branch = creator_github
                .repository_info(&repo.owner, &repo.name)
                .await?
                .default_branch;
            info!(repo = %repo, branch = %repo.branch, "tracked branch defaulted from remote");
        }
    }
    let config = Arc::new(config);

    let auth = creator_github.git_auth().await?;
    let mut checkouts = Vec::with_capacity(config.repos.len());
    for repo in &config.repos {
        let url = repo.clone_url();
        let branch = repo.branch.clone();
        let scratch_root = PathBuf::from(&config.clone_data_dir);
        let auth = auth.clone();
        let checkout = tokio::task::spawn_blocking(move || {
            Checkout::clone_into(&scratch_root, &url, &branch, &auth)
        })
        .await
        .context("clone task panicked")?
        .with_context(|| format!("unable to set up checkout of {repo}"))?;
        info!(repo = %repo, "checkout ready");
        checkouts.push((repo.clone(), Arc::new(checkout)));
    }

    let registry = Arc::new(
        ChangerRegistry::new()
            .register(Box::new(TimeChangerFactory))
            .register(Box::new(HelmChangerFactory::new(Arc::new(
                HelmRepoLoader::new(),
            ))))
            .register(Box::new(ShellChangerFactory)),
    );

    let creator = PrCreator::new(
        Arc::clone(&config),
        registry,
        Arc::clone(&creator_github),
    );
    let reviewer = reviewer_github
        .as_ref()
        .map(|github| PrReviewer::new(Arc::clone(&config), Arc::clone(github)));
    let merger_github = reviewer_github.unwrap_or_else(|| Arc::clone(&creator_github));
    let merger = PrMerger::new(Arc::clone(&config), merger_github);

    let bot = Arc::new(GitopsBot::new(
        creator,
        reviewer,
        merger,
        checkouts,
        service.cron_interval,
    ));

    let shutdown = ShutdownSignal::new();
    let listener = tokio::net::TcpListener::bind(&service.listen_addr)
        .await
        .with_context(|| format!("unable to listen on {}", service.listen_addr))?;
    info!(addr = %listener.local_addr()?, "http server listening");
    let server = tokio::spawn({
        let router = http::router(Arc::clone(&bot));
        async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "http server error");
            }
        }
    });
    let bot_task = tokio::spawn({
        let bot = Arc::clone(&bot);
        let shutdown = shutdown.clone();
        async move { bot.run(shutdown).await }
    });

    tokio::signal::ctrl_c()
        .await
        .context("unable to wait for ctrl-c")?;
    info!("shutting down");
    shutdown.trigger();
    let _ = bot_task.await;
    server.abort();
    Ok(())
}
