use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use link::cli::{self, ApprovalCommands, Commands, CursorCommands};
use link::config::Config;
use link::jobs::{self, apply_retry::Applier, poller::Poller};
use link::models::approval::TrackedState;
use link::models::rule::{RuleSet, DEFAULT_TEMPLATE};
use link::notification::{webhook::WebhookNotifier, LogNotifier, Notifier};
use link::state::AppState;
use link::store::SqliteStore;
use link::token::TokenCodec;
use link::upstream::UpstreamClient;
use link::{api, tls};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const STARTER_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<body>
<p>Approval <strong>{{approval_name}}</strong> ({{request_type}}) was requested by {{requested_by}}.</p>
<p>
  <a href="{{approve_url}}">Approve</a> |
  <a href="{{deny_url}}">Deny</a> |
  <a href="{{request_info_url}}">Request more information</a>
</p>
<p>Each link works once. The first reviewer to respond decides.</p>
</body>
</html>
"#;

const STARTER_RULES: &str = r#"# Link routing rules.
#
# Rules are checked top to bottom and the FIRST matching rule wins, so put
# narrow scoped rules above broad global ones. A rule may set at most one
# scope field (group, cloud, user, role or network); no scope means global.
#
# - approval:
#     description: prod provisioning
#     template: default.html
#     onProvision: true
#     onDelete: false
#     onReconfigure: false
#     linkedApproval: false
#     recipientList:
#       - ops@example.com
#     scope:
#       group: Prod
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "link=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = cli::Cli::parse();
    let cfg = Config::load(&args.config)?;

    let result = match args.command {
        Some(Commands::Serve { port }) => run_server(cfg, port).await,
        Some(Commands::Validate) => validate(&cfg),
        Some(Commands::Approval { command }) => {
            let store = open_store(&cfg).await?;
            handle_approval_command(&store, &cfg, command).await
        }
        Some(Commands::Cursor {
            command: CursorCommands::Show,
        }) => {
            let store = open_store(&cfg).await?;
            println!("{}", store.cursor().await?);
            Ok(())
        }
        None => run_server(cfg, None).await,
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: Option<u16>) -> anyhow::Result<()> {
    let rules = Arc::new(bootstrap(&cfg)?);
    if rules.is_empty() {
        tracing::warn!(path = %cfg.approval_config.display(), "no routing rules configured; approvals will not be tracked");
    } else {
        tracing::info!(rules = rules.len(), "loaded routing rules");
    }

    let public_host = url::Url::parse(&cfg.public_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string));
    tls::ensure_certificate(&cfg.tls_folder, public_host.as_slice())?;
    let tls_config = tls::load_server_config(&cfg.tls_folder)?;

    tracing::info!("Opening state database...");
    let store = open_store(&cfg).await?;

    let secret = match &cfg.token_secret {
        Some(secret) => secret.clone(),
        None => store.signing_secret().await?,
    };
    let codec = Arc::new(TokenCodec::from_hex(&secret, cfg.token_ttl)?);

    let upstream = Arc::new(upstream_client(&cfg)?);
    let notifier: Arc<dyn Notifier> = match &cfg.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.as_str(), cfg.notify_webhook_secret.clone())?),
        None => {
            tracing::warn!("NOTIFY_WEBHOOK_URL is not set; notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let cancel = CancellationToken::new();
    let applier = Applier::new(
        store.clone(),
        upstream.clone(),
        cancel.clone(),
        cfg.apply_timeout,
        cfg.apply_max_attempts,
    );
    let resumed = applier.recover().await?;
    if resumed > 0 {
        tracing::info!(resumed, "resuming decisions not yet applied");
    }

    let poller = Arc::new(Poller::new(
        store.clone(),
        upstream.clone(),
        codec.clone(),
        notifier.clone(),
        rules.clone(),
        &cfg.public_url,
        cfg.poll_page_size,
    ));
    let poll_task = jobs::poller::spawn(poller, cfg.poll_interval, cancel.clone());
    tracing::info!(interval_secs = cfg.poll_interval.as_secs(), "Morpheus poller started");

    let cleanup_task = jobs::cleanup::spawn(store.clone(), cfg.retention_days, cancel.clone());

    let state = Arc::new(AppState {
        store: store.clone(),
        codec,
        notifier,
        applier: applier.clone(),
        require_confirm: cfg.require_confirm,
    });
    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, port.unwrap_or(cfg.port))
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cfg.host, port.unwrap_or(cfg.port)))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Link listening on https://{}", addr);

    tokio::spawn(shutdown_signal(cancel.clone()));
    tls::serve(listener, tls_config, app, cancel).await?;

    let _ = tokio::join!(poll_task, cleanup_task);
    applier.drain().await;
    store.close().await;
    tracing::info!("Link stopped");
    Ok(())
}

/// Create starter files on first run and load the routing rules.
fn bootstrap(cfg: &Config) -> anyhow::Result<RuleSet> {
    std::fs::create_dir_all(&cfg.template_folder)
        .with_context(|| format!("failed to create {}", cfg.template_folder.display()))?;
    write_if_missing(&cfg.template_folder.join(DEFAULT_TEMPLATE), STARTER_TEMPLATE)?;
    write_if_missing(&cfg.approval_config, STARTER_RULES)?;
    Ok(RuleSet::load(&cfg.approval_config, &cfg.template_folder)?)
}

fn write_if_missing(path: &Path, contents: &str) -> anyhow::Result<()> {
    if path.exists() {
        return Ok(());
    }
    std::fs::write(path, contents).with_context(|| format!("failed to create {}", path.display()))?;
    tracing::info!(path = %path.display(), "created starter file");
    Ok(())
}

fn validate(cfg: &Config) -> anyhow::Result<()> {
    let rules = RuleSet::load(&cfg.approval_config, &cfg.template_folder)?;
    println!("Connection settings OK (Morpheus at {})", cfg.morpheus_host);
    println!("{} routing rule(s) OK:", rules.len());
    for (i, rule) in rules.rules().iter().enumerate() {
        let actions: Vec<&str> = rule.actions.iter().map(|a| a.as_str()).collect();
        let scope = rule
            .scope
            .as_ref()
            .map(|s| format!("{}={}", s.field.as_str(), s.value))
            .unwrap_or_else(|| "global".into());
        println!(
            "  {:>2}. {:<30} {:<28} {:<20} {} recipient(s)",
            i + 1,
            rule.description,
            actions.join(","),
            scope,
            rule.recipients.len()
        );
    }
    Ok(())
}

fn upstream_client(cfg: &Config) -> anyhow::Result<UpstreamClient> {
    UpstreamClient::new(
        &cfg.morpheus_host,
        &cfg.morpheus_token,
        cfg.morpheus_insecure_tls,
        UPSTREAM_TIMEOUT,
    )
}

async fn open_store(cfg: &Config) -> anyhow::Result<SqliteStore> {
    let store = SqliteStore::connect(&cfg.database_url)
        .await
        .with_context(|| format!("failed to open {}", cfg.database_url))?;
    store.migrate().await?;
    Ok(store)
}

async fn handle_approval_command(store: &SqliteStore, cfg: &Config, cmd: ApprovalCommands) -> anyhow::Result<()> {
    match cmd {
        ApprovalCommands::List { all } => {
            let approvals = store.list(all).await?;
            if approvals.is_empty() {
                println!("No tracked approvals.");
                return Ok(());
            }

            println!(
                "{:<8} {:<15} {:<24} {:<14} {:<9} CREATED",
                "ID", "STATE", "RULE", "DECISION", "ATTEMPTS"
            );
            for a in approvals {
                let decision = a
                    .decision
                    .as_ref()
                    .map(|d| d.action.as_str())
                    .unwrap_or("-");
                let rule = if a.rule_description.chars().count() > 24 {
                    format!("{}...", a.rule_description.chars().take(21).collect::<String>())
                } else {
                    a.rule_description.clone()
                };
                println!(
                    "{:<8} {:<15} {:<24} {:<14} {:<9} {}",
                    a.approval_id,
                    a.state,
                    rule,
                    decision,
                    a.apply_attempts,
                    a.created_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        ApprovalCommands::Show { approval_id } => match store.get(approval_id).await? {
            Some(tracked) => println!("{}", serde_json::to_string_pretty(&tracked)?),
            None => println!("Approval {} is not tracked.", approval_id),
        },
        ApprovalCommands::Retry { approval_id } => {
            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));
            let applier = Applier::new(
                store.clone(),
                Arc::new(upstream_client(cfg)?),
                cancel,
                cfg.apply_timeout,
                cfg.apply_max_attempts,
            );
            println!("Retrying approval {} until Morpheus accepts it (Ctrl-C to stop)...", approval_id);
            let state = applier.retry_failed(approval_id).await?;
            applier.drain().await;
            println!("Approval {} is now {}.", approval_id, state);
            if state == TrackedState::Decided {
                println!("Stopped before it was applied; the server resumes it on its next start.");
            }
        }
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::warn!("shutdown requested");
    cancel.cancel();
}
