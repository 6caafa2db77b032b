use crate::config::Config;
use crate::credentials::{CredentialStore, FileCredentialStore};
use crate::events::EventSink;
use crate::llm::OpenAiCompleter;
use crate::memory::ConversationMemory;
use crate::pipeline::{PipelineSettings, ResponsePipeline};
use crate::prompt::{BotSettings, FilePromptSource};
use crate::server::{PanelCredentials, ServerParts};
use crate::supervisor::{ReconnectPolicy, Supervisor, SupervisorParts};
use crate::transport::bridge::BridgeTransport;
use crate::transport::{ConnectOptions, ConnectionCell};
use rand::{distributions::Alphanumeric, Rng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        if command == "session-wipe" {
            return handle_session_wipe(&config);
        }
    }

    let panel = panel_credentials(&config)?;
    let completer = OpenAiCompleter::from_config(&config.llm)?;

    let prompts = FilePromptSource::from_config(&config.prompt);
    BotSettings::ensure_exists(prompts.settings_path(), &config.prompt.default_prompt)?;
    let settings_path = prompts.settings_path().to_path_buf();

    let events = EventSink::new();
    let connection = ConnectionCell::new();
    let settings = PipelineSettings::from_config(&config);
    tracing::info!(
        model = %settings.model,
        debounce_ms = settings.debounce.as_millis() as u64,
        min_reply_delay_ms = settings.min_reply_delay.as_millis() as u64,
        "responder configured"
    );
    let memory = Arc::new(ConversationMemory::new());
    let pipeline = ResponsePipeline::new(
        settings,
        memory.clone(),
        Arc::new(completer),
        Arc::new(prompts),
        events.clone(),
        connection.clone(),
    );

    let supervisor = Supervisor::spawn(SupervisorParts {
        transport: Arc::new(BridgeTransport::new(config.bridge.url.clone())),
        credentials: Arc::new(FileCredentialStore::new(&config.session.dir)),
        options: connect_options(&config),
        policy: ReconnectPolicy::from_config(&config.reconnect),
        events: events.clone(),
        pipeline,
        connection,
    });
    supervisor.start().await;

    let token = match config.server.token.clone() {
        Some(token) if !token.trim().is_empty() => token,
        _ => generate_token(32),
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::select! {
        res = crate::server::start(
            addr,
            ServerParts {
                token,
                panel,
                supervisor: supervisor.clone(),
                events,
                memory,
                settings_path,
            },
            shutdown_rx,
        ) => res,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            supervisor.stop().await;
            Ok(())
        }
    }
}

fn panel_credentials(config: &Config) -> Result<PanelCredentials, Box<dyn std::error::Error>> {
    let user = config.panel.user.clone().filter(|u| !u.trim().is_empty());
    let pass = config.panel.pass.clone().filter(|p| !p.is_empty());
    match (user, pass) {
        (Some(user), Some(pass)) => Ok(PanelCredentials { user, pass }),
        _ => Err("panel.user and panel.pass must be set".into()),
    }
}

fn connect_options(config: &Config) -> ConnectOptions {
    ConnectOptions {
        browser: config.session.browser.clone(),
        connect_timeout: Duration::from_millis(config.session.connect_timeout_ms),
        keep_alive_interval: Duration::from_millis(config.session.keep_alive_interval_ms),
    }
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_session_wipe(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileCredentialStore::new(&config.session.dir);
    store.wipe()?;
    println!("Session credentials removed from {}", store.session_dir().display());
    Ok(())
}

fn generate_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
