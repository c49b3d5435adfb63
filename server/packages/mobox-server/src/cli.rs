use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use mobox_agent_events::Framework;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use utoipa::OpenApi;
use uuid::Uuid;

use crate::agents::AgentCatalog;
use crate::persistence::MemoryChatStore;
use crate::router::{build_router_with_state, ApiDoc, AppState};
use crate::sandbox::{LaunchRequest, Sandbox, ScriptedSandbox, SubprocessSandbox};
use crate::stream::{StreamBridge, StreamHub, StreamRegistry, StreamRequest};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_AGENTS_DIR: &str = "./agents";
const DEFAULT_STREAM_TTL_SECS: u64 = 3600;

#[derive(Parser, Debug)]
#[command(name = "mobox-server", bin_name = "mobox-server")]
#[command(about = "Runs agents and streams their normalized activity", version)]
#[command(arg_required_else_help = true)]
pub struct MoboxCli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Server(ServerArgs),
    /// Push a recorded agent stream through the pipeline and print the frames.
    Replay(ReplayArgs),
    /// Print the OpenAPI document.
    Openapi,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', env = "MOBOX_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, short = 'p', env = "MOBOX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "MOBOX_AGENTS_DIR", default_value = DEFAULT_AGENTS_DIR)]
    pub agents_dir: PathBuf,

    #[arg(long, env = "MOBOX_STREAM_TTL_SECS", default_value_t = DEFAULT_STREAM_TTL_SECS)]
    pub stream_ttl_secs: u64,

    /// Set to false to disable stream resumption.
    #[arg(
        long,
        env = "MOBOX_RESUMABLE_STREAMS",
        default_value_t = true,
        action = ArgAction::Set
    )]
    pub resumable_streams: bool,

    #[arg(long = "no-resume")]
    pub no_resume: bool,

    #[arg(long = "cors-allow-origin", short = 'O')]
    pub cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    pub cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    pub cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    pub cors_allow_credentials: bool,
}

impl ServerArgs {
    fn resumable(&self) -> bool {
        self.resumable_streams && !self.no_resume
    }
}

#[derive(Args, Debug)]
pub struct ReplayArgs {
    #[arg(long, short = 'f', default_value = "claude")]
    pub framework: String,

    /// JSONL file to replay, `-` for stdin.
    #[arg(long, short = 'i', default_value = "-")]
    pub input: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("--cors-allow-credentials needs explicit --cors-allow-method and --cors-allow-header values")]
    CorsCredentialsWithWildcard,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Mobox(#[from] mobox_error::MoboxError),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_mobox() -> Result<(), CliError> {
    let cli = MoboxCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Replay(args) => run_replay(args),
        Command::Openapi => {
            let doc = ApiDoc::openapi()
                .to_pretty_json()
                .map_err(|err| CliError::Server(err.to_string()))?;
            writeln!(std::io::stdout(), "{doc}")?;
            Ok(())
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let registry = server.resumable().then(|| {
        StreamRegistry::in_memory(Duration::from_secs(server.stream_ttl_secs))
    });
    let state = AppState::new(
        AgentCatalog::new(&server.agents_dir),
        Arc::new(SubprocessSandbox::new()),
        Arc::new(MemoryChatStore::new()),
        registry,
    );
    let (mut router, _state) = build_router_with_state(Arc::new(state));

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(
            addr = %addr,
            agents_dir = %server.agents_dir.display(),
            resumable = server.resumable(),
            "server listening"
        );
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn run_replay(args: &ReplayArgs) -> Result<(), CliError> {
    let framework: Framework = args
        .framework
        .parse()
        .map_err(mobox_error::MoboxError::from)?;
    let mut script = Vec::new();
    if args.input == "-" {
        std::io::stdin().read_to_end(&mut script)?;
    } else {
        script = std::fs::read(&args.input)?;
    }

    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let sandbox = ScriptedSandbox::new(script);
        let session_id = Uuid::new_v4().to_string();
        let process = sandbox
            .launch(LaunchRequest {
                session_id: session_id.clone(),
                agent_id: "replay".to_string(),
                agent_dir: PathBuf::from("."),
                command: vec!["replay".to_string()],
                prompt: String::new(),
                history: None,
                env: Default::default(),
                timeout: Duration::from_secs(DEFAULT_STREAM_TTL_SECS),
                idle_timeout: Duration::from_secs(DEFAULT_STREAM_TTL_SECS),
            })
            .await
            .map_err(|err| err.into_mobox("replay"))?;

        let bridge = StreamBridge::new(StreamHub::new(), None, None);
        let (mut frames, task) = bridge
            .start(
                StreamRequest {
                    session_id,
                    stream_id: Uuid::new_v4().to_string(),
                    message_id: format!("msg_{}", Uuid::new_v4().simple()),
                    framework,
                },
                process,
            )
            .await;
        let mut stdout = std::io::stdout().lock();
        while let Some(frame) = frames.recv().await {
            stdout.write_all(frame.encode_sse().as_bytes())?;
        }
        let report = task
            .await
            .map_err(|err| CliError::Server(err.to_string()))?;
        writeln!(stdout, "{}", serde_json::to_string_pretty(&report.turn)?)?;
        tracing::info!(
            frames = report.frames_sent,
            lines_skipped = report.lines_skipped,
            "replay finished"
        );
        Ok(())
    })
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    // Credentials cannot be combined with wildcard methods or headers.
    if server.cors_allow_credentials
        && (server.cors_allow_method.is_empty() || server.cors_allow_header.is_empty())
    {
        return Err(CliError::CorsCredentialsWithWildcard);
    }
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_flags_and_defaults() {
        let cli = MoboxCli::try_parse_from([
            "mobox-server",
            "server",
            "--port",
            "9000",
            "--no-resume",
            "-O",
            "http://localhost:3000",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert_eq!(args.port, 9000);
        assert!(!args.resumable());
        assert!(build_cors_layer(&args).is_ok());
    }

    #[test]
    fn rejects_bad_cors_origin() {
        let cli = MoboxCli::try_parse_from(["mobox-server", "server", "-O", "bad\norigin"])
            .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server command");
        };
        assert!(matches!(
            build_cors_layer(&args),
            Err(CliError::InvalidCorsOrigin(_))
        ));
    }

    #[test]
    fn credentials_require_explicit_methods_and_headers() {
        let parse = |extra: &[&str]| {
            let mut argv = vec!["mobox-server", "server", "-O", "http://localhost:3000", "-C"];
            argv.extend_from_slice(extra);
            let cli = MoboxCli::try_parse_from(argv).expect("parse");
            let Command::Server(args) = cli.command else {
                panic!("expected server command");
            };
            args
        };

        assert!(matches!(
            build_cors_layer(&parse(&[])),
            Err(CliError::CorsCredentialsWithWildcard)
        ));
        assert!(matches!(
            build_cors_layer(&parse(&["-M", "GET"])),
            Err(CliError::CorsCredentialsWithWildcard)
        ));

        let layer = build_cors_layer(&parse(&["-M", "GET", "-M", "POST", "-A", "content-type"]))
            .expect("explicit lists allow credentials");
        let _router: axum::Router = axum::Router::new()
            .route("/", axum::routing::get(|| async { "ok" }))
            .layer(layer);
    }
}
