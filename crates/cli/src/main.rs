use bridge::mailbox::{FileMailbox, MailboxRole};
use bridge::responder::{CommandResponder, EchoResponder, Responder};
use bridge::server::BridgeRuntime;
use bridge::session::{LifecycleEvent, SessionOutcome};
use bridge::transport::ConnectionState;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "wabridge")]
#[command(about = "WhatsApp mailbox bridge", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, mailbox and session directories).
    Init {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the bridge: connect to WhatsApp, publish inbound messages to the mailbox and send the replies.
    Run {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Phone number to link with a pairing code instead of a QR code (e.g. 4915112345678)
        #[arg(long, value_name = "NUMBER")]
        phone: Option<String>,

        /// Webhook and health port (default from config or 8086)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Answer mailbox requests: the external side of the bridge.
    Respond {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Reply with the received text.
        #[arg(long, conflicts_with = "exec")]
        echo: bool,

        /// Command run per message: text on stdin, reply on stdout (e.g. --exec python3 brain.py)
        #[arg(long, value_name = "CMD", num_args = 1.., allow_hyphen_values = true)]
        exec: Vec<String>,
    },

    /// Query a running bridge's health endpoint.
    Status {
        /// Config file path (default: WABRIDGE_CONFIG_PATH or ~/.wabridge/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("wabridge {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Run {
            config,
            phone,
            port,
        }) => {
            if let Err(e) = run_bridge(config, phone, port).await {
                log::error!("bridge failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Respond { config, echo, exec }) => {
            if let Err(e) = run_respond(config, echo, exec).await {
                log::error!("respond failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config }) => {
            if let Err(e) = run_status(config).await {
                log::error!("status failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(bridge::config::default_config_path);
    let dir = bridge::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

/// Cancel `token` on SIGINT / SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        bridge::server::shutdown_signal().await;
        token.cancel();
    });
}

async fn run_bridge(
    config_path: Option<std::path::PathBuf>,
    phone: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = bridge::config::load_config(config_path)?;
    if let Some(p) = port {
        config.server.port = p;
    }

    let phone_known = phone.is_some() || config.session.phone_number.is_some();

    log::info!("starting bridge on {}:{}", config.server.bind, config.server.port);
    let mut runtime = BridgeRuntime::new(config, &path, phone)?;
    if !phone_known && !runtime.is_registered() {
        if let Some(p) = prompt_phone_number()? {
            runtime = runtime.with_phone_number(p);
        }
    }
    let mut events = runtime.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());
    match runtime.run(shutdown).await? {
        SessionOutcome::Shutdown => Ok(()),
        SessionOutcome::LoggedOut => {
            anyhow::bail!("session logged out; run again to link the device")
        }
        SessionOutcome::Rejected(reason) => {
            anyhow::bail!("Evolution API rejected the credentials: {}", reason)
        }
        SessionOutcome::GaveUp { attempts } => {
            anyhow::bail!("could not reconnect after {} attempt(s)", attempts)
        }
    }
}

/// Ask for a phone number to pair with. Empty input means QR registration.
fn prompt_phone_number() -> anyhow::Result<Option<String>> {
    use std::io::{self, Write};

    let mut stdout = io::stdout();
    write!(
        stdout,
        "phone number for pairing code (digits with country code, empty for QR): "
    )?;
    stdout.flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let number = line.trim();
    Ok((!number.is_empty()).then(|| number.to_string()))
}

fn print_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::State(ConnectionState::Open) => println!("connected"),
        LifecycleEvent::State(ConnectionState::Connecting) => println!("connecting..."),
        LifecycleEvent::State(ConnectionState::Closed(reason)) => {
            println!("connection closed: {}", reason)
        }
        LifecycleEvent::QrCode(qr) => {
            log::debug!("qr payload: {}", qr);
            if qr.starts_with("data:") {
                println!("QR code issued as an image; open it in the Evolution manager to scan it");
                return;
            }
            match render_qr(qr) {
                Ok(block) => {
                    println!("scan this QR code with WhatsApp (Linked devices):");
                    print!("{}", block);
                }
                Err(e) => log::error!("rendering QR code failed: {}", e),
            }
        }
        LifecycleEvent::PairingCode(code) => {
            println!("pairing code: {}", code);
            println!("enter it in WhatsApp under Linked devices > Link with phone number");
        }
        LifecycleEvent::PairingFailed(reason) => {
            println!("pairing code unavailable ({}); use the QR code instead", reason)
        }
        LifecycleEvent::Registered { device_id } => match device_id {
            Some(id) => println!("device linked as {}", id),
            None => println!("device linked"),
        },
        LifecycleEvent::LoggedOut => println!("logged out"),
    }
}

/// Light border around the code, in modules.
const QR_QUIET_ZONE: usize = 2;

/// Render `data` as a QR code with Unicode half blocks, two module rows per text line.
fn render_qr(data: &str) -> Result<String, qrcode::types::QrError> {
    use qrcode::{Color, EcLevel, QrCode};

    let code = QrCode::with_error_correction_level(data.as_bytes(), EcLevel::L)?;
    let width = code.width();
    let colors = code.into_colors();
    let size = width + 2 * QR_QUIET_ZONE;
    let is_dark = |row: usize, col: usize| {
        let (Some(r), Some(c)) = (row.checked_sub(QR_QUIET_ZONE), col.checked_sub(QR_QUIET_ZONE))
        else {
            return false;
        };
        r < width && c < width && colors[r * width + c] == Color::Dark
    };

    let mut out = String::new();
    for row in (0..size).step_by(2) {
        for col in 0..size {
            out.push(match (is_dark(row, col), is_dark(row + 1, col)) {
                (true, true) => '█',
                (true, false) => '▀',
                (false, true) => '▄',
                (false, false) => ' ',
            });
        }
        out.push('\n');
    }
    Ok(out)
}

async fn run_respond(
    config_path: Option<std::path::PathBuf>,
    echo: bool,
    exec: Vec<String>,
) -> anyhow::Result<()> {
    let (config, path) = bridge::config::load_config(config_path)?;
    bridge::init::require_initialized(&path, &config)?;

    let responder: Box<dyn Responder> = if echo {
        Box::new(EchoResponder)
    } else if let Some(command) = CommandResponder::from_argv(exec) {
        let command = match config.mailbox.reply_timeout() {
            Some(timeout) => command.with_timeout(timeout),
            None => command,
        };
        Box::new(command)
    } else {
        anyhow::bail!("pass --echo or --exec CMD [ARGS...]");
    };

    let mailbox_dir = bridge::config::resolve_mailbox_dir(&config, &path);
    let mailbox = FileMailbox::from_config(&config.mailbox, &mailbox_dir);
    let _consumer = mailbox.attach(MailboxRole::Consumer)?;
    println!("answering requests in {}", mailbox_dir.display());

    let shutdown = CancellationToken::new();
    cancel_on_signal(shutdown.clone());
    let replied = bridge::responder::run_responder(
        &mailbox,
        responder.as_ref(),
        config.mailbox.poll_interval(),
        shutdown,
    )
    .await?;
    log::info!("responder stopped after {} repl(ies)", replied);
    Ok(())
}

async fn run_status(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = bridge::config::load_config(config_path)?;
    let host = match config.server.bind.trim() {
        "0.0.0.0" | "" => "127.0.0.1".to_string(),
        "::" => "[::1]".to_string(),
        other if other.contains(':') => format!("[{}]", other),
        other => other.to_string(),
    };
    let url = format!("http://{}:{}/", host, config.server.port);
    let health: serde_json::Value = reqwest::get(&url)
        .await
        .map_err(|e| anyhow::anyhow!("bridge not reachable at {}: {}", url, e))?
        .error_for_status()?
        .json()
        .await?;
    println!("{}", serde_json::to_string_pretty(&health)?);
    Ok(())
}
