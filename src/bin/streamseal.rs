//! Streamseal CLI binary.
//!
//! Encrypted byte streams over TCP using the sealed backend.
//!
//! # Commands
//!
//! - `connect` - Send stdin over an encrypted session and print the replies
//! - `listen` - Accept one connection and echo decrypted data back

use std::io::{self, Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use streamseal::{
    Config, ErrorCode, SealError, SealedTransport, SecureTransport, Session, SessionStats, Socket,
    TcpSocket, VERSION,
};

#[derive(Parser)]
#[command(name = "streamseal")]
#[command(version = VERSION)]
#[command(about = "Streamseal - byte-stream encrypted sockets", long_about = None)]
struct Cli {
    /// Config file (TOML); STREAMSEAL_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Print session statistics as JSON on exit
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, send stdin and print what comes back
    Connect {
        /// Server address
        #[arg(short, long, default_value = "127.0.0.1:4433")]
        addr: String,

        /// Server name to request
        #[arg(short, long, default_value = "localhost")]
        peer: String,

        /// Stop reading after this long without data (ms)
        #[arg(long, default_value = "2000")]
        idle_ms: u64,
    },

    /// Accept one connection and echo it back
    Listen {
        /// Address to bind
        #[arg(short, long, default_value = "127.0.0.1:4433")]
        addr: String,

        /// Name this server answers to
        #[arg(short, long, default_value = "localhost")]
        name: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(io::stderr)
        .init();

    let config = load_config(cli.config)?;

    let stats = match cli.command {
        Commands::Connect {
            addr,
            peer,
            idle_ms,
        } => cmd_connect(&addr, &peer, Duration::from_millis(idle_ms), &config)?,
        Commands::Listen { addr, name } => cmd_listen(&addr, &name, &config)?,
    };

    if cli.stats {
        eprintln!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let base = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let config = base.with_overrides(|key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

fn cmd_connect(
    addr: &str,
    peer: &str,
    idle: Duration,
    config: &Config,
) -> anyhow::Result<SessionStats> {
    let mut input = Vec::new();
    io::stdin().read_to_end(&mut input)?;

    let mut socket = TcpSocket::connect(addr)?;
    let mut session = Session::connect(&mut socket, SealedTransport::new(), peer, config)?;
    tracing::info!("Connected to {} as {}", addr, peer);

    write_all(&mut session, &input)?;

    let mut stdout = io::stdout().lock();
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match session.read(&mut buf) {
            Ok(n) => stdout.write_all(&buf[..n])?,
            Err(err) if err.is_recoverable() => {
                if !session.socket_mut().poll_readable(idle) {
                    break;
                }
            },
            Err(SealError::Fatal(code)) if code == ErrorCode::ConnectionReset => break,
            Err(err) => return Err(err.into()),
        }
    }
    stdout.flush()?;

    Ok(session.close())
}

fn cmd_listen(addr: &str, name: &str, config: &Config) -> anyhow::Result<SessionStats> {
    let listener = TcpListener::bind(addr)?;
    tracing::info!("Listening on {} as {}", listener.local_addr()?, name);

    let (stream, peer_addr) = listener.accept()?;
    tracing::info!("Accepted connection from {}", peer_addr);

    let mut socket = TcpSocket::new(stream)?;
    let mut session = Session::accept(&mut socket, SealedTransport::new(), name, config)?;

    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match session.read(&mut buf) {
            Ok(n) => write_all(&mut session, &buf[..n])?,
            Err(err) if err.is_recoverable() => {
                session.socket_mut().poll_readable(Duration::from_millis(100));
            },
            Err(SealError::Fatal(code)) if code == ErrorCode::ConnectionReset => {
                tracing::info!("Peer closed the connection");
                break;
            },
            Err(err) => return Err(err.into()),
        }
    }

    Ok(session.close())
}

/// Write all of `data`, waiting out back-pressure.
fn write_all<S: Socket, P: SecureTransport>(
    session: &mut Session<S, P>,
    mut data: &[u8],
) -> anyhow::Result<()> {
    while !data.is_empty() {
        let n = session.write(data)?;
        data = &data[n..];
        if n == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    while !session.flush()? {
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}
