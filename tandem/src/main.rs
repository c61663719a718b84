// Tandem: two-party chat and file transfer over a single TCP connection.

mod config;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tandem_core::{spawn_link, Link, LinkError, LinkEvent, LinkHandle};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: tandem listen [port] | tandem connect <host[:port]>";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Version,
    Listen(Option<u16>),
    Connect(String),
}

fn parse_args<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let args: Vec<String> = args.into_iter().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        return Ok(Command::Version);
    }
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        ["listen"] => Ok(Command::Listen(None)),
        ["listen", port] => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port {port:?}"))?;
            Ok(Command::Listen(Some(port)))
        }
        ["connect", target] => Ok(Command::Connect(target.to_string())),
        _ => bail!(USAGE),
    }
}

fn main() -> Result<()> {
    let command = parse_args(std::env::args().skip(1))?;
    if command == Command::Version {
        println!("tandem {}", VERSION);
        return Ok(());
    }

    let cfg = config::load();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(command, cfg))
}

async fn run(command: Command, cfg: config::Config) -> Result<()> {
    let stream = match command {
        Command::Listen(port) => accept_one(port.unwrap_or(cfg.port)).await?,
        Command::Connect(target) => {
            connect_with_retry(&target, cfg.port, cfg.connect_attempts, cfg.connect_retry()).await?
        }
        Command::Version => return Ok(()),
    };
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    info!(%peer, "connected");
    println!("connected to {peer}; type a message, /file <path> [priority], or /quit");

    let (reader, writer) = stream.into_split();
    let Link {
        handle,
        mut events,
        mut task,
    } = spawn_link(reader, writer, cfg.link_config())?;

    let input = tokio::spawn(read_commands(handle.clone()));
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(&event);
        }
    });

    let joined = tokio::select! {
        joined = &mut task => joined,
        signal = shutdown_signal() => {
            signal?;
            info!("shutting down");
            handle.close();
            task.await
        }
    };
    input.abort();
    let _ = printer.await;

    match joined.context("link task failed")? {
        Ok(()) => Ok(()),
        Err(LinkError::ConnectionClosed) => {
            println!("peer disconnected");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Listen on `port` and take the first connection.
async fn accept_one(port: u16) -> Result<TcpStream> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("cannot listen on port {port}"))?;
    info!(port, "waiting for peer");
    let (stream, _) = listener.accept().await?;
    Ok(stream)
}

/// Dial `target`, retrying a fixed number of times with a fixed delay.
async fn connect_with_retry(
    target: &str,
    default_port: u16,
    attempts: u32,
    delay: Duration,
) -> Result<TcpStream> {
    let addr = if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:{default_port}")
    };
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < attempts => {
                warn!(%addr, attempt, error = %e, "connect failed, retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("cannot connect to {addr} after {attempts} attempts"))
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Empty,
    Quit,
    Text(&'a str),
    File { path: PathBuf, priority: i32 },
    Usage(&'static str),
}

fn parse_input(line: &str) -> Input<'_> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return Input::Empty;
    }
    if trimmed.trim() == "/quit" {
        return Input::Quit;
    }
    if let Some(rest) = trimmed.strip_prefix("/file") {
        let rest = rest.trim();
        if rest.is_empty() {
            return Input::Usage("usage: /file <path> [priority]");
        }
        // Trailing integer is the priority; anything before it is the path.
        if let Some((path, last)) = rest.rsplit_once(' ') {
            if let Ok(priority) = last.parse() {
                return Input::File {
                    path: PathBuf::from(path.trim_end()),
                    priority,
                };
            }
        }
        return Input::File {
            path: PathBuf::from(rest),
            priority: 0,
        };
    }
    Input::Text(trimmed)
}

/// Read stdin until `/quit` or end of input, then close the link.
async fn read_commands(handle: LinkHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                break;
            }
        };
        match parse_input(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::Usage(usage) => eprintln!("{usage}"),
            Input::Text(text) => {
                if let Err(e) = handle.enqueue_text(text) {
                    eprintln!("not sent: {e}");
                    if e.is_fatal() {
                        break;
                    }
                }
            }
            Input::File { path, priority } => match handle.admit_file(&path, priority).await {
                Ok(id) => println!("sending {} as {id}", path.display()),
                Err(e) => eprintln!("{e}"),
            },
        }
    }
    handle.close();
}

fn print_event(event: &LinkEvent) {
    match event {
        LinkEvent::Text(text) => println!("peer: {text}"),
        LinkEvent::TransferSent { id, name, size } => {
            println!("sent {name} ({size} bytes) {id}")
        }
        LinkEvent::TransferFailed { id, name, reason } => {
            println!("sending {name} {id} failed: {reason}")
        }
        LinkEvent::FileIncoming { id, name, size } => {
            println!("receiving {name} ({size} bytes) {id}")
        }
        LinkEvent::FileReceived { id, path, size } => {
            println!("received {} ({size} bytes) {id}", path.display())
        }
        LinkEvent::FileFailed { id, name, reason } => {
            println!("receiving {name} {id} failed: {reason}")
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
