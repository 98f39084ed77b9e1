// kmapi Linux client: drives the four endpoint types over the tokio engine.

mod config;
mod engine;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Args, Parser, Subcommand};
use kmapi_core::{
    Binding, HttpRequest, KmError, SslFlags, SystemTrustStore, TcpSocket, UdpFlags, UdpSocket,
    WebSocket, HTTP_1_1, HTTP_2_0,
};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::engine::TokioEngine;

#[derive(Parser, Debug)]
#[command(name = "kmapi-linux", version, about = "Exercise kmapi endpoints against a live peer")]
struct Cli {
    /// Config file instead of ~/.config/kmapi/config.toml or /etc/kmapi/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plain TCP: connect, optionally send a line, print what comes back
    Tcp(StreamArgs),
    /// TCP with TLS on connect
    Tls {
        #[command(flatten)]
        stream: StreamArgs,
        /// SNI and verification name, if not the host
        #[arg(long)]
        server_name: Option<String>,
    },
    /// Send a datagram and print replies
    Udp {
        host: String,
        port: u16,
        #[arg(short, long, default_value = "ping")]
        message: String,
        /// Listen on `port` in this multicast group instead of sending to host
        #[arg(long)]
        join: Option<String>,
        /// How long to wait for datagrams
        #[arg(long, default_value_t = 3000)]
        wait_ms: u64,
    },
    /// One HTTP request; the body goes to stdout
    Http {
        url: String,
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,
        /// "Name: value", repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
        #[arg(short, long)]
        data: Option<String>,
        #[arg(long)]
        http2: bool,
    },
    /// Open a WebSocket, send messages, print one reply per message
    Ws {
        url: String,
        #[arg(short, long)]
        message: Vec<String>,
        /// Send messages as binary frames
        #[arg(long)]
        binary: bool,
        #[arg(long)]
        origin: Option<String>,
        #[arg(long)]
        subprotocol: Option<String>,
    },
}

#[derive(Args, Debug)]
struct StreamArgs {
    host: String,
    port: u16,
    /// Line to send once connected
    #[arg(short, long)]
    send: Option<String>,
    /// Connect timeout; 0 uses the configured default
    #[arg(long, default_value_t = 0)]
    timeout_ms: u32,
}

/// What the endpoint callbacks report back to the command.
#[derive(Debug)]
enum Event {
    Ready,
    Data,
    Done,
    Failed(KmError),
}

type Events = mpsc::UnboundedSender<Event>;

fn status_event(s: Result<(), KmError>) -> Event {
    match s {
        Ok(()) => Event::Ready,
        Err(e) => Event::Failed(e),
    }
}

fn print_data(data: &[u8]) {
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(data);
    let _ = out.flush();
}

async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> anyhow::Result<Event> {
    rx.recv().await.context("endpoint dropped its listeners")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    let engine = Arc::new(TokioEngine::new(rt.handle().clone(), cfg.engine_settings()?));
    let trust = match &cfg.ca_file {
        Some(path) => SystemTrustStore::with_file(path),
        None => SystemTrustStore::new(),
    };
    let binding = Binding::with_engine(engine, Box::new(trust));
    binding.ensure_initialized()?;

    rt.block_on(async {
        tokio::select! {
            r = run(&binding, &cfg, cli.command) => r,
            r = shutdown_signal() => {
                tracing::info!("interrupted");
                r
            }
        }
    })
}

async fn run(binding: &Binding, cfg: &Config, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Tcp(args) => stream(binding, args, None, cfg.ssl_flags).await,
        Command::Tls { stream: args, server_name } => {
            let flags = cfg.ssl_flags | SslFlags::ENABLE;
            stream(binding, args, Some(server_name), flags).await
        }
        Command::Udp {
            host,
            port,
            message,
            join,
            wait_ms,
        } => udp(binding, &host, port, &message, join.as_deref(), wait_ms).await,
        Command::Http {
            url,
            method,
            headers,
            data,
            http2,
        } => http(binding, cfg.ssl_flags, &url, &method, &headers, data, http2).await,
        Command::Ws {
            url,
            message,
            binary,
            origin,
            subprotocol,
        } => {
            let opts = WsOptions {
                origin,
                subprotocol,
                binary,
            };
            ws(binding, cfg.ssl_flags, &url, &message, opts).await
        }
    }
}

async fn stream(
    binding: &Binding,
    args: StreamArgs,
    // Some(server name override) turns TLS on
    tls: Option<Option<String>>,
    flags: SslFlags,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sock = TcpSocket::with_binding(binding);
    let (c, e): (Events, Events) = (tx.clone(), tx);
    sock.on_connect(move |s| {
        let _ = c.send(status_event(s));
    })
    .on_data(print_data)
    .on_error(move |err| {
        let _ = e.send(Event::Failed(err));
    });

    if let Some(server_name) = tls {
        sock.set_ssl_flags(flags)?;
        if let Some(name) = server_name {
            sock.set_ssl_server_name(&name)?;
        }
    }
    sock.connect(&args.host, args.port, args.timeout_ms)?;
    match next(&mut rx).await? {
        Event::Ready => tracing::info!(host = %args.host, port = args.port, "connected"),
        Event::Failed(e) => bail!("connect to {}:{} failed: {e}", args.host, args.port),
        other => bail!("unexpected {other:?} before connect"),
    }
    if let Some(line) = args.send {
        sock.send(format!("{line}\r\n").as_str())?;
    }
    // runs until the peer hangs up
    match next(&mut rx).await? {
        Event::Failed(KmError::Closed) => tracing::info!("peer closed the connection"),
        Event::Failed(e) => bail!("connection failed: {e}"),
        _ => {}
    }
    sock.close();
    Ok(())
}

async fn udp(
    binding: &Binding,
    host: &str,
    port: u16,
    message: &str,
    join: Option<&str>,
    wait_ms: u64,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sock = UdpSocket::with_binding(binding);
    let (d, e): (Events, Events) = (tx.clone(), tx);
    sock.on_data(move |data, from, from_port| {
        tracing::info!(from, port = from_port, len = data.len(), "datagram");
        print_data(data);
        let _ = d.send(Event::Data);
    })
    .on_error(move |err| {
        let _ = e.send(Event::Failed(err));
    });

    match join {
        Some(group) => {
            sock.bind("0.0.0.0", port, UdpFlags::MULTICAST_LOOP)?;
            sock.mcast_join(group, port)?;
            tracing::info!(group, port, "joined multicast group");
            sock.send(message, group, port)?;
        }
        None => {
            sock.send(message, host, port)?;
        }
    }

    let deadline = tokio::time::sleep(Duration::from_millis(wait_ms));
    tokio::pin!(deadline);
    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            ev = next(&mut rx) => match ev? {
                Event::Failed(e) => bail!("udp socket failed: {e}"),
                _ => received += 1,
            },
        }
    }
    if let Some(group) = join {
        sock.mcast_leave(group, port)?;
    }
    tracing::info!(received, "done");
    sock.close();
    Ok(())
}

async fn http(
    binding: &Binding,
    flags: SslFlags,
    url: &str,
    method: &str,
    headers: &[String],
    data: Option<String>,
    http2: bool,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut req = HttpRequest::with_binding(binding, if http2 { HTTP_2_0 } else { HTTP_1_1 });
    let (h, c, e): (Events, Events, Events) = (tx.clone(), tx.clone(), tx);
    req.on_header_complete(move || {
        let _ = h.send(Event::Ready);
    })
    .on_data(print_data)
    .on_response_complete(move || {
        let _ = c.send(Event::Done);
    })
    .on_error(move |err| {
        let _ = e.send(Event::Failed(err));
    });

    if !flags.is_empty() {
        req.set_ssl_flags(flags)?;
    }
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("header {header:?} is not \"Name: value\""))?;
        req.add_header(name.trim(), value.trim())?;
    }
    if let Some(body) = &data {
        req.add_header("Content-Length", &body.len().to_string())?;
    }
    req.send_request(method, url)?;
    if let Some(body) = &data {
        if !body.is_empty() {
            req.send_data(body.as_str())?;
        }
    }

    loop {
        match next(&mut rx).await? {
            Event::Ready => {
                let status = req.status_code().unwrap_or_default();
                let kind = req.header_value("content-type").unwrap_or_default();
                tracing::info!(status, content_type = %kind, "response headers");
            }
            Event::Done => break,
            Event::Failed(e) => bail!("{method} {url} failed: {e}"),
            Event::Data => {}
        }
    }
    req.close();
    Ok(())
}

struct WsOptions {
    origin: Option<String>,
    subprotocol: Option<String>,
    binary: bool,
}

async fn ws(
    binding: &Binding,
    flags: SslFlags,
    url: &str,
    messages: &[String],
    opts: WsOptions,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut sock = WebSocket::with_binding(binding, HTTP_1_1);
    let (o, t, b, e): (Events, Events, Events, Events) = (tx.clone(), tx.clone(), tx.clone(), tx);
    sock.on_open(move |s| {
        let _ = o.send(status_event(s));
    })
    .on_text(move |text, _fin| {
        println!("{text}");
        let _ = t.send(Event::Data);
    })
    .on_binary(move |data, _fin| {
        tracing::info!(len = data.len(), "binary message");
        print_data(data);
        let _ = b.send(Event::Data);
    })
    .on_error(move |err| {
        let _ = e.send(Event::Failed(err));
    });

    if !flags.is_empty() {
        sock.set_ssl_flags(flags)?;
    }
    if let Some(origin) = &opts.origin {
        sock.set_origin(origin)?;
    }
    if let Some(proto) = &opts.subprotocol {
        sock.set_subprotocol(proto)?;
    }
    sock.open(url)?;
    match next(&mut rx).await? {
        Event::Ready => tracing::info!(url, "websocket open"),
        Event::Failed(e) => bail!("open {url} failed: {e}"),
        other => bail!("unexpected {other:?} before open"),
    }

    for message in messages {
        if opts.binary {
            sock.send(message.as_bytes())?;
        } else {
            sock.send(message.as_str())?;
        }
        if let Event::Failed(e) = next(&mut rx).await? {
            bail!("websocket failed: {e}");
        }
    }
    sock.close();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from(["kmapi-linux", "--config", "/tmp/k.toml", "tcp", "localhost", "7"]);
        assert_eq!(cli.config.as_deref(), Some(std::path::Path::new("/tmp/k.toml")));
        assert!(matches!(cli.command, Command::Tcp(StreamArgs { port: 7, .. })));

        let cli = Cli::parse_from([
            "kmapi-linux", "http", "http://localhost/", "-X", "POST", "-H", "A: b", "-d", "x",
        ]);
        match cli.command {
            Command::Http { method, headers, data, http2, .. } => {
                assert_eq!(method, "POST");
                assert_eq!(headers, vec!["A: b".to_string()]);
                assert_eq!(data.as_deref(), Some("x"));
                assert!(!http2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
