use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{info, warn};

use crate::{
    cli::ClientArgs,
    message::{read_message, write_message, ErrorKind, Message, Request, Response},
};

const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);
const SESSION_END_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs the interactive client: registers, prints history, then relays
/// stdin lines to the server while a second connection long-polls for
/// incoming messages.
pub async fn run(args: ClientArgs) -> Result<()> {
    let mut control = Connection::open(args.server).await?;
    info!("connected to {}", args.server);

    let history = register(&mut control, &args.name).await?;
    print_history(&history).await?;

    let poller = spawn_poller(args.server, args.name.clone());

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    run_input_loop(&mut control, &mut stdin, &mut input, &args.name).await?;

    finish_session(&mut control, poller, &args.name).await;
    Ok(())
}

struct Connection {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Connection {
    async fn open(server: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(server)
            .await
            .with_context(|| format!("failed to connect to {server}"))?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn call(&mut self, request: &Request) -> Result<Response> {
        write_message(&mut self.writer, request).await?;
        match read_message::<_, Response>(&mut self.reader).await? {
            Some(response) => Ok(response),
            None => anyhow::bail!("server closed the connection"),
        }
    }
}

async fn register(control: &mut Connection, name: &str) -> Result<Vec<Message>> {
    let request = Request::Register {
        client_id: name.to_string(),
    };
    match control.call(&request).await? {
        Response::History { messages } => Ok(messages),
        Response::Error { message, .. } => anyhow::bail!("register failed: {message}"),
        other => anyhow::bail!("unexpected reply to register: {other:?}"),
    }
}

fn spawn_poller(server: SocketAddr, name: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(error) = poll_loop(server, &name).await {
            warn!(?error, "message stream ended unexpectedly");
        }
    })
}

// Mirrors the long-poll contract: each request blocks server-side until a
// message exists, so this loop spends its life inside `call`. Transport
// errors back off briefly and try a fresh connection; the loop only ends
// once the server says the registration is gone.
async fn poll_loop(server: SocketAddr, name: &str) -> Result<()> {
    let mut conn = Connection::open(server).await?;
    let request = Request::Poll {
        client_id: name.to_string(),
    };

    loop {
        match conn.call(&request).await {
            Ok(Response::Message { message }) => print_message(&message).await?,
            Ok(Response::Error {
                kind: ErrorKind::ClientGone | ErrorKind::NotRegistered,
                ..
            }) => {
                write_stdout("*** session ended").await?;
                return Ok(());
            }
            Ok(other) => warn!(?other, "unexpected reply to poll"),
            Err(error) => {
                warn!(?error, "poll failed, retrying");
                sleep(POLL_RETRY_DELAY).await;
                match Connection::open(server).await {
                    Ok(fresh) => conn = fresh,
                    Err(error) => warn!(?error, "reconnect failed"),
                }
            }
        }
    }
}

async fn run_input_loop(
    control: &mut Connection,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    name: &str,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(input) => {
                if !handle_input_line(bytes_read, input, control, name).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_input_line(
    bytes_read: io::Result<usize>,
    input: &str,
    control: &mut Connection,
    name: &str,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("Goodbye.").await?;
        return Ok(false);
    }

    send_line(control, name, text).await?;
    Ok(true)
}

async fn send_line(control: &mut Connection, name: &str, text: &str) -> Result<()> {
    let request = Request::Send {
        from: name.to_string(),
        text: text.to_string(),
    };
    match control.call(&request).await {
        Ok(Response::Sent) => {}
        Ok(Response::Error { message, .. }) => write_stderr(&format!("!!! {message}")).await?,
        Ok(other) => warn!(?other, "unexpected reply to send"),
        Err(error) => warn!(?error, "send failed"),
    }
    Ok(())
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

// Unregister wakes the poller's pending poll with a terminal reply, so the
// poller normally ends on its own; the abort is a fallback for a dead
// server.
async fn finish_session(control: &mut Connection, mut poller: JoinHandle<()>, name: &str) {
    let request = Request::Unregister {
        client_id: name.to_string(),
    };
    if let Err(error) = control.call(&request).await {
        warn!(?error, "failed to unregister cleanly");
    }

    if timeout(SESSION_END_TIMEOUT, &mut poller).await.is_err() {
        poller.abort();
    }

    shutdown_connection(&mut control.writer).await;
}

async fn shutdown_connection(writer: &mut tokio::net::tcp::OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn print_history(history: &[Message]) -> io::Result<()> {
    write_stdout("=== chat history ===").await?;
    for message in history {
        print_message(message).await?;
    }
    write_stdout("====================").await
}

async fn print_message(message: &Message) -> io::Result<()> {
    let stamp = message.time.with_timezone(&Local).format("%H:%M:%S");
    write_stdout(&format!("[{stamp}] {}: {}", message.from, message.text)).await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
