use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    select,
    sync::mpsc,
};
use tracing::warn;

use crate::{
    cli::ClientArgs,
    message::{PRESENCE_TOPIC, PresenceAction, PresenceUpdate},
    session::{Session, SessionBuilder, SessionState},
};

/// A line ready for the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rendered {
    Out(String),
    Err(String),
}

type RenderTx = mpsc::UnboundedSender<Rendered>;

#[derive(Debug, Clone, PartialEq)]
enum ClientCommand {
    Subscribe(String),
    Publish { topic: String, message: Value },
    Message { to: String, message: Value },
    Quit,
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let (render_tx, mut render_rx) = mpsc::unbounded_channel();
    let session = establish_session(&args, &render_tx).await?;

    for topic in &args.subscribe {
        subscribe(&session, topic, &render_tx).await?;
    }
    if args.presence {
        session.subscribe_presence().await?;
    }

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let outcome =
        run_client_loop(&session, &render_tx, &mut render_rx, &mut stdin, &mut input).await;
    if let Err(error) = session.close().await {
        warn!(%error, "session ended with error");
    }

    outcome
}

async fn establish_session(args: &ClientArgs, render_tx: &RenderTx) -> Result<Session> {
    let service = args.service.clone();
    let ack_tx = render_tx.clone();
    let direct_tx = render_tx.clone();
    let presence_tx = render_tx.clone();
    let error_tx = render_tx.clone();

    SessionBuilder::new(&args.service, &args.server)
        .reconnect(args.reconnect_policy())
        .on_ack(move |ack| {
            let line = if ack.is_ok() {
                format!("*** registered as {service}")
            } else {
                format!("!!! registration status: {}", ack.status)
            };
            emit(&ack_tx, Rendered::Out(line))
        })
        .on_direct_message(move |message, from| {
            emit(
                &direct_tx,
                Rendered::Out(format!("[dm] {} -> {}", sender(from), payload_text(message))),
            )
        })
        .on_presence(move |update| emit(&presence_tx, Rendered::Out(render_presence(update))))
        .on_error(move |message| emit(&error_tx, Rendered::Err(format!("!!! {message}"))))
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", args.server))
}

async fn subscribe(session: &Session, topic: &str, render_tx: &RenderTx) -> Result<()> {
    if topic == PRESENCE_TOPIC {
        session.subscribe_presence().await?;
        return Ok(());
    }

    let render_tx = render_tx.clone();
    let label = topic.to_string();
    session
        .subscribe(topic, move |message, from| {
            emit(
                &render_tx,
                Rendered::Out(format!("[{label}] {} -> {}", sender(from), payload_text(message))),
            )
        })
        .await
        .with_context(|| format!("failed to subscribe to {topic}"))
}

async fn run_client_loop(
    session: &Session,
    render_tx: &RenderTx,
    render_rx: &mut mpsc::UnboundedReceiver<Rendered>,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    let mut state = session.state_changes();

    loop {
        select! {
            rendered = render_rx.recv() => {
                if let Some(rendered) = rendered {
                    write_rendered(rendered).await?;
                }
            }
            bytes_read = stdin.read_line(input) => {
                // read_line keeps partial input across cancellation, so the
                // buffer is only cleared once a full line was handled.
                let keep_going = handle_stdin_input(bytes_read, input, session, render_tx).await?;
                input.clear();
                if !keep_going {
                    break;
                }
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == SessionState::Disconnected {
                    flush_rendered(render_rx).await?;
                    write_stdout("*** disconnected from broker").await?;
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

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &Session,
    render_tx: &RenderTx,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let command = match parse_command(input) {
        Ok(Some(command)) => command,
        Ok(None) => return Ok(true),
        Err(error) => {
            write_stderr(&format!("!!! {error}")).await?;
            return Ok(true);
        }
    };

    let outcome = match command {
        ClientCommand::Subscribe(topic) => subscribe(session, &topic, render_tx).await,
        ClientCommand::Publish { topic, message } => {
            session.publish(topic, message).await.map_err(Into::into)
        }
        ClientCommand::Message { to, message } => {
            session.send_message(to, message).await.map_err(Into::into)
        }
        ClientCommand::Quit => {
            write_stdout("*** leaving").await?;
            return Ok(false);
        }
    };

    // Transient failures are shown and the prompt stays usable; the session
    // reconnects on its own.
    if let Err(error) = outcome {
        write_stderr(&format!("!!! {error:#}")).await?;
    }
    Ok(true)
}

fn parse_command(line: &str) -> Result<Option<ClientCommand>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if line.eq_ignore_ascii_case("/quit") || line.eq_ignore_ascii_case("quit") {
        return Ok(Some(ClientCommand::Quit));
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let verb = parts.next().unwrap_or_default();
    let target = parts.next().map(str::trim).filter(|s| !s.is_empty());
    let rest = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match (verb, target, rest) {
        ("sub", Some(topic), None) => Ok(Some(ClientCommand::Subscribe(topic.to_string()))),
        ("pub", Some(topic), Some(text)) => Ok(Some(ClientCommand::Publish {
            topic: topic.to_string(),
            message: parse_payload(text),
        })),
        ("msg", Some(to), Some(text)) => Ok(Some(ClientCommand::Message {
            to: to.to_string(),
            message: parse_payload(text),
        })),
        ("sub", ..) => Err(anyhow!("usage: sub <topic>")),
        ("pub", ..) => Err(anyhow!("usage: pub <topic> <message>")),
        ("msg", ..) => Err(anyhow!("usage: msg <service> <message>")),
        (other, ..) => Err(anyhow!(
            "unknown command '{other}'; expected sub, pub, msg or /quit"
        )),
    }
}

/// JSON when the text parses as JSON, otherwise a plain string.
fn parse_payload(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
}

fn payload_text(message: &Value) -> String {
    match message {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn sender(from: Option<&str>) -> &str {
    from.unwrap_or("anonymous")
}

fn render_presence(update: &PresenceUpdate) -> String {
    let service = update.service.as_deref().unwrap_or("unknown");
    match update.action {
        PresenceAction::Current => format!("*** online: {}", update.services.join(", ")),
        PresenceAction::Join => format!("*** {service} joined"),
        PresenceAction::Leave => format!("*** {service} left"),
    }
}

fn emit(render_tx: &RenderTx, rendered: Rendered) -> Result<()> {
    render_tx
        .send(rendered)
        .map_err(|_| anyhow!("terminal output closed"))
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn flush_rendered(render_rx: &mut mpsc::UnboundedReceiver<Rendered>) -> io::Result<()> {
    while let Ok(rendered) = render_rx.try_recv() {
        write_rendered(rendered).await?;
    }
    Ok(())
}

async fn write_rendered(rendered: Rendered) -> io::Result<()> {
    match rendered {
        Rendered::Out(line) => write_stdout(&line).await,
        Rendered::Err(line) => write_stderr(&line).await,
    }
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
