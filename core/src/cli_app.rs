use crate::config::ClientConfig;
use crate::messenger_types::{ChatEvent, Message};
use crate::session::Session;
use crate::sync::ChatState;
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

type Input = Lines<BufReader<Stdin>>;

/// Line-oriented chat front end shared by the `chat` binary.
pub async fn run(config: ClientConfig) -> anyhow::Result<()> {
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let session = authenticate(&config, &mut input).await?;

    println!(
        "{} Signed in as {}",
        "✓".green(),
        session.user().username.cyan().bold()
    );
    println!("  Type {} for commands.", "/help".cyan());

    let events = session.sync().subscribe();
    let me = session.user().id.clone();
    let printer = tokio::spawn(follow_events(events, move |event| match event {
        ChatEvent::NewMessage { message } => {
            print_message(&message, &me);
            true
        }
        ChatEvent::MessageDelivered { message_id } => {
            println!("  {} delivered {}", "✓".green(), message_id.dimmed());
            true
        }
        ChatEvent::SendFailed { reason, .. } => {
            println!("{} Message not sent: {}", "✗".red().bold(), reason.red());
            true
        }
        ChatEvent::SessionExpired => {
            println!(
                "{}",
                "✗ Session expired, please sign in again".red().bold()
            );
            false
        }
    }));

    while let Some(line) = input.next_line().await? {
        if session.sync().is_closed() {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !handle_line(&session, line).await? {
            break;
        }
    }

    printer.abort();
    if !session.sync().is_closed() {
        session.logout().await?;
    }
    Ok(())
}

/// Feed events to `on_event` until the channel closes or it returns false.
/// Falling behind only skips the overwritten events.
async fn follow_events<F>(mut events: broadcast::Receiver<ChatEvent>, mut on_event: F)
where
    F: FnMut(ChatEvent) -> bool,
{
    loop {
        match events.recv().await {
            Ok(event) => {
                if !on_event(event) {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Display fell behind, skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn authenticate(config: &ClientConfig, input: &mut Input) -> anyhow::Result<Session> {
    if let Ok(token) = std::env::var("CHATSYNC_TOKEN") {
        return Ok(Session::resume(config, &token).await?);
    }

    let email = match std::env::var("CHATSYNC_EMAIL") {
        Ok(email) => email,
        Err(_) => prompt(input, "email").await?,
    };
    let password = match std::env::var("CHATSYNC_PASSWORD") {
        Ok(password) => password,
        Err(_) => prompt(input, "password").await?,
    };

    if let Ok(username) = std::env::var("CHATSYNC_REGISTER") {
        return Ok(Session::register(config, &username, &email, &password).await?);
    }
    Ok(Session::login(config, &email, &password).await?)
}

async fn prompt(input: &mut Input, label: &str) -> anyhow::Result<String> {
    println!("{}:", label.bright_white().bold());
    input
        .next_line()
        .await?
        .map(|s| s.trim().to_string())
        .ok_or_else(|| anyhow::anyhow!("stdin closed while reading {}", label))
}

/// Returns false when the user asked to quit.
async fn handle_line(session: &Session, line: &str) -> anyhow::Result<bool> {
    let sync = session.sync();
    let (command, arg) = match line.split_once(' ') {
        Some((c, a)) => (c, a.trim()),
        None => (line, ""),
    };

    match command {
        "/quit" | "/exit" => return Ok(false),
        "/help" => print_usage(),
        "/list" => {
            let state = sync.snapshot().await?;
            print_conversations(&state);
        }
        "/users" => match session.users().await {
            Ok(users) => {
                for user in users {
                    let status = if user.is_online {
                        "●".green()
                    } else {
                        "○".dimmed()
                    };
                    println!("  {} {} {}", status, user.username.cyan(), user.id.dimmed());
                }
            }
            Err(e) => println!("{} {}", "✗".red().bold(), e),
        },
        "/open" => {
            if arg.is_empty() {
                println!("{}", "Usage: /open <user_id>".yellow());
            } else {
                sync.set_active_conversation(Some(arg.to_string()))?;
                println!("  opened {}", arg.cyan());
            }
        }
        "/close" => sync.set_active_conversation(None)?,
        "/more" => sync.load_more_messages()?,
        "/history" => {
            let state = sync.snapshot().await?;
            print_history(&state);
        }
        "/read" => match active_peer(session).await? {
            Some(peer) => sync.mark_as_read(&peer)?,
            None => println!("{}", "No open conversation".yellow()),
        },
        "/typing" => match active_peer(session).await? {
            Some(peer) => sync.notify_typing(&peer, arg != "off")?,
            None => println!("{}", "No open conversation".yellow()),
        },
        other if other.starts_with('/') => {
            println!("{} Unknown command: {}", "✗".red().bold(), other.red());
        }
        _ => match active_peer(session).await? {
            Some(peer) => sync.send_message(line, &peer)?,
            None => println!("{}", "Open a conversation first: /open <user_id>".yellow()),
        },
    }
    Ok(true)
}

async fn active_peer(session: &Session) -> anyhow::Result<Option<String>> {
    Ok(session.sync().snapshot().await?.active)
}

pub fn print_usage() {
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                List conversations", "/list".cyan());
    println!("  {}               List users", "/users".cyan());
    println!("  {} <user_id>      Open a conversation", "/open".cyan());
    println!("  {}               Close the conversation", "/close".cyan());
    println!("  {}                Load older messages", "/more".cyan());
    println!("  {}             Show loaded messages", "/history".cyan());
    println!("  {}                Mark conversation read", "/read".cyan());
    println!("  {} [off]        Send typing indicator", "/typing".cyan());
    println!("  {}                Sign out and exit", "/quit".cyan());
    println!("  anything else       Send to the open conversation");
}

fn print_conversations(state: &ChatState) {
    if state.conversations.is_empty() {
        println!("  {}", "no conversations yet".dimmed());
        return;
    }
    for conv in &state.conversations {
        let peer = conv.peer_id();
        let online = if state.is_online(peer) {
            "●".green()
        } else {
            "○".dimmed()
        };
        let unread = if conv.unread_count > 0 {
            format!(" ({})", conv.unread_count).yellow().bold()
        } else {
            "".normal()
        };
        let typing = if state.is_typing(peer) {
            " typing…".italic().dimmed()
        } else {
            "".normal()
        };
        let preview = conv
            .last_message
            .as_ref()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        println!(
            "  {} {}{}{} {} {}",
            online,
            conv.user.username.cyan(),
            unread,
            typing,
            peer.dimmed(),
            preview
        );
    }
}

fn print_history(state: &ChatState) {
    match &state.active {
        Some(peer) => {
            if state.cursor.has_more {
                println!("  {}", "… /more for older messages".dimmed());
            }
            for msg in &state.messages {
                print_message(msg, &state.me.id);
            }
            if state.is_typing(peer) {
                println!("  {}", "typing…".italic().dimmed());
            }
        }
        None => println!("{}", "No open conversation".yellow()),
    }
}

fn print_message(msg: &Message, me: &str) {
    let time = msg.created_at.format("%H:%M");
    let marker = if msg.id.is_local() {
        "…".dimmed()
    } else if msg.is_read {
        "✓✓".green()
    } else if msg.is_delivered {
        "✓".green()
    } else {
        " ".normal()
    };
    if msg.sender_id() == me {
        println!(
            "  {} {} {} {}",
            time.to_string().dimmed(),
            "me".green().bold(),
            msg.content,
            marker
        );
    } else {
        println!(
            "  {} {} {}",
            time.to_string().dimmed(),
            msg.sender_id().cyan().bold(),
            msg.content
        );
    }
}
