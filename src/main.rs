use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use log::{error, info};
use papering_chat::models::FileUpload;
use papering_chat::{
    Authenticator, ChatConfig, ChatSession, HttpChatApi, MemorySession, MessageBody, SessionEvent,
    UserProfile, UserType,
};
use tokio::io::{AsyncBufReadExt, BufReader};

const USAGE: &str = "usage: papering-chat <request-id> <counterpart-id> [config.toml]";

fn session_from_env() -> MemorySession {
    let token = std::env::var("CHAT_TOKEN").ok();
    let profile = std::env::var("CHAT_USER_ID").ok().map(|user_id| UserProfile {
        user_id,
        user_type: std::env::var("CHAT_USER_TYPE")
            .ok()
            .as_deref()
            .and_then(UserType::parse)
            .unwrap_or(UserType::Web),
    });
    MemorySession::new(token, profile)
}

fn mime_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

async fn read_upload(path: &Path) -> std::io::Result<FileUpload> {
    let bytes = tokio::fs::read(path).await?;
    Ok(FileUpload {
        file_name: path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        mime_type: mime_type(path).to_string(),
        bytes,
    })
}

fn print_event(event: &SessionEvent) {
    match event {
        SessionEvent::MessageReceived(message) => {
            let text = match &message.body {
                MessageBody::Text(text) => text.clone(),
                body @ MessageBody::Attachment(_) => body.preview(),
            };
            println!("[{}] {}: {}", message.created_at.format("%H:%M"), message.sender_id, text);
        }
        SessionEvent::MessageConfirmed { message, .. } => {
            println!("(delivered {})", message.body.preview());
        }
        SessionEvent::SendFailed { error, restored_draft, .. } => {
            println!("(not delivered: {error})");
            if let Some(draft) = restored_draft {
                println!("(draft restored: {draft})");
            }
        }
        SessionEvent::CounterpartTyping(true) => println!("(typing...)"),
        SessionEvent::CounterpartTyping(false) => {}
        SessionEvent::MessagesRead(ids) => println!("(read: {ids:?})"),
        SessionEvent::Presence { user_id, status } => println!("({user_id} is {status:?})"),
        SessionEvent::Connection(status) => println!("(connection: {:?})", status.state),
        SessionEvent::Reconnecting { attempt, delay } => {
            println!("(reconnecting, attempt {attempt} in {delay:?})");
        }
        SessionEvent::ConnectionLost(error) => {
            println!("(connection lost: {error}; type /reconnect)");
        }
        SessionEvent::ServerError(message) => println!("(server: {message})"),
        SessionEvent::SignedOut => println!("(signed out)"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let (Some(request_id), Some(counterpart_id)) = (args.next(), args.next()) else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let Ok(request_id) = request_id.parse::<i64>() else {
        eprintln!("{USAGE}");
        return ExitCode::FAILURE;
    };
    let config_path = args.next().map(PathBuf::from);

    let config = match ChatConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let api = match HttpChatApi::new(&config) {
        Ok(api) => Arc::new(api),
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let auth = Authenticator::new(Arc::new(session_from_env()));
    let mut session = match ChatSession::new(&config, api, auth.subscribe()) {
        Ok(session) => session,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = session.open(request_id, &counterpart_id).await {
        error!("Could not open chat: {}", e);
        return ExitCode::FAILURE;
    }
    info!("Chat open; /more, /read, /file <path>, /reconnect, /quit");
    for message in session.messages() {
        print_event(&SessionEvent::MessageReceived(message.clone()));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let result = match line.trim() {
                    "/quit" => break,
                    "/more" => session.load_more().await.map(|_| ()),
                    "/read" => session.mark_all_read().await,
                    "/reconnect" => session.reconnect(),
                    cmd if cmd.starts_with("/file ") => {
                        let path = PathBuf::from(cmd.trim_start_matches("/file ").trim());
                        match read_upload(&path).await {
                            Ok(file) => session.upload_and_send(file).await.map(|_| ()),
                            Err(e) => {
                                error!("{}: {}", path.display(), e);
                                Ok(())
                            }
                        }
                    }
                    text => {
                        session.type_draft(text);
                        session.send(text).map(|_| ())
                    }
                };
                if let Err(e) = result {
                    error!("{}", e);
                }
            }
            event = session.next_event() => match event {
                Some(SessionEvent::SignedOut) => {
                    print_event(&SessionEvent::SignedOut);
                    break;
                }
                Some(event) => print_event(&event),
                None => break,
            },
        }
    }

    session.close().await;
    ExitCode::SUCCESS
}
