use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Parser;
use client_core::{
    config::load_settings_from, day_boundary, delivery_status, load_settings, AuthToken,
    ChannelHub, ConversationSession, DeliveryStatus, HttpMessageApi, ImageUpload, MediaTile,
    MessageApi, MessageRecord, OutgoingMessage, SendFailure, SessionEvent, SessionOptions,
    WsChannel,
};
use shared::{
    domain::{ConversationId, MessageKind, UserId},
    protocol::CommissionRequestDetails,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    conversation: String,
    #[arg(long)]
    user_id: String,
    /// Overrides `api_url` from client.toml / CHAT_API_URL.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    realtime_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, PartialEq)]
enum Command {
    Send(String),
    Image(PathBuf),
    Commission {
        title: String,
        budget: Option<f64>,
        content: String,
    },
    Refresh,
    Gallery,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };

    let (name, argument) = rest.split_once(' ').unwrap_or((rest, ""));
    let argument = argument.trim();
    let command = match name {
        "refresh" => Command::Refresh,
        "gallery" => Command::Gallery,
        "image" if !argument.is_empty() => Command::Image(PathBuf::from(argument)),
        "commission" => {
            // /commission <title> | <budget> | <message>
            let mut parts = argument.splitn(3, '|').map(str::trim);
            let title = parts.next().unwrap_or_default().to_string();
            let budget = parts.next().and_then(|raw| raw.parse::<f64>().ok());
            let content = parts.next().unwrap_or_default().to_string();
            if title.is_empty() || content.is_empty() {
                bail!("usage: /commission <title> | <budget> | <message>");
            }
            Command::Commission {
                title,
                budget,
                content,
            }
        }
        "image" => bail!("usage: /image <path>"),
        other => bail!("unknown command /{other}"),
    };
    Ok(Some(command))
}

fn mime_type_for(path: &std::path::Path) -> Option<String> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => return None,
    };
    Some(mime.to_string())
}

fn describe(record: &MessageRecord) -> String {
    match record.kind {
        MessageKind::Text => record.content.clone().unwrap_or_default(),
        MessageKind::Image => format!("[image] {}", record.media_url.as_deref().unwrap_or("?")),
        MessageKind::CommissionRequest => {
            let details = record.commission_details().unwrap_or_default();
            let budget = details
                .budget
                .map(|budget| format!(" ({budget:.2})"))
                .unwrap_or_default();
            format!(
                "[commission] {}{budget}: {}",
                details.title.as_deref().unwrap_or("untitled"),
                record.content.as_deref().unwrap_or_default()
            )
        }
        MessageKind::Other => "[unsupported message]".to_string(),
    }
}

fn render(records: &[MessageRecord], local_user: &UserId) {
    for (index, record) in records.iter().enumerate() {
        let local_time = record.created_at.with_timezone(&Local);
        if day_boundary(records, index) {
            println!("--- {} ---", local_time.format("%A, %B %-d %Y"));
        }
        let status = match delivery_status(records, index, local_user) {
            Some(DeliveryStatus::Sending) => " (sending)",
            Some(DeliveryStatus::Read) => " (read)",
            Some(DeliveryStatus::Delivered) | None => "",
        };
        println!(
            "{} {}: {}{status}",
            local_time.format("%H:%M"),
            record.sender_id,
            describe(record)
        );
    }
}

fn render_gallery(records: &[MessageRecord], settings: &client_core::ClientSettings) {
    let tiles: Vec<MediaTile> = records
        .iter()
        .filter(|record| record.kind == MessageKind::Image)
        .filter_map(|record| {
            Some(MediaTile {
                id: record.id.to_string(),
                image_url: record.media_url.clone()?,
                aspect_ratio: record
                    .metadata
                    .as_ref()
                    .and_then(|metadata| metadata.get("aspectRatio"))
                    .and_then(|value| value.as_str())
                    .map(str::to_string),
            })
        })
        .collect();
    if tiles.is_empty() {
        println!("no images in this conversation");
        return;
    }

    let columns = settings.masonry_layout().arrange(&tiles);
    for (index, column) in columns.columns.iter().enumerate() {
        println!("column {} ({:.0}px)", index + 1, column.height);
        for &item in &column.items {
            println!("  {}", tiles[item].image_url);
        }
    }
}

async fn run_command(session: &ConversationSession, command: Command) -> Result<()> {
    match command {
        Command::Send(text) => {
            session.send_text(&text).await?;
        }
        Command::Image(path) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("upload")
                .to_string();
            session
                .send_image(ImageUpload {
                    filename,
                    mime_type: mime_type_for(&path),
                    bytes,
                })
                .await?;
        }
        Command::Commission {
            title,
            budget,
            content,
        } => {
            let details = CommissionRequestDetails {
                title: Some(title),
                budget,
                ..CommissionRequestDetails::default()
            };
            session
                .send(OutgoingMessage::commission_request(content, details)?)
                .await?;
        }
        Command::Refresh => session.refresh().await?,
        Command::Gallery => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    if let Some(realtime_url) = args.realtime_url {
        settings.realtime_url = Some(realtime_url);
    }
    if let Some(token) = args.token {
        settings.auth_token = Some(token);
    }

    let token = AuthToken::new(
        settings
            .auth_token
            .clone()
            .context("no auth token: pass --token or set CHAT_AUTH_TOKEN")?,
    );
    let api: Arc<dyn MessageApi> =
        Arc::new(HttpMessageApi::new(settings.api_base_url(), token.clone()));
    let channel = WsChannel::connect(
        &settings.resolved_realtime_url()?,
        token,
        settings.reconnect_delay(),
    )?;
    let hub = ChannelHub::new(Arc::new(channel));

    let local_user = UserId::from(args.user_id.as_str());
    let session = Arc::new(
        ConversationSession::open(
            api,
            &hub,
            ConversationId::from(args.conversation.as_str()),
            local_user.clone(),
            SessionOptions::from(&settings),
        )
        .await?,
    );

    match session.conversation().await {
        Ok(summary) => {
            let with = summary
                .counterpart(&local_user)
                .map(|participant| participant.display_name.clone());
            println!(
                "== {} ==",
                summary.title.or(with).unwrap_or_else(|| summary.id.to_string())
            );
        }
        Err(err) => warn!("failed to load conversation details: {err:#}"),
    }
    render(&session.snapshot().await, &local_user);

    let printer = tokio::spawn({
        let session = Arc::clone(&session);
        let local_user = local_user.clone();
        let mut events = session.subscribe_events();
        async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SessionEvent::TimelineChanged => {
                        println!();
                        render(&session.snapshot().await, &local_user);
                    }
                    SessionEvent::PendingExpired { local_id } => {
                        warn!(local_id = %local_id, "message was never confirmed");
                    }
                    SessionEvent::Error(message) => warn!("{message}"),
                    SessionEvent::SendFailed { .. } => {}
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                println!("{err}");
                continue;
            }
        };
        if command == Command::Gallery {
            render_gallery(&session.snapshot().await, &settings);
            continue;
        }
        if let Err(err) = run_command(&session, command).await {
            match err.downcast_ref::<SendFailure>() {
                Some(failure) => println!(
                    "not sent ({}); draft: {}",
                    failure.source,
                    failure.draft.draft_text().unwrap_or("[image]")
                ),
                None => println!("error: {err:#}"),
            }
        }
    }

    printer.abort();
    let _ = printer.await;
    if let Some(session) = Arc::into_inner(session) {
        session.close().await?;
    }
    info!("bye");
    Ok(())
}
