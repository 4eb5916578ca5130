use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::protocol::{Frame, OpCode, PunishmentKind, Timeout};

#[derive(Parser, Debug)]
#[command(name = "parole")]
#[command(about = "Punishment expiry relay and debug client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run as server (default behavior if no command specified)
    #[arg(long)]
    pub server: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Talk to a running relay the way the controller would
    Debug {
        /// Relay URL (e.g., ws://localhost:4025)
        #[arg(short, long, default_value = "ws://localhost:4025")]
        url: String,

        /// Shared secret presented in the Authorization header
        #[arg(short, long, env = "PAROLE_AUTH")]
        auth: String,

        #[command(subcommand)]
        command: DebugCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum DebugCommands {
    /// Connect as the controller and print every frame the relay pushes
    Watch,

    /// Schedule a punishment expiry
    Schedule {
        #[arg(long)]
        guild: String,

        #[arg(long)]
        user: String,

        /// Punishment kind: ban, mute, voice_ban or voice_mute
        #[arg(long, value_parser = parse_kind, default_value = "mute")]
        kind: PunishmentKind,

        /// Delay until expiry, in seconds
        #[arg(long, default_value_t = 60)]
        seconds: u64,

        #[arg(long)]
        moderator: Option<String>,

        #[arg(long)]
        reason: Option<String>,
    },

    /// List every timeout record the relay still holds unconfirmed
    Pending,
}

fn parse_kind(raw: &str) -> Result<PunishmentKind, String> {
    match raw {
        "ban" => Ok(PunishmentKind::Ban),
        "mute" => Ok(PunishmentKind::Mute),
        "voice_ban" => Ok(PunishmentKind::VoiceBan),
        "voice_mute" => Ok(PunishmentKind::VoiceMute),
        other => Err(format!("unknown punishment kind: {other}")),
    }
}

type Relay = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub async fn run_debug_client(url: String, auth: String, command: DebugCommands) -> Result<()> {
    debug!("connecting to {url}");

    let mut request = url.as_str().into_client_request()?;
    request
        .headers_mut()
        .insert(AUTHORIZATION, HeaderValue::from_str(&auth)?);

    let (relay, _) = match timeout(Duration::from_secs(5), connect_async(request)).await {
        Ok(Ok(connected)) => connected,
        Ok(Err(err)) => return Err(anyhow!("connection failed: {err}")),
        Err(_) => return Err(anyhow!("connection timeout - is the relay running?")),
    };
    let (mut write, mut read) = relay.split();

    let ready = timeout(Duration::from_secs(5), next_frame(&mut read))
        .await
        .map_err(|_| anyhow!("timed out waiting for the ready frame"))??;
    if ready.op != OpCode::Ready {
        bail!("expected a ready frame, got {:?}", ready.op);
    }
    debug!("relay is ready");

    match command {
        DebugCommands::Watch => loop {
            let frame = next_frame(&mut read).await?;
            match frame.op {
                OpCode::Apply => match frame.timeout_payload() {
                    Ok(expiry) => println!("{}", describe(&expiry)),
                    Err(err) => eprintln!("undecodable apply frame: {err}"),
                },
                op => println!("<- {op:?}"),
            }
        },

        DebugCommands::Schedule {
            guild,
            user,
            kind,
            seconds,
            moderator,
            reason,
        } => {
            let issued_at = Utc::now().timestamp_millis();
            let expiry = Timeout {
                kind,
                guild_id: guild,
                user_id: user,
                moderator_id: moderator,
                issued_at,
                expires_at: issued_at + (seconds as i64) * 1000,
                reason,
            };
            send_frame(&mut write, &Frame::request(&expiry)).await?;
            println!("scheduled: {}", describe(&expiry));
            write.send(Message::Close(None)).await?;
        }

        DebugCommands::Pending => {
            send_frame(&mut write, &Frame::request_all()).await?;
            let back = timeout(Duration::from_secs(10), async {
                loop {
                    let frame = next_frame(&mut read).await?;
                    if frame.op == OpCode::RequestAllBack {
                        return Ok::<_, anyhow::Error>(frame);
                    }
                }
            })
            .await
            .map_err(|_| anyhow!("timed out waiting for the pending listing"))??;

            let records: HashMap<String, Timeout> = serde_json::from_value(
                back.d.ok_or_else(|| anyhow!("pending listing had no payload"))?,
            )?;

            if records.is_empty() {
                println!("no pending timeouts");
            } else {
                let mut keys: Vec<_> = records.keys().cloned().collect();
                keys.sort();
                for key in keys {
                    println!("{key}: {}", describe(&records[&key]));
                }
            }
            write.send(Message::Close(None)).await?;
        }
    }

    Ok(())
}

async fn send_frame(
    write: &mut futures_util::stream::SplitSink<Relay, Message>,
    frame: &Frame,
) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn next_frame(read: &mut futures_util::stream::SplitStream<Relay>) -> Result<Frame> {
    while let Some(message) = read.next().await {
        match message? {
            Message::Text(text) => return Ok(serde_json::from_str(&text)?),
            Message::Close(_) => bail!("relay closed the connection"),
            _ => {}
        }
    }
    bail!("connection closed unexpectedly")
}

fn describe(expiry: &Timeout) -> String {
    let when = DateTime::<Utc>::from_timestamp_millis(expiry.expires_at)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| format!("@{}", expiry.expires_at));
    let mut line = format!(
        "{:?} expiry for user {} in guild {} at {when}",
        expiry.kind, expiry.user_id, expiry.guild_id
    );
    if let Some(reason) = &expiry.reason {
        line.push_str(&format!(" ({reason})"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_deadline::deadline]
    fn kind_parsing_matches_the_wire_names() {
        assert_eq!(parse_kind("ban").unwrap(), PunishmentKind::Ban);
        assert_eq!(parse_kind("voice_mute").unwrap(), PunishmentKind::VoiceMute);
        assert!(parse_kind("tempban").is_err());
    }

    #[test_deadline::deadline]
    fn describe_renders_the_expiry_instant() {
        let expiry = Timeout {
            kind: PunishmentKind::Ban,
            guild_id: "g1".to_string(),
            user_id: "u1".to_string(),
            moderator_id: None,
            issued_at: 0,
            expires_at: 0,
            reason: Some("raid".to_string()),
        };
        let line = describe(&expiry);
        assert!(line.contains("1970-01-01"));
        assert!(line.contains("(raid)"));
    }
}
