use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use grammers_client::{Client, Config as ClientConfig, InitParams, SignInError, Update};
use grammers_mtsender::InvocationError;
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::TelegramError;
use crate::resolver::ChatRef;
use crate::transport::{
    ChatEntity, ChatKind, LiveEvent, MessageRecord, Transport, TransportError, TransportResult,
};

/// Connect to Telegram with the file-backed session from config.
/// `flood_sleep_threshold` is zeroed so FLOOD_WAIT surfaces to the resolver,
/// which owns the retry policy.
pub async fn connect(cfg: &Config) -> Result<Client> {
    if let Some(parent) = cfg.session.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating session directory: {}", parent.display()))?;
    }

    let session = Session::load_file_or_create(&cfg.session)
        .map_err(|e| TelegramError::Connection(format!("failed to load session: {e}")))?;

    let client = Client::connect(ClientConfig {
        session,
        api_id: cfg.api_id,
        api_hash: cfg.api_hash.clone(),
        params: InitParams {
            device_model: "periscope".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            flood_sleep_threshold: 0,
            ..Default::default()
        },
    })
    .await
    .map_err(|e| TelegramError::Connection(e.to_string()))?;

    Ok(client)
}

pub fn save_session(client: &Client, cfg: &Config) {
    if let Err(e) = client.session().save_to_file(&cfg.session) {
        warn!(path = %cfg.session.display(), error = %e, "failed to save session");
    }
}

/// Interactive login flow (phone -> code -> optional 2FA).
pub async fn login(client: &Client, cfg: &Config) -> Result<()> {
    if client.is_authorized().await.unwrap_or(false) {
        let me = client.get_me().await.context("getting current user")?;
        println!(
            "Already logged in as {} (@{})",
            me.full_name(),
            me.username().unwrap_or("no username")
        );
        return Ok(());
    }

    print!("Phone number (with country code, e.g. +81...): ");
    std::io::stdout().flush()?;
    let mut phone = String::new();
    std::io::stdin().read_line(&mut phone)?;
    let phone = phone.trim().to_string();

    let token = client.request_login_code(&phone).await.map_err(|e| {
        let msg = e.to_string();
        if msg.contains("API_ID_INVALID") {
            anyhow::anyhow!(
                "invalid Telegram API credentials. Check api_id and api_hash in the config \
                 (get valid credentials at https://my.telegram.org)"
            )
        } else {
            anyhow::anyhow!(e).context("requesting login code")
        }
    })?;

    println!("Login code sent via Telegram.");
    print!("Enter code: ");
    std::io::stdout().flush()?;
    let mut code = String::new();
    std::io::stdin().read_line(&mut code)?;
    let code = code.trim();

    match client.sign_in(&token, code).await {
        Ok(user) => {
            println!(
                "Logged in as {} (@{})",
                user.full_name(),
                user.username().unwrap_or("no username")
            );
        }
        Err(SignInError::PasswordRequired(password_token)) => {
            let hint = password_token.hint().unwrap_or("none");
            println!("Two-factor authentication required (hint: {hint})");
            let password = rpassword::prompt_password_stdout("Enter 2FA password: ").context("reading 2FA password")?;

            let user = client
                .check_password(password_token, password)
                .await
                .map_err(|e| anyhow::anyhow!("2FA check failed: {e:?}"))?;

            println!(
                "Logged in as {} (@{})",
                user.full_name(),
                user.username().unwrap_or("no username")
            );
        }
        Err(SignInError::InvalidCode) => {
            anyhow::bail!("invalid verification code");
        }
        Err(other) => {
            anyhow::bail!("sign-in failed: {other:?}");
        }
    }

    save_session(client, cfg);
    Ok(())
}

/// Print session/connection status.
pub async fn status(client: &Client) -> Result<()> {
    match client.is_authorized().await {
        Ok(true) => {
            let me = client.get_me().await.context("getting current user")?;
            println!("Status: Connected");
            println!("  Name: {}", me.full_name());
            if let Some(username) = me.username() {
                println!("  Username: @{username}");
            }
        }
        Ok(false) => {
            println!("Status: Not authorized");
            println!("  Run 'periscope login' to authenticate.");
        }
        Err(e) => {
            println!("Status: Connection error");
            println!("  Error: {e}");
        }
    }
    Ok(())
}

fn map_invocation_error(e: InvocationError) -> TransportError {
    match &e {
        InvocationError::Rpc(rpc) if rpc.name == "FLOOD_WAIT" => {
            TransportError::FloodWait(rpc.value.unwrap_or(0) as u64)
        }
        _ => TransportError::Unavailable(e.to_string()),
    }
}

fn kind_of(ty: PackedType) -> ChatKind {
    match ty {
        PackedType::Broadcast | PackedType::Gigagroup => ChatKind::Channel,
        PackedType::Megagroup => ChatKind::Supergroup,
        PackedType::Chat => ChatKind::Chat,
        PackedType::User | PackedType::Bot => ChatKind::User,
    }
}

pub(crate) fn chat_entity(chat: &grammers_client::types::Chat) -> ChatEntity {
    ChatEntity {
        chat_id: chat.id(),
        username: chat.username().map(|u| u.to_string()),
        title: chat.name().to_string(),
        kind: kind_of(chat.pack().ty),
    }
}

/// `Transport` implementation over a grammers client. Packed peer references
/// (id + access hash) are remembered for every chat that passes through, so
/// later join/history calls can address them without another resolve.
pub struct TelegramTransport {
    client: Client,
    peers: Mutex<HashMap<i64, PackedChat>>,
}

impl TelegramTransport {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn remember(&self, chat: &grammers_client::types::Chat) -> ChatEntity {
        self.peers.lock().unwrap().insert(chat.id(), chat.pack());
        chat_entity(chat)
    }

    fn remember_tl_channel(&self, ch: &tl::types::Channel) -> ChatEntity {
        let ty = if ch.broadcast {
            PackedType::Broadcast
        } else if ch.gigagroup {
            PackedType::Gigagroup
        } else {
            PackedType::Megagroup
        };
        let packed = PackedChat {
            ty,
            id: ch.id,
            access_hash: ch.access_hash,
        };
        self.peers.lock().unwrap().insert(ch.id, packed);
        ChatEntity {
            chat_id: ch.id,
            username: ch.username.clone(),
            title: ch.title.clone(),
            kind: kind_of(ty),
        }
    }

    fn packed(&self, entity: &ChatEntity) -> TransportResult<PackedChat> {
        self.peers
            .lock()
            .unwrap()
            .get(&entity.chat_id)
            .copied()
            .ok_or_else(|| TransportError::Unavailable(format!("peer {} not cached", entity.chat_id)))
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn resolve(&self, reference: &ChatRef) -> TransportResult<Option<ChatEntity>> {
        let Some(username) = reference.username() else {
            // Invite links cannot be resolved without joining.
            return Ok(None);
        };
        match self.client.resolve_username(username).await {
            Ok(Some(chat)) => Ok(Some(self.remember(&chat))),
            Ok(None) => Ok(None),
            Err(e) => Err(map_invocation_error(e)),
        }
    }

    async fn join(&self, entity: &ChatEntity) -> TransportResult<()> {
        let packed = self.packed(entity)?;
        self.client.join_chat(packed).await.map_err(map_invocation_error)?;
        Ok(())
    }

    async fn accept_invite(&self, hash: &str) -> TransportResult<()> {
        let link = format!("https://t.me/+{hash}");
        self.client
            .accept_invite_link(&link)
            .await
            .map_err(map_invocation_error)?;
        Ok(())
    }

    async fn history(&self, entity: &ChatEntity, limit: usize, min_id: i64) -> TransportResult<Vec<MessageRecord>> {
        let packed = self.packed(entity)?;
        let mut iter = self.client.iter_messages(packed).limit(limit);
        let mut messages = Vec::new();
        while let Some(msg) = iter.next().await.map_err(map_invocation_error)? {
            let id = msg.id() as i64;
            if min_id > 0 && id <= min_id {
                break;
            }
            messages.push(MessageRecord {
                id,
                date: msg.date(),
                text: msg.text().to_string(),
            });
            if messages.len() >= limit {
                break;
            }
        }
        Ok(messages)
    }

    async fn search_channels(&self, query: &str, limit: usize) -> TransportResult<Vec<ChatEntity>> {
        let request = tl::functions::contacts::Search {
            q: query.to_string(),
            limit: limit as i32,
        };
        let tl::enums::contacts::Found::Found(found) =
            self.client.invoke(&request).await.map_err(map_invocation_error)?;

        let mut channels = Vec::new();
        for chat in &found.chats {
            if let tl::enums::Chat::Channel(ch) = chat
                && ch.username.is_some()
            {
                channels.push(self.remember_tl_channel(ch));
            }
        }
        Ok(channels)
    }

    async fn participant_count(&self, entity: &ChatEntity) -> TransportResult<Option<i64>> {
        let packed = self.packed(entity)?;
        let Some(channel) = packed.try_to_input_channel() else {
            return Ok(None);
        };
        let request = tl::functions::channels::GetFullChannel { channel };
        let tl::enums::messages::ChatFull::Full(full) =
            self.client.invoke(&request).await.map_err(map_invocation_error)?;
        match full.full_chat {
            tl::enums::ChatFull::ChannelFull(cf) => Ok(cf.participants_count.map(|c| c as i64)),
            tl::enums::ChatFull::Full(_) => Ok(None),
        }
    }

    async fn joined_dialogs(&self) -> TransportResult<Vec<ChatEntity>> {
        let mut dialogs = self.client.iter_dialogs();
        let mut entities = Vec::new();
        while let Some(dialog) = dialogs.next().await.map_err(map_invocation_error)? {
            entities.push(self.remember(dialog.chat()));
        }
        Ok(entities)
    }
}

/// Pump new-message updates from the client onto the broadcast bus the live
/// streams subscribe to. Update errors are logged and the pump keeps going.
pub fn spawn_update_pump(
    client: Client,
    events: broadcast::Sender<LiveEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("update pump started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                update = client.next_update() => {
                    match update {
                        Ok(Update::NewMessage(msg)) if !msg.outgoing() => {
                            let event = LiveEvent {
                                chat: chat_entity(&msg.chat()),
                                message: MessageRecord {
                                    id: msg.id() as i64,
                                    date: msg.date(),
                                    text: msg.text().to_string(),
                                },
                            };
                            // No live stream subscribed is fine.
                            let _ = events.send(event);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "error receiving update");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
            }
        }
        info!("update pump stopped");
    })
}
