//! `diligent chat`: line-oriented terminal client driving a `SessionManager`.
//!
//! Plain lines are sent to the focused conversation; slash commands switch
//! focus. Logs go to a file so they never interleave with the conversation.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use diligent_session::{
    ApiClient, ApiError, ConnectOptions, Feed, FileIdentityStore, Identity, IdentityId,
    IdentityStore, Notice, Origin, PeerKey, PeerRef, SessionCommand, SessionManager,
    SessionUpdate, WsConnector,
};

use crate::config::DiligentConfig;

#[derive(clap::Args)]
pub struct ChatArgs {
    /// Server base URL (defaults to [client] server_url)
    #[arg(long)]
    pub server: Option<String>,

    /// Log in (or register) as this user instead of the saved identity
    #[arg(short, long)]
    pub username: Option<String>,

    /// Password (prompted when omitted)
    #[arg(long)]
    pub password: Option<String>,

    /// Create the account first
    #[arg(long, requires = "email")]
    pub register: bool,

    /// Email for --register
    #[arg(long)]
    pub email: Option<String>,

    /// Avatar image (URL or data URI) to set if none is set yet
    #[arg(long)]
    pub avatar: Option<String>,

    /// Reconnect with backoff when the connection drops
    #[arg(long)]
    pub reconnect: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

/// One line of user input.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Input {
    Message(String),
    Contacts,
    Open(String),
    General,
    Close,
    Reconnect,
    Logout,
    Quit,
    Help,
    Unknown(String),
}

pub(crate) fn parse_input(line: &str) -> Input {
    let trimmed = line.trim();
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Message(line.trim_end_matches(['\r', '\n']).to_string());
    };
    let (name, arg) = match command.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (command, ""),
    };
    match name {
        "contacts" => Input::Contacts,
        "open" | "o" if !arg.is_empty() => Input::Open(arg.to_string()),
        "general" | "g" => Input::General,
        "close" => Input::Close,
        "reconnect" => Input::Reconnect,
        "logout" => Input::Logout,
        "quit" | "q" | "exit" => Input::Quit,
        "help" | "h" => Input::Help,
        _ => Input::Unknown(trimmed.to_string()),
    }
}

const HELP: &str = "\
  /contacts        list people you can talk to
  /open <name>     open a conversation
  /general         open the General room
  /close           back to the welcome view
  /reconnect       retry the connection
  /logout          forget this identity and quit
  /quit            quit";

/// Turns session updates into printable lines.
pub(crate) struct ChatView {
    me: Identity,
    names: HashMap<IdentityId, String>,
    focused: Option<PeerKey>,
    printed: usize,
    last_seq: Option<u64>,
}

impl ChatView {
    pub(crate) fn new(me: Identity) -> Self {
        Self {
            me,
            names: HashMap::new(),
            focused: None,
            printed: 0,
            last_seq: None,
        }
    }

    pub(crate) fn set_contacts(&mut self, contacts: &[Identity]) {
        self.names = contacts
            .iter()
            .map(|c| (c.id.clone(), c.username.clone()))
            .collect();
    }

    /// Apply a finished `/contacts` refresh and list who can be opened.
    /// A failed refresh keeps the previous list.
    pub(crate) fn refreshed_contacts(
        &mut self,
        contacts: &mut Vec<Identity>,
        fetched: Result<Vec<Identity>, ApiError>,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        match fetched {
            Ok(c) => {
                *contacts = c;
                self.set_contacts(contacts.as_slice());
            }
            Err(e) => lines.push(format!("! could not load contacts ({e})")),
        }
        lines.push("  General".to_string());
        lines.extend(contacts.iter().map(|c| format!("  {}", c.username)));
        lines
    }

    fn name_of(&self, id: &IdentityId) -> String {
        if *id == self.me.id {
            return "you".to_string();
        }
        self.names
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string())
    }

    fn peer_name(&self, peer: &PeerKey) -> String {
        match peer {
            PeerKey::Broadcast => "General".to_string(),
            PeerKey::User(id) => self.name_of(id),
        }
    }

    fn switch_to(&mut self, peer: Option<PeerKey>) -> Vec<String> {
        self.printed = 0;
        self.last_seq = None;
        self.focused = peer;
        match &self.focused {
            Some(peer) => vec![format!("── {} ──", self.peer_name(peer))],
            None => vec![format!(
                "Welcome, {}! Pick a conversation with /open <name> or /general.",
                self.me.username
            )],
        }
    }

    pub(crate) fn render(&mut self, update: &SessionUpdate) -> Vec<String> {
        match update {
            SessionUpdate::FeedLoading { peer } => {
                let mut lines = self.switch_to(Some(peer.clone()));
                lines.push("loading history...".to_string());
                lines
            }
            SessionUpdate::FeedChanged { peer, feed } => self.render_feed(peer, feed),
            SessionUpdate::FocusCleared => self.switch_to(None),
            SessionUpdate::ConnectionChanged(state) => vec![format!("[{state}]")],
            SessionUpdate::Notice(notice) => vec![self.render_notice(notice)],
        }
    }

    fn render_feed(&mut self, peer: &PeerKey, feed: &Feed) -> Vec<String> {
        let mut lines = Vec::new();
        if self.focused.as_ref() != Some(peer) {
            lines.extend(self.switch_to(Some(peer.clone())));
        }

        // A history load can rebuild the feed; reprint when what we showed
        // is no longer its prefix.
        let continues = self.printed == 0
            || (self.printed <= feed.len()
                && Some(feed.messages()[self.printed - 1].seq) == self.last_seq);
        if !continues {
            lines.extend(self.switch_to(Some(peer.clone())));
        }

        for message in feed.tail_from(self.printed) {
            let author = match message.origin {
                Origin::Local => "you".to_string(),
                Origin::Remote => self.name_of(&message.author),
            };
            lines.extend(format_body(&author, &message.body));
        }
        self.printed = feed.len();
        self.last_seq = feed.last().map(|m| m.seq);
        lines
    }

    fn render_notice(&self, notice: &Notice) -> String {
        match notice {
            Notice::NotSent { body, reason, .. } => format!("! not sent ({reason}): {body}"),
            Notice::HistoryFailed { peer, error } => format!(
                "! could not load history with {} ({error}); showing new messages only",
                self.peer_name(peer)
            ),
            Notice::PersistFailed { peer, error, .. } => format!(
                "! delivered to {} but not saved ({error})",
                self.peer_name(peer)
            ),
            Notice::ConnectFailed(error) => {
                format!("! could not connect ({error}); type /reconnect to retry")
            }
        }
    }
}

/// `author: body`, with fenced code blocks indented under the author line.
pub(crate) fn format_body(author: &str, body: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut in_code = false;
    let mut first = true;
    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_code = !in_code;
            if first {
                lines.push(format!("{author}:"));
                first = false;
            }
            continue;
        }
        let text = if in_code {
            format!("    {line}")
        } else {
            line.to_string()
        };
        if first {
            lines.push(format!("{author}: {text}"));
            first = false;
        } else {
            lines.push(format!("{:width$}  {text}", "", width = author.len()));
        }
    }
    if first {
        lines.push(format!("{author}:"));
    }
    lines
}

/// An SVG placeholder avatar with the user's initial.
pub(crate) fn default_avatar(username: &str) -> String {
    let initial = username
        .chars()
        .next()
        .map(|c| c.to_uppercase().to_string())
        .unwrap_or_else(|| "?".to_string());
    format!(
        "data:image/svg+xml;utf8,<svg xmlns='http://www.w3.org/2000/svg' viewBox='0 0 64 64'>\
<circle cx='32' cy='32' r='32' fill='%234e0eff'/>\
<text x='32' y='42' font-size='30' text-anchor='middle' fill='white'>{initial}</text></svg>"
    )
}

fn init_file_logging(config: &DiligentConfig, debug: bool) -> Result<()> {
    let path = config.chat_log_path();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open log file: {}", path.display()))?;

    let default_directive = if debug {
        "diligent=debug,diligent_session=debug,info"
    } else {
        "diligent=info,diligent_session=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file)),
        )
        .with(env_filter)
        .init();
    Ok(())
}

async fn prompt_password() -> Result<String> {
    tokio::task::spawn_blocking(|| {
        rpassword::prompt_password("Password: ")
            .map_err(|e| anyhow::anyhow!("Failed to read password: {}", e))
    })
    .await?
}

async fn resolve_identity(
    api: &ApiClient,
    store: &FileIdentityStore,
    args: &ChatArgs,
) -> Result<Identity> {
    let Some(username) = args.username.as_deref() else {
        return store
            .current_identity()
            .context("Failed to read saved identity")?
            .context("Not logged in. Run `diligent chat --username <name>` first.");
    };

    let password = match &args.password {
        Some(p) => p.clone(),
        None => prompt_password().await?,
    };

    let identity = if args.register {
        let email = args.email.as_deref().context("--register needs --email")?;
        api.register(username, email, &password)
            .await
            .context("Registration failed")?
    } else {
        api.login(username, &password)
            .await
            .context("Login failed")?
    };
    Ok(identity)
}

/// `diligent chat`
pub async fn chat_command(config: &DiligentConfig, args: ChatArgs) -> Result<()> {
    init_file_logging(config, args.debug)?;

    let server_url = args
        .server
        .clone()
        .unwrap_or_else(|| config.file.client.server_url.clone());
    let api = ApiClient::new(server_url);
    let identity_store = FileIdentityStore::in_dir(&config.data_dir);

    let mut identity = resolve_identity(&api, &identity_store, &args).await?;
    if !identity.avatar_set {
        let image = args
            .avatar
            .clone()
            .unwrap_or_else(|| default_avatar(&identity.username));
        identity = api
            .set_avatar(&identity, &image)
            .await
            .context("Failed to set avatar")?;
        eprintln!("Avatar set.");
    }
    info!(user = %identity.id, server = %api.base_url(), "Starting chat");

    let mut contacts = match api.contacts(&identity.id).await {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to load contacts: {}", e);
            Vec::new()
        }
    };

    let connector = WsConnector::with_options(
        api.ws_url(),
        ConnectOptions {
            connect_timeout: config.file.client.connect_timeout(),
        },
    );
    let (session, mut updates) = SessionManager::new(connector, api.message_store());
    let session = session
        .with_identity_store(identity_store)
        .with_auto_reconnect(args.reconnect);

    let (commands, commands_rx) = mpsc::unbounded_channel();
    let session_task = tokio::spawn(session.run(commands_rx));

    let mut view = ChatView::new(identity.clone());
    view.set_contacts(&contacts);
    for line in view.render(&SessionUpdate::FocusCleared) {
        println!("{line}");
    }
    let _ = commands.send(SessionCommand::Login(identity.clone()));

    // Contact refreshes run off the input loop and report back here
    let (contacts_tx, mut contacts_rx) = mpsc::unbounded_channel();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_input(&line) {
                    Input::Message(body) => {
                        let _ = commands.send(SessionCommand::Send(body));
                    }
                    Input::Contacts => {
                        let api = api.clone();
                        let id = identity.id.clone();
                        let tx = contacts_tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(api.contacts(&id).await);
                        });
                    }
                    Input::Open(name) => match contacts.iter().find(|c| c.username == name) {
                        Some(contact) => {
                            let _ = commands.send(SessionCommand::Focus(Some(PeerRef::User(contact.clone()))));
                        }
                        None => println!("! no contact named {name} (try /contacts)"),
                    },
                    Input::General => {
                        let _ = commands.send(SessionCommand::Focus(Some(PeerRef::Broadcast)));
                    }
                    Input::Close => {
                        let _ = commands.send(SessionCommand::Focus(None));
                    }
                    Input::Reconnect => {
                        let _ = commands.send(SessionCommand::Reconnect);
                    }
                    Input::Logout => {
                        let _ = commands.send(SessionCommand::Logout);
                        println!("Logged out.");
                        break;
                    }
                    Input::Quit => break,
                    Input::Help => println!("{HELP}"),
                    Input::Unknown(cmd) => println!("! unknown command {cmd} (try /help)"),
                }
            }
            update = updates.recv() => {
                let Some(update) = update else { break };
                for line in view.render(&update) {
                    println!("{line}");
                }
            }
            Some(fetched) = contacts_rx.recv() => {
                for line in view.refreshed_contacts(&mut contacts, fetched) {
                    println!("{line}");
                }
            }
        }
    }

    let _ = commands.send(SessionCommand::Shutdown);
    session_task.await.context("Session task panicked")?;
    Ok(())
}

/// `diligent logout`
pub fn logout_command(config: &DiligentConfig) -> Result<()> {
    let store = FileIdentityStore::in_dir(&config.data_dir);
    match store.current_identity() {
        Ok(Some(identity)) => eprintln!("Logging out {}", identity.username),
        Ok(None) => eprintln!("Not logged in."),
        Err(e) => warn!("Saved identity unreadable: {}", e),
    }
    store.clear().context("Failed to clear saved identity")?;
    Ok(())
}
