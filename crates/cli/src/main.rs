use clap::{Parser, Subcommand};
use lib::ai::ReplyGateway;
use lib::api::{BackendClient, ConversationGateway};
use lib::auth::{self, AuthGateway, IdentityProvider, SessionStore, StoredIdentity};
use lib::cache::ChatCache;
use lib::chat::{Chat, ChatEngine, Notice, SendError, Sender};
use lib::config;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "perch")]
#[command(about = "Perch chat client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create an account and sign in.
    Register {
        #[arg(long, short)]
        username: String,

        #[arg(long, short)]
        password: String,

        /// Account email (default: <username>@perch.local)
        #[arg(long)]
        email: Option<String>,

        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Sign in with an existing account.
    Login {
        #[arg(long, short)]
        username: String,

        #[arg(long, short)]
        password: String,

        /// Account email (default: <username>@perch.local)
        #[arg(long)]
        email: Option<String>,

        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Clear the stored session. Cached chats are kept for the next sign-in.
    Logout {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Load your conversations and chat interactively.
    Chat {
        /// Config file path (default: PERCH_CONFIG_PATH or ~/.perch/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("perch {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Register {
            username,
            password,
            email,
            config,
        }) => {
            if let Err(e) = run_register(config, username, password, email).await {
                log::error!("register failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Login {
            username,
            password,
            email,
            config,
        }) => {
            if let Err(e) = run_login(config, username, password, email).await {
                log::error!("login failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Logout { config }) => {
            if let Err(e) = run_logout(config).await {
                log::error!("logout failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat { config }) => {
            if let Err(e) = run_chat(config).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

struct App {
    base_url: String,
    session: Arc<SessionStore>,
    identity: Arc<StoredIdentity>,
    cache_dir: PathBuf,
}

fn open_app(config_path: Option<PathBuf>) -> anyhow::Result<App> {
    let (config, path) = config::load_config(config_path)?;
    let base_url = config::resolve_base_url(&config);
    Ok(App {
        session: Arc::new(SessionStore::open(auth::token_path(&path))),
        identity: Arc::new(StoredIdentity::new(auth::identity_path(&path))),
        cache_dir: config::resolve_cache_dir(&config, &path),
        base_url,
    })
}

async fn run_register(
    config_path: Option<PathBuf>,
    username: String,
    password: String,
    email: Option<String>,
) -> anyhow::Result<()> {
    let app = open_app(config_path)?;
    let gateway = AuthGateway::new(app.base_url.clone());
    let response = auth::sign_up(
        &gateway,
        &app.session,
        &app.identity,
        &username,
        &password,
        email.as_deref(),
    )
    .await?;
    match response.user {
        Some(user) => println!("registered and signed in as {}", user.uid),
        None => println!("registered and signed in"),
    }
    Ok(())
}

async fn run_login(
    config_path: Option<PathBuf>,
    username: String,
    password: String,
    email: Option<String>,
) -> anyhow::Result<()> {
    let app = open_app(config_path)?;
    let gateway = AuthGateway::new(app.base_url.clone());
    let response = auth::sign_in(
        &gateway,
        &app.session,
        &app.identity,
        &username,
        &password,
        email.as_deref(),
    )
    .await?;
    match response.user {
        Some(user) => println!("signed in as {}", user.uid),
        None => println!("signed in"),
    }
    Ok(())
}

async fn run_logout(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let app = open_app(config_path)?;
    auth::sign_out(&app.session, app.identity.as_ref()).await;
    println!("signed out");
    Ok(())
}

async fn run_chat(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    use std::io::Write;

    let app = open_app(config_path)?;
    let uid = app
        .identity
        .current_session()
        .await
        .ok_or_else(|| anyhow::anyhow!("not signed in; run `perch login` first"))?
        .uid;

    let backend = Arc::new(BackendClient::new(
        app.base_url.clone(),
        app.session.clone(),
        AuthGateway::new(app.base_url.clone()),
        app.identity.clone(),
    ));
    let engine = ChatEngine::new(
        backend.clone() as Arc<dyn ConversationGateway>,
        backend as Arc<dyn ReplyGateway>,
        ChatCache::new(app.cache_dir),
        uid,
    );

    engine.load().await;
    print_notices(&engine).await;
    print_overview(&engine).await;
    println!("type a message, or /new /list /select /delete /sync /quit");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('/') {
            let mut parts = rest.splitn(2, ' ');
            let command = parts.next().unwrap_or("");
            let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());
            match command {
                "quit" | "exit" => break,
                "list" => print_overview(&engine).await,
                "new" => {
                    engine.create_chat(arg).await;
                    if arg.is_some() {
                        print_reply(&engine).await;
                    }
                }
                "select" => match chat_id_at(&engine, arg).await {
                    Some(id) => {
                        engine.select_chat(&id).await;
                        if let Some(chat) = engine.current_chat().await {
                            print_thread(&chat);
                        }
                    }
                    None => println!("usage: /select <number> (see /list)"),
                },
                "delete" => match chat_id_at(&engine, arg).await {
                    Some(id) => engine.delete_chat(&id).await,
                    None => println!("usage: /delete <number> (see /list)"),
                },
                "sync" => engine.resync().await,
                _ => println!("unknown command: /{}", command),
            }
        } else {
            match engine.send_message(line).await {
                Ok(()) => print_reply(&engine).await,
                Err(SendError::NoActiveChat) => {
                    println!("no chat selected; use /new <message> or /select")
                }
                Err(SendError::ReplyInFlight) => {
                    println!("still composing a reply for this chat")
                }
            }
        }
        print_notices(&engine).await;
    }

    Ok(())
}

/// Resolve a 1-based /list index to a chat id.
async fn chat_id_at(engine: &ChatEngine, arg: Option<&str>) -> Option<String> {
    let index: usize = arg?.parse().ok()?;
    let chats = engine.chats().await;
    chats.get(index.checked_sub(1)?).map(|c| c.id.clone())
}

async fn print_overview(engine: &ChatEngine) {
    let chats = engine.chats().await;
    if chats.is_empty() {
        println!("no chats yet — start one with /new <message>");
        return;
    }
    let current = engine.current_id().await;
    for (i, chat) in chats.iter().enumerate() {
        let marker = if current.as_deref() == Some(chat.id.as_str()) {
            "*"
        } else {
            " "
        };
        println!("{} {:>2}. {} — {}", marker, i + 1, chat.title, chat.last_message);
    }
}

fn print_thread(chat: &Chat) {
    println!("— {} —", chat.title);
    for message in &chat.messages {
        match message.sender {
            Sender::User => println!("you> {}", message.text),
            Sender::Assistant => println!("assistant> {}", message.text),
        }
    }
}

async fn print_reply(engine: &ChatEngine) {
    if let Some(chat) = engine.current_chat().await {
        if let Some(message) = chat
            .messages
            .iter()
            .rev()
            .find(|m| m.sender == Sender::Assistant)
        {
            println!("assistant> {}", message.text);
        }
    }
}

async fn print_notices(engine: &ChatEngine) {
    for notice in engine.take_notices().await {
        println!("[{}]", notice_line(&notice));
    }
}

fn notice_line(notice: &Notice) -> String {
    match notice {
        Notice::Loaded {
            count,
            from_cache: false,
        } => format!("loaded {} previous conversations", count),
        Notice::Loaded {
            count,
            from_cache: true,
        } => format!("loaded {} conversations from local cache", count),
        Notice::Synced => "chats refreshed from the backend".to_string(),
        Notice::SyncFailed(e) => format!("refresh failed: {}", e),
        Notice::ChatCreated => "new chat started".to_string(),
        Notice::CreateFailed(e) => format!("could not create chat: {}", e),
        Notice::ChatSelected => "switched chat".to_string(),
        Notice::ChatDeleted => "chat deleted".to_string(),
        Notice::NoActiveChat => "no active chat".to_string(),
        Notice::ReplyFailed(e) => format!("reply generation failed: {}", e),
    }
}
