mod commands;
mod render;

use std::sync::Arc;
use std::{fs, path::Path};

use anyhow::{Context, Result, anyhow};
use auth_local::{LocalAuth, default_auth_dir_from};
use commands::{Command, HELP, NoteRef, ParseError};
use config::{APP_DIR_NAME, AppConfig, ConfigStore};
use core_types::{
    AuthProvider, AuthUser, FederatedProvider, Note, NoteId, NotePatch, NoteStore, SessionContext,
};
use i18n::I18n;
use note_sync::{NoteSyncManager, NoteView, Notification, NotificationLevel, SyncConfig};
use storage_sqlite::{SqliteNoteStore, StoreOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct Shell {
    auth: Arc<LocalAuth>,
    store: Arc<dyn NoteStore>,
    config_store: ConfigStore,
    config: AppConfig,
    i18n: I18n,
    session: SessionContext,
    manager: NoteSyncManager,
    printer: JoinHandle<()>,
}

impl Shell {
    fn new(
        auth: Arc<LocalAuth>,
        store: Arc<dyn NoteStore>,
        config_store: ConfigStore,
        config: AppConfig,
    ) -> Self {
        let i18n = I18n::new(config.language);
        let session = SessionContext {
            user: auth.current_user(),
            theme: config.theme,
            ..SessionContext::default()
        };
        let manager = NoteSyncManager::new(
            Arc::clone(&store),
            session.clone(),
            sync_config(&config),
        );
        let printer = spawn_printer(manager.notifications(), i18n.clone());
        Self {
            auth,
            store,
            config_store,
            config,
            i18n,
            session,
            manager,
            printer,
        }
    }

    /// Replaces the sync manager with one bound to the current session.
    async fn restart_sync(&mut self) {
        self.manager.shutdown().await;
        self.printer.abort();

        self.manager = NoteSyncManager::new(
            Arc::clone(&self.store),
            self.session.clone(),
            sync_config(&self.config),
        );
        self.printer = spawn_printer(self.manager.notifications(), self.i18n.clone());
        // Failures also arrive as notifications.
        if let Err(err) = self.manager.start().await {
            warn!(error = %err, "note sync did not start");
        }
    }

    async fn signed_in(&mut self, user: AuthUser) {
        println!("{} {}", self.i18n.t("shell.signed_in_as"), render::user_badge(&user));
        self.session.user = Some(user);
        self.restart_sync().await;
    }

    fn active_id(&self) -> Result<NoteId> {
        self.manager
            .view()
            .active_id()
            .cloned()
            .ok_or_else(|| anyhow!(self.i18n.t("shell.no_active_note").to_string()))
    }

    fn resolve(&self, note: &NoteRef) -> Result<NoteId> {
        match note {
            NoteRef::Id(id) => Ok(NoteId::from(id.as_str())),
            NoteRef::Index(index) => position(&self.manager.view(), *index)
                .map(|note| note.id.clone())
                .ok_or_else(|| anyhow!("no note #{index} in the list")),
        }
    }

    fn require_user(&self) -> Result<()> {
        if self.session.user.is_none() {
            return Err(anyhow!(self.i18n.t("shell.sign_in_required").to_string()));
        }
        Ok(())
    }

    fn show_active(&self) {
        if let Some(note) = self.manager.view().active {
            println!("{}", render::note_detail(&note, &self.i18n));
        }
    }

    /// Runs one command; `Ok(false)` ends the loop.
    async fn handle(&mut self, command: Command) -> Result<bool> {
        match command {
            Command::SignUp { email, password } => {
                let user = self.auth.sign_up(&email, &password).await?;
                self.signed_in(user).await;
            }
            Command::SignIn { email, password } => {
                let user = self.auth.sign_in(&email, &password).await?;
                self.signed_in(user).await;
            }
            Command::SignInGoogle => {
                let user = self.auth.sign_in_federated(FederatedProvider::Google).await?;
                self.signed_in(user).await;
            }
            Command::SignOut => {
                self.auth.sign_out().await?;
                self.session.user = None;
                self.restart_sync().await;
                println!("{}", self.i18n.t("shell.signed_out"));
            }
            Command::New => {
                self.require_user()?;
                self.manager.create_note().await?;
                self.show_active();
            }
            Command::List => {
                println!("{}", render::session_status(&self.session, &self.i18n));
                println!("{}", render::note_list(&self.manager.view(), &self.i18n));
            }
            Command::Open(note) => {
                let id = self.resolve(&note)?;
                self.manager.select_note(&id)?;
                self.show_active();
            }
            Command::Title(title) => {
                let id = self.active_id()?;
                self.manager.update_note(&id, NotePatch::title(title))?;
            }
            Command::Write(content) => {
                let id = self.active_id()?;
                self.manager.update_note(&id, NotePatch::content(content))?;
            }
            Command::Say(text) => {
                if !self.session.plan.is_premium() {
                    println!("{}", self.i18n.t("voice.premium_only"));
                    return Ok(true);
                }
                let id = self.active_id()?;
                self.manager.append_transcript(&id, &text)?;
            }
            Command::Save => {
                let id = self.active_id()?;
                self.manager.save_now(&id).await?;
                println!("{}", self.i18n.t("shell.saved"));
            }
            Command::Pin => {
                let id = self.active_id()?;
                self.manager.toggle_pin(&id).await?;
            }
            Command::SetCategory(category) => {
                let id = self.active_id()?;
                self.manager.set_category(&id, &category).await?;
            }
            Command::Tag(tag) => {
                let id = self.active_id()?;
                self.manager.add_tag(&id, &tag).await?;
            }
            Command::Untag(tag) => {
                let id = self.active_id()?;
                self.manager.remove_tag(&id, &tag).await?;
            }
            Command::Filter(tag) => {
                self.manager.toggle_tag_filter(&tag);
                println!("{}", render::note_list(&self.manager.view(), &self.i18n));
            }
            Command::ClearFilters => {
                self.manager.clear_tag_filters();
                println!("{}", render::note_list(&self.manager.view(), &self.i18n));
            }
            Command::SelectCategory(category) => {
                self.manager.select_category(&category)?;
                println!("{}", render::note_list(&self.manager.view(), &self.i18n));
            }
            Command::AddCategory(category) => {
                self.manager.add_category(&category)?;
                println!("{}", render::categories(&self.manager.view(), &self.i18n));
            }
            Command::Categories => {
                println!("{}", render::categories(&self.manager.view(), &self.i18n));
            }
            Command::Search(query) => {
                self.manager.search(&query).await?;
                println!("{}", render::note_list(&self.manager.view(), &self.i18n));
            }
            Command::Delete(note) => {
                let id = match note {
                    Some(note) => self.resolve(&note)?,
                    None => self.active_id()?,
                };
                self.manager.delete_note(&id).await?;
            }
            Command::Theme => {
                self.session.theme = self.session.theme.toggle();
                self.config.theme = self.session.theme;
                self.config_store.save(&self.config)?;
                println!("{}: {:?}", self.i18n.t("shell.theme"), self.session.theme);
            }
            Command::Plan(plan) => {
                self.session.plan = plan;
                println!("{}", render::session_status(&self.session, &self.i18n));
            }
            Command::Help => {
                println!("{}", self.i18n.t("shell.help"));
                for (usage, what) in HELP {
                    println!("  {usage:<28} {what}");
                }
            }
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }
}

/// The note shown at a 1-based listing position.
fn position(view: &NoteView, index: usize) -> Option<&Note> {
    view.displayed_notes().get(index.checked_sub(1)?)
}

fn sync_config(config: &AppConfig) -> SyncConfig {
    SyncConfig {
        debounce: config.sync.debounce(),
        default_category: config.sync.default_category.clone(),
    }
}

fn spawn_printer(mut rx: broadcast::Receiver<Notification>, i18n: I18n) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(notification) => {
                    let text = i18n.with_detail(notification.key.as_str(), &notification.detail);
                    match notification.level {
                        NotificationLevel::Info => println!("* {text}"),
                        NotificationLevel::Error => eprintln!("! {text}"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "notification printer lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    data_dir.push(APP_DIR_NAME);
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let config_store = ConfigStore::from_dir(data_dir.join("config"));
    let config = match config_store.load_or_init() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err:#}");
            AppConfig::default()
        }
    };

    let database = config.storage.database_path(&data_dir);
    let store = SqliteNoteStore::connect(
        &database,
        StoreOptions {
            composite_index: config.storage.composite_index,
        },
    )
    .await
    .with_context(|| format!("failed to open {}", database.display()))?;
    let auth = Arc::new(LocalAuth::new(default_auth_dir_from(&data_dir)));
    info!(data_dir = %data_dir.display(), "quicknote shell starting");

    let mut shell = Shell::new(auth, Arc::new(store), config_store, config);
    shell.restart_sync().await;
    println!("{}", shell.i18n.t("shell.welcome"));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match commands::parse(&line) {
            Ok(command) => command,
            Err(ParseError::Empty) => continue,
            Err(err) => {
                println!("{}: {err}", shell.i18n.t("shell.unknown_command"));
                continue;
            }
        };
        match shell.handle(command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => println!("{}: {err:#}", shell.i18n.t("shell.error")),
        }
    }

    shell.manager.shutdown().await;
    info!("quicknote shell stopped");
    Ok(())
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "quicknote.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_shell=debug,note_sync=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}
