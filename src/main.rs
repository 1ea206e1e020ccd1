#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    clippy::cast_precision_loss,
    clippy::significant_drop_tightening
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ferryfs::client::{parse_uri, ConnectionId, Credential, Endpoint, FileItem};
use ferryfs::config::{Bookmark, Config, Protocol};
use ferryfs::connection::ConnectionManager;
use ferryfs::credentials::{CredentialBroker, PromptRequest};
use ferryfs::error::ConnectionError;
use ferryfs::queue::copy::{CopyJob, CopyMode};
use ferryfs::queue::download::DownloadJob;
use ferryfs::queue::remove::RemoveQueue;
use ferryfs::queue::upload::UploadJob;
use ferryfs::queue::{
    ConflictAction, QueueEvent, QueueState, TransferJob, TransferOptions, TransferQueue,
};
use ferryfs::session::{SessionId, SessionStore};
use ferryfs::utils;
use ferryfs::watcher::{NoRefresh, Refresh, WatchEvent, Watchers};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Password attempts before giving up on an endpoint.
const MAX_ATTEMPTS: usize = 3;
/// Remote endpoints push nothing; `list --watch` re-reads them this often.
const REMOTE_POLL: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Answer every name conflict with this: skip, replace or rename
    /// (with `config`, stores it as the default)
    #[arg(long, global = true)]
    on_conflict: Option<ConflictAction>,

    /// Items in flight at once per transfer
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List a directory (local path, URI or @bookmark)
    List {
        #[arg(default_value = ".")]
        target: String,

        /// Sort by: modified (default), name, size, type
        #[arg(short, long, value_enum, default_value_t = SortKey::Modified)]
        sort: SortKey,

        /// Reverse sort order
        #[arg(short, long)]
        reverse: bool,

        /// Keep printing the listing whenever it changes
        #[arg(short, long)]
        watch: bool,
    },

    /// Upload local files and directories to a remote directory
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Destination directory URI
        #[arg(short, long)]
        dest: String,
    },

    /// Download remote files and directories
    Download {
        #[arg(required = true)]
        targets: Vec<String>,

        /// Local destination directory
        #[arg(short, long, default_value = ".")]
        dest: PathBuf,
    },

    /// Copy within one endpoint
    Copy {
        #[arg(required = true)]
        targets: Vec<String>,

        /// Destination directory on the same endpoint
        #[arg(short, long)]
        dest: String,
    },

    /// Move within one endpoint
    Move {
        #[arg(required = true)]
        targets: Vec<String>,

        #[arg(short, long)]
        dest: String,
    },

    /// Copy next to the original as "name copy", "name copy 2", ...
    Duplicate {
        #[arg(required = true)]
        targets: Vec<String>,
    },

    /// Delete files and directories recursively
    Remove {
        #[arg(required = true)]
        targets: Vec<String>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show or change settings
    Config {
        #[arg(long)]
        max_startups: Option<usize>,

        #[arg(long)]
        idle_timeout_ms: Option<u64>,

        /// Pooled connections per endpoint (0 for unbounded)
        #[arg(long)]
        max_connections: Option<usize>,

        /// Items in flight per transfer (0 for no extra cap)
        #[arg(long)]
        max_concurrent: Option<usize>,

        /// Add or replace a bookmark: NAME=URI
        #[arg(long, value_parser = parse_bookmark)]
        bookmark: Option<Bookmark>,

        /// Drop a bookmark by name
        #[arg(long)]
        remove_bookmark: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SortKey {
    Modified,
    Name,
    Size,
    Type,
}

fn parse_bookmark(arg: &str) -> std::result::Result<Bookmark, String> {
    let (name, uri) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=URI, got '{}'", arg))?;
    parse_uri(uri).map_err(|e| e.to_string())?;
    Ok(Bookmark {
        name: name.to_string(),
        uri: uri.to_string(),
        max_connections: None,
    })
}

/// Everything one invocation shares: the pool, the password broker and the
/// conflict answers remembered for this run.
struct App {
    config: Config,
    connections: ConnectionManager,
    broker: CredentialBroker,
    sessions: SessionStore,
    session: SessionId,
    on_conflict: Option<ConflictAction>,
    jobs: Option<usize>,
    opened: parking_lot::Mutex<Vec<ConnectionId>>,
}

/// Either kind of running queue, as far as the progress display cares.
enum Running<'a> {
    Transfer(&'a TransferQueue),
    Remove(&'a RemoveQueue),
}

impl Running<'_> {
    fn stop(&self) {
        match self {
            Running::Transfer(queue) => queue.stop(),
            Running::Remove(queue) => queue.stop(),
        }
    }

    async fn wait(&self) {
        match self {
            Running::Transfer(queue) => queue.wait().await,
            Running::Remove(queue) => queue.wait().await,
        }
    }
}

impl App {
    fn new(config: Config, on_conflict: Option<ConflictAction>, jobs: Option<usize>) -> Self {
        let connections = ConnectionManager::new(config.pool);
        let (broker, prompts) = CredentialBroker::new();
        tokio::spawn(answer_prompts(broker.clone(), prompts));

        connections.set_close_hook({
            let broker = broker.clone();
            move |id| {
                debug!(id = %id, "endpoint closed");
                broker.forget(id);
            }
        });

        let sessions = SessionStore::new();
        let session = sessions.create();
        Self {
            config,
            connections,
            broker,
            sessions,
            session,
            on_conflict,
            jobs,
            opened: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Expands bookmarks and parses the result. A bookmark's own pool limit is
    /// applied to its endpoint.
    fn resolve(&self, target: &str) -> Result<(ConnectionId, String)> {
        let uri = self.config.resolve_uri(target);
        let (id, path) = parse_uri(&uri)?;
        if let Some(name) = target.strip_prefix('@') {
            let name = name.split('/').next().unwrap_or(name);
            if let Some(limit) = self.config.bookmark(name).and_then(|b| b.max_connections) {
                self.connections.set_pool_limit(&id, Some(limit));
            }
        }
        Ok((id, path))
    }

    /// Resolves several targets that must all live on one endpoint.
    fn resolve_all(&self, targets: &[String]) -> Result<(ConnectionId, Vec<String>)> {
        let mut endpoint: Option<ConnectionId> = None;
        let mut paths = Vec::with_capacity(targets.len());
        for target in targets {
            let (id, path) = self.resolve(target)?;
            match &endpoint {
                Some(existing) if *existing != id => {
                    bail!("{} is not on {}", target, existing)
                }
                Some(_) => {}
                None => endpoint = Some(id),
            }
            paths.push(path);
        }
        let id = endpoint.context("nothing to do")?;
        Ok((id, paths))
    }

    /// Opens `id`, asking for a password when the endpoint wants one.
    async fn connect(&self, id: &ConnectionId) -> Result<()> {
        if id.is_local() || self.connections.is_open(id) {
            return Ok(());
        }
        let mut credential = match id {
            ConnectionId::Remote(Endpoint {
                protocol: Protocol::Sftp,
                ..
            }) => Credential::None,
            ConnectionId::Remote(Endpoint {
                protocol: Protocol::Ftp,
                user,
                ..
            }) if user.is_empty() => Credential::None,
            _ => Credential::Password(self.broker.password(id).await?),
        };

        for attempt in 1..=MAX_ATTEMPTS {
            match self.connections.open(id, credential.clone()).await {
                Ok(capabilities) => {
                    debug!(id = %id, ?capabilities, "connected");
                    self.opened.lock().push(id.clone());
                    return Ok(());
                }
                Err(
                    e @ (ConnectionError::Handshake { .. }
                    | ConnectionError::NeedsAuthentication(_)),
                ) if attempt < MAX_ATTEMPTS => {
                    warn!(id = %id, attempt, error = %e, "login failed");
                    self.broker.forget(id);
                    credential = Credential::Password(self.broker.password(id).await?);
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!("could not log in to {}", id)
    }

    fn transfer_options(&self) -> TransferOptions {
        let remembered = self
            .sessions
            .get(self.session)
            .and_then(|settings| settings.conflict_action);
        TransferOptions {
            max_concurrent: self
                .jobs
                .or(self.config.transfers.max_concurrent)
                .filter(|&n| n > 0),
            on_conflict: self
                .on_conflict
                .or(remembered)
                .or(self.config.transfers.on_conflict),
        }
    }

    fn refresher() -> Arc<dyn Refresh> {
        Arc::new(NoRefresh)
    }

    async fn list(&self, target: &str, sort: SortKey, reverse: bool, watch: bool) -> Result<()> {
        let (id, path) = self.resolve(target)?;
        let path = if id.is_local() {
            absolute(&path).await?
        } else {
            path
        };
        self.connect(&id).await?;

        if !watch {
            let items = self.connections.list(&id, &path).await?;
            print_listing(&id.uri(&path), items, sort, reverse);
            return Ok(());
        }

        let (watchers, mut events) = Watchers::new(self.connections.clone(), None);
        if id.is_local() {
            watchers.local.watch(&path).await?;
        } else {
            watchers.remote.watch(&id, &path).await;
        }
        let mut poll = tokio::time::interval_at(tokio::time::Instant::now() + REMOTE_POLL, REMOTE_POLL);

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(WatchEvent::Listing { target, items }) => {
                        print_listing(&target, items, sort, reverse);
                    }
                    Some(WatchEvent::Missing { target }) => {
                        println!("{} no longer exists", target);
                        break;
                    }
                    Some(WatchEvent::File { .. }) => {}
                    None => break,
                },
                _ = poll.tick(), if !id.is_local() => {
                    watchers.remote.refresh(&id, &path).await;
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
        Ok(())
    }

    async fn upload(&self, files: Vec<PathBuf>, dest: &str) -> Result<()> {
        let (remote, dest_path) = self.resolve(dest)?;
        if remote.is_local() {
            bail!("{} is not a remote destination", dest);
        }
        let mut sources = Vec::with_capacity(files.len());
        for file in files {
            let path = tokio::fs::canonicalize(&file)
                .await
                .with_context(|| format!("File not found: {:?}", file))?;
            sources.push(path.to_string_lossy().into_owned());
        }
        self.connect(&remote).await?;

        println!("Uploading {} items to {}", sources.len(), remote.uri(&dest_path));
        let job = UploadJob::new(self.connections.clone(), remote, Self::refresher());
        self.run_transfer(Arc::new(job), sources, dest_path).await
    }

    async fn download(&self, targets: &[String], dest: PathBuf) -> Result<()> {
        let (remote, sources) = self.resolve_all(targets)?;
        if remote.is_local() {
            bail!("nothing to download: sources are local");
        }
        tokio::fs::create_dir_all(&dest).await?;
        let dest = absolute(&dest.to_string_lossy()).await?;
        self.connect(&remote).await?;

        println!("Downloading {} items to {}", sources.len(), dest);
        let job = DownloadJob::new(self.connections.clone(), remote, Self::refresher());
        self.run_transfer(Arc::new(job), sources, dest).await
    }

    async fn copy(&self, targets: &[String], dest: Option<&str>, mode: CopyMode) -> Result<()> {
        let (id, mut sources) = self.resolve_all(targets)?;
        if id.is_local() {
            for source in &mut sources {
                *source = absolute(source).await?;
            }
        }
        let destination = match dest {
            Some(dest) => {
                let (dest_id, path) = self.resolve(dest)?;
                if dest_id != id {
                    bail!("{} is not on {}; use upload or download", dest, id);
                }
                if id.is_local() {
                    absolute(&path).await?
                } else {
                    path
                }
            }
            None => utils::parent(&sources[0]),
        };
        self.connect(&id).await?;

        let job = CopyJob::new(self.connections.clone(), id, mode, Self::refresher());
        self.run_transfer(Arc::new(job), sources, destination).await
    }

    async fn remove(&self, targets: &[String], yes: bool) -> Result<()> {
        let (id, paths) = self.resolve_all(targets)?;
        if !yes && !confirm(&format!("Remove {} items from {}?", paths.len(), id))? {
            return Ok(());
        }
        self.connect(&id).await?;

        let (queue, events) = RemoveQueue::spawn(
            self.connections.clone(),
            id,
            paths,
            Self::refresher(),
            self.transfer_options(),
        )
        .await;
        let failed = self.follow(&Running::Remove(&queue), events).await;
        summarize("Remove", queue.state(), failed);
        Ok(())
    }

    async fn run_transfer(
        &self,
        job: Arc<dyn TransferJob>,
        sources: Vec<String>,
        destination: String,
    ) -> Result<()> {
        let (queue, events) =
            TransferQueue::spawn(job, sources, destination, self.transfer_options()).await;
        let failed = self.follow(&Running::Transfer(&queue), events).await;
        summarize("Transfer", queue.state(), failed);
        Ok(())
    }

    /// Renders queue events until the queue completes. Returns how many
    /// errors were reported.
    async fn follow(
        &self,
        queue: &Running<'_>,
        mut events: mpsc::UnboundedReceiver<QueueEvent>,
    ) -> usize {
        let pb = progress_bar();
        let mut failed = 0;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(QueueEvent::State(state)) => {
                        pb.set_length(state.total_size);
                        pb.set_position(state.done_size);
                        pb.set_message(format!("{}/{} items", state.done_cnt, state.total_cnt));
                    }
                    Some(QueueEvent::Conflict { source, destination }) => {
                        if let Running::Transfer(transfer) = queue {
                            self.ask_conflict(&pb, transfer, source, destination).await;
                        }
                    }
                    Some(QueueEvent::Error { path, reason }) => {
                        failed += 1;
                        pb.println(format!("✗ {}: {}", path, reason));
                    }
                    Some(QueueEvent::Complete) | None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    pb.println("Stopping after items in flight...");
                    queue.stop();
                }
            }
        }
        queue.wait().await;
        pb.finish_and_clear();
        failed
    }

    async fn ask_conflict(
        &self,
        pb: &ProgressBar,
        queue: &TransferQueue,
        source: String,
        destination: String,
    ) {
        let pb = pb.clone();
        let answer = tokio::task::spawn_blocking(move || {
            pb.suspend(|| prompt_conflict(&source, &destination))
        })
        .await;

        match answer {
            Ok(Ok((action, for_all))) => {
                if for_all {
                    self.sessions.set_conflict_action(self.session, Some(action));
                }
                queue.resolve(action, for_all);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "no answer, skipping");
                queue.resolve(ConflictAction::Skip, false);
            }
            Err(e) => {
                warn!(error = %e, "conflict prompt failed");
                queue.resolve(ConflictAction::Skip, false);
            }
        }
    }

    async fn shutdown(&self) {
        let opened = std::mem::take(&mut *self.opened.lock());
        for id in opened {
            self.connections.close(&id).await;
        }
        self.sessions.discard(self.session);
    }
}

/// Answers password requests from the terminal, one endpoint at a time.
async fn answer_prompts(broker: CredentialBroker, mut prompts: mpsc::UnboundedReceiver<PromptRequest>) {
    while let Some(PromptRequest { id }) = prompts.recv().await {
        let prompt = format!("Password for {} (hidden): ", id);
        let answer = tokio::task::spawn_blocking(move || rpassword::prompt_password(prompt)).await;
        match answer {
            Ok(Ok(password)) => broker.set_password(&id, SecretString::from(password), true),
            Ok(Err(e)) => {
                warn!(id = %id, error = %e, "could not read password");
                broker.cancel(&id);
            }
            Err(e) => {
                warn!(id = %id, error = %e, "password prompt failed");
                broker.cancel(&id);
            }
        }
    }
}

/// Lower-case answers this conflict only, upper-case answers all of them.
fn prompt_conflict(source: &str, destination: &str) -> Result<(ConflictAction, bool)> {
    loop {
        print!(
            "{} already exists (from {}).\n[s]kip, [r]eplace, [k]eep both (upper-case for all): ",
            destination, source
        );
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            bail!("stdin closed");
        }
        let answer = line.trim();
        let for_all = answer.chars().next().is_some_and(char::is_uppercase);
        let action = match answer.to_ascii_lowercase().as_str() {
            "s" => ConflictAction::Skip,
            "r" => ConflictAction::Replace,
            "k" => ConflictAction::Rename,
            _ => continue,
        };
        return Ok((action, for_all));
    }
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    match ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
    {
        Ok(style) => pb.set_style(style.progress_chars("#>-")),
        Err(e) => debug!(error = %e, "bad progress template"),
    }
    pb
}

fn summarize(verb: &str, state: QueueState, failed: usize) {
    println!(
        "{} complete: {}/{} items, {} ({} failed)",
        verb,
        state.done_cnt,
        state.total_cnt,
        human_bytes::human_bytes(state.done_size as f64),
        failed
    );
}

async fn absolute(path: &str) -> Result<String> {
    let path = PathBuf::from(path);
    let path = if path.is_absolute() {
        path
    } else {
        std::env::current_dir()?.join(path)
    };
    let path = tokio::fs::canonicalize(&path)
        .await
        .with_context(|| format!("No such file or directory: {:?}", path))?;
    Ok(path.to_string_lossy().into_owned())
}

fn print_listing(target: &str, mut items: Vec<FileItem>, sort: SortKey, reverse: bool) {
    match sort {
        SortKey::Modified => items.sort_by(|a, b| b.modified.cmp(&a.modified)),
        SortKey::Name => items.sort_by(|a, b| a.name.cmp(&b.name)),
        SortKey::Size => items.sort_by(|a, b| b.size.cmp(&a.size)),
        SortKey::Type => items.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then(a.name.cmp(&b.name))),
    }
    if reverse {
        items.reverse();
    }

    println!("Files in {}:", target);
    println!("{:<50} {:>10} {:>20}", "Name", "Size", "Modified");
    println!("{}", "-".repeat(82));
    for item in items {
        let size = if item.is_dir {
            "DIR".to_string()
        } else {
            human_bytes::human_bytes(item.size as f64)
        };
        let modified = item
            .modified
            .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!("{:<50} {:>10} {:>20}", item.name, size, modified);
    }
}

#[allow(clippy::too_many_arguments)]
fn update_config(
    config: &mut Config,
    max_startups: Option<usize>,
    idle_timeout_ms: Option<u64>,
    max_connections: Option<usize>,
    max_concurrent: Option<usize>,
    conflict: Option<ConflictAction>,
    bookmark: Option<Bookmark>,
    remove_bookmark: Option<String>,
) -> bool {
    let mut changed = false;
    if let Some(n) = max_startups {
        config.pool.max_startups = n.max(1);
        changed = true;
    }
    if let Some(ms) = idle_timeout_ms {
        config.pool.idle_timeout_ms = ms;
        changed = true;
    }
    if let Some(n) = max_connections {
        config.pool.max_connections = (n > 0).then_some(n);
        changed = true;
    }
    if let Some(n) = max_concurrent {
        config.transfers.max_concurrent = (n > 0).then_some(n);
        changed = true;
    }
    if let Some(action) = conflict {
        config.transfers.on_conflict = Some(action);
        changed = true;
    }
    if let Some(bookmark) = bookmark {
        config.bookmarks.retain(|b| b.name != bookmark.name);
        config.bookmarks.push(bookmark);
        changed = true;
    }
    if let Some(name) = remove_bookmark {
        config.bookmarks.retain(|b| b.name != name);
        changed = true;
    }
    changed
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ferryfs=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load()?;

    if let Commands::Config {
        max_startups,
        idle_timeout_ms,
        max_connections,
        max_concurrent,
        bookmark,
        remove_bookmark,
    } = cli.command
    {
        if update_config(
            &mut config,
            max_startups,
            idle_timeout_ms,
            max_connections,
            max_concurrent,
            cli.on_conflict,
            bookmark,
            remove_bookmark,
        ) {
            config.save()?;
            println!("Configuration saved successfully!");
        } else {
            if let Some(path) = Config::config_path() {
                println!("# {}", path.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        return Ok(());
    }

    let app = App::new(config, cli.on_conflict, cli.jobs);
    let result = match cli.command {
        Commands::List {
            target,
            sort,
            reverse,
            watch,
        } => app.list(&target, sort, reverse, watch).await,
        Commands::Upload { files, dest } => app.upload(files, &dest).await,
        Commands::Download { targets, dest } => app.download(&targets, dest).await,
        Commands::Copy { targets, dest } => app.copy(&targets, Some(&dest), CopyMode::Copy).await,
        Commands::Move { targets, dest } => app.copy(&targets, Some(&dest), CopyMode::Move).await,
        Commands::Duplicate { targets } => app.copy(&targets, None, CopyMode::Duplicate).await,
        Commands::Remove { targets, yes } => app.remove(&targets, yes).await,
        Commands::Config { .. } => Ok(()),
    };
    app.shutdown().await;
    result
}
