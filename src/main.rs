use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use ldap_mux::controls::DEFAULT_VLV_PAGE_SIZE;
use ldap_mux::{
    Config, Connection, Cookie, Error, Event, PagingMode, SearchControls, SearchParams, SearchScope, Stats,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

type Conn = Connection<UnboundedSender<Event>>;

#[derive(Parser)]
#[command(name = "ldap-mux")]
#[command(about = "Asynchronous LDAPv3 client: paged, VLV and sorted search, content synchronization")]
struct Args {
    /// Configuration file path (YAML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory server URI (overrides config; e.g. ldap://127.0.0.1:389)
    #[arg(short, long, value_name = "URL")]
    uri: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print connection counters on exit
    #[arg(long)]
    stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Search and print every entry, walking all pages
    Search(SearchArgs),
    /// Follow changes with refreshAndPersist until interrupted
    Sync(SyncArgs),
}

#[derive(ClapArgs)]
struct SearchArgs {
    #[arg(short, long)]
    base: Option<String>,
    /// base, one, sub or children
    #[arg(short, long)]
    scope: Option<String>,
    #[arg(short, long)]
    filter: Option<String>,
    /// Attributes separated by spaces, tabs or commas
    #[arg(short, long)]
    attrs: Option<String>,
    /// Page size; 0 disables paging
    #[arg(short, long, default_value_t = 0)]
    page_size: u32,
    /// Page with virtual list view instead of simple paged results
    #[arg(long)]
    vlv: bool,
    /// Sort keys, e.g. "-cn sn:2.5.13.3"
    #[arg(long)]
    sort: Option<String>,
    /// Zero-based VLV start offset
    #[arg(long, default_value_t = 0)]
    offset: u32,
    /// Extra control by name (manageDSAit, "!" prefix for critical)
    #[arg(long = "control", value_name = "NAME")]
    controls: Vec<String>,
}

#[derive(ClapArgs)]
struct SyncArgs {
    #[arg(short, long)]
    base: Option<String>,
    #[arg(short, long)]
    scope: Option<String>,
    #[arg(short, long)]
    filter: Option<String>,
    /// Resume from this cookie
    #[arg(long)]
    cookie: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("ldap_mux={},info", log_level))
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => {
            info!("Configuration source: file {:?}", path);
            Config::from_file(path)?
        }
        None => Config::default(),
    };
    if let Some(uri) = &args.uri {
        config.connection.uri = uri.clone();
    }
    info!("Directory server: {}", config.connection.uri);

    let stats = Arc::new(Stats::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut conn = Connection::with_stats(tx, Arc::clone(&stats));
    conn.open(config.connect_options()).await?;
    bind(&mut conn, &mut rx, &config).await?;

    let outcome = match args.command {
        Command::Search(search) => run_search(&mut conn, &mut rx, &config, search).await,
        Command::Sync(sync) => run_sync(&mut conn, &mut rx, &config, sync).await,
    };
    conn.close().await;

    if args.stats {
        print!("{}", serde_yaml::to_string(&stats.snapshot())?);
    }
    outcome
}

async fn bind(conn: &mut Conn, rx: &mut UnboundedReceiver<Event>, config: &Config) -> Result<()> {
    let dn = config.bind.binddn.as_deref();
    let message_id = conn.bind(dn, config.bind.credentials.as_deref()).await?;
    match wait_for(conn, rx, message_id).await? {
        Event::Result { error: Some(err), .. } => Err(Error::Bind(err).into()),
        _ => {
            info!("Bound as {}", dn.unwrap_or("anonymous"));
            Ok(())
        }
    }
}

/// Drive the connection until the response to `message_id` arrives.
async fn wait_for(conn: &mut Conn, rx: &mut UnboundedReceiver<Event>, message_id: i32) -> Result<Event> {
    loop {
        while let Ok(event) = rx.try_recv() {
            match event {
                Event::Disconnected => {
                    return Err(Error::ServerDown("connection lost while waiting for a response".into()).into())
                }
                event if event.message_id() == Some(message_id) => return Ok(event),
                other => debug!("Skipping {} event", other.name()),
            }
        }
        if !conn.drive().await {
            return Err(Error::NotConnected.into());
        }
    }
}

/// Split an attribute list on spaces, tabs and commas.
fn split_attributes(list: &str) -> Vec<String> {
    list.split([' ', '\t', ','])
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_scope(scope: Option<&str>, config: &Config) -> Result<SearchScope> {
    match scope {
        Some(s) => s.parse(),
        None => Ok(config.search.scope()),
    }
}

async fn run_search(
    conn: &mut Conn,
    rx: &mut UnboundedReceiver<Event>,
    config: &Config,
    args: SearchArgs,
) -> Result<()> {
    let attributes = match &args.attrs {
        Some(list) => split_attributes(list),
        None => config.search.attrs().to_vec(),
    };
    let paging_mode = if args.vlv {
        PagingMode::VirtualListView
    } else {
        PagingMode::infer(args.page_size, args.sort.as_deref())
    };
    let mut controls = SearchControls {
        paging_mode,
        page_size: args.page_size,
        cookie: None,
        offset: args.offset,
        sort: args.sort.clone(),
        extra_controls: args.controls.clone(),
    };
    let base = args.base.as_deref().unwrap_or(config.search.base()).to_string();
    let scope = parse_scope(args.scope.as_deref(), config)?;
    let filter = args.filter.as_deref().unwrap_or(config.search.filter()).to_string();

    let mut total = 0usize;
    let mut pages = 0usize;
    loop {
        let params = SearchParams::new(base.clone())
            .scope(scope)
            .filter(filter.clone())
            .attributes(attributes.clone())
            .with_controls(controls.clone());
        let message_id = conn.search(params).await?;
        let Event::SearchResult { error, entries, cookie, controls: response, .. } =
            wait_for(conn, rx, message_id).await?
        else {
            anyhow::bail!("Unexpected response to search {}", message_id);
        };
        if let Some(err) = error {
            return Err(Error::Operation(err).into());
        }
        pages += 1;
        total += entries.len();
        for entry in &entries {
            print!("{}", serde_yaml::to_string(entry)?);
            println!("---");
        }

        match paging_mode {
            PagingMode::None => break,
            PagingMode::SimplePaged => match cookie {
                Some(next) => controls.cookie = Some(next),
                None => break,
            },
            PagingMode::VirtualListView => {
                let window = if args.page_size > 0 { args.page_size } else { DEFAULT_VLV_PAGE_SIZE };
                let count = response.vlv.map(|v| v.count).unwrap_or(0);
                let next = controls.offset.saturating_add(window);
                if entries.is_empty() || i64::from(next) >= i64::from(count) {
                    break;
                }
                controls.offset = next;
                controls.cookie = cookie;
            }
        }
    }
    info!("Search returned {} entries in {} page(s)", total, pages);
    Ok(())
}

async fn run_sync(conn: &mut Conn, rx: &mut UnboundedReceiver<Event>, config: &Config, args: SyncArgs) -> Result<()> {
    let base = args.base.as_deref().unwrap_or(config.search.base());
    let scope = parse_scope(args.scope.as_deref(), config)?;
    let filter = args.filter.as_deref().unwrap_or(config.search.filter());
    let cookie = args.cookie.and_then(Cookie::new);

    conn.sync_start(base, scope, filter, cookie).await?;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut finished = false;
    while !finished {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("Listen for Ctrl-C")?;
                info!("Interrupted, stopping sync");
                break;
            }
            alive = conn.drive() => {
                if !alive {
                    warn!("Connection is no longer watched, stopping sync");
                    finished = true;
                }
            }
        }
        while let Ok(event) = rx.try_recv() {
            finished |= print_sync_event(&event)?;
        }
    }
    conn.sync_stop().await;

    match conn.cookie() {
        Some(cookie) => println!("cookie: {}", cookie),
        None => println!("cookie: none"),
    }
    Ok(())
}

/// Print one sync event. Returns true when the session is over.
fn print_sync_event(event: &Event) -> Result<bool> {
    match event {
        Event::SyncEntry { entry, uuid, state } => {
            println!("# {:?} {}", state, uuid);
            print!("{}", serde_yaml::to_string(entry)?);
            println!("---");
        }
        Event::SyncIntermediate { cookie, phase, uuids } => {
            info!(
                "Sync intermediate: phase {:?}, cookie {}, {} uuid(s)",
                phase,
                cookie.as_ref().map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
                uuids.len()
            );
        }
        Event::SyncResult { error, refresh_deletes, .. } => {
            match error {
                Some(err) => warn!("Sync ended: {} (refreshDeletes={})", err, refresh_deletes),
                None => info!("Sync ended"),
            }
            return Ok(true);
        }
        Event::Disconnected => {
            warn!("Disconnected from directory server");
            return Ok(true);
        }
        Event::Error { message_id } => warn!("Undecodable response for message {}", message_id),
        other => debug!("Ignoring {} event", other.name()),
    }
    Ok(false)
}
