use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{ArgGroup, Args, Parser, Subcommand};
use daybook::config::{Config, load_config};
use daybook::core::{Direction, EntryKey, Filter, MonthDay};
use daybook::parser::parse_month_day;
use daybook::session::{Action, Reader};
use daybook::source::{Fetcher, load_document};
use daybook::state::{FileStore, StateStore};
use daybook::view::{Phase, ViewModel};
use tracing::debug;

#[derive(Debug, Parser)]
#[command(
    name = "daybook",
    about = "Read daily reflections and study books, with notes and progress",
    version
)]
struct Cli {
    /// Configuration file (defaults to the platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Document source id; defaults to the last one used.
    #[arg(long, global = true)]
    source: Option<String>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Emit JSON view models instead of text.
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the configured document sources.
    Sources,

    /// Show an entry: today's reading, a random one, a date, a key or a neighbour.
    Show(ShowArgs),

    /// Search the current document.
    Search(SearchArgs),

    /// Save a note on an entry. Blank text clears it.
    Note(NoteArgs),

    /// Mark entries as read.
    Visit(VisitArgs),

    /// Print reading progress and the resume target.
    Progress,

    /// Clear notes, read flags and the last-visited entry for the document.
    Reset(ResetArgs),

    /// Print an entry as shareable plain text.
    Share(TargetArgs),
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("target").multiple(false)))]
struct ShowArgs {
    /// Today's reading (daily documents).
    #[arg(long, group = "target")]
    today: bool,
    /// A random entry.
    #[arg(long, group = "target")]
    random: bool,
    /// A calendar date: `12-31`, `12/31`, `Dec 31`, `December 31`.
    #[arg(long, group = "target", value_parser = parse_month_day)]
    date: Option<MonthDay>,
    /// An entry key as stored, e.g. `11-30` or `42`.
    #[arg(long, group = "target")]
    key: Option<String>,
    /// The entry after the current one.
    #[arg(long, group = "target")]
    next: bool,
    /// The entry before the current one.
    #[arg(long, group = "target")]
    prev: bool,
    /// The last visited entry, or the first visible one.
    #[arg(long, group = "target")]
    resume: bool,
}

impl ShowArgs {
    /// `None` keeps the entry the document opened on.
    fn action(&self) -> Option<Action> {
        if self.today {
            Some(Action::Today)
        } else if self.random {
            Some(Action::Random)
        } else if let Some(date) = self.date {
            Some(Action::Explicit(EntryKey::calendar(date)))
        } else if let Some(key) = &self.key {
            Some(Action::Explicit(EntryKey::from(key.as_str())))
        } else if self.next {
            Some(Action::Step(Direction::Forward))
        } else if self.prev {
            Some(Action::Step(Direction::Backward))
        } else if self.resume {
            Some(Action::Resume)
        } else {
            None
        }
    }
}

#[derive(Debug, Args)]
#[command(group(ArgGroup::new("entry").multiple(false)))]
struct TargetArgs {
    /// A calendar date: `12-31`, `Dec 31`, ...
    #[arg(long, group = "entry", value_parser = parse_month_day)]
    date: Option<MonthDay>,
    /// An entry key as stored.
    #[arg(long, group = "entry")]
    key: Option<String>,
}

impl TargetArgs {
    fn action(&self) -> Option<Action> {
        self.date
            .map(EntryKey::calendar)
            .or_else(|| self.key.as_deref().map(EntryKey::from))
            .map(Action::Explicit)
    }
}

#[derive(Debug, Args)]
struct SearchArgs {
    /// Text to look for (at least two characters).
    query: String,
    /// Category filter: `all`, `front`, `steps`, `traditions` or a month name.
    #[arg(long, default_value = "all")]
    filter: Filter,
    /// Reveal this many extra pages of results.
    #[arg(long, default_value_t = 0)]
    more: usize,
}

#[derive(Debug, Args)]
struct NoteArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Note text; omitted or blank clears the note.
    #[arg(trailing_var_arg = true)]
    text: Vec<String>,
}

#[derive(Debug, Args)]
struct VisitArgs {
    /// Entry keys to mark as read.
    #[arg(required = true)]
    keys: Vec<String>,
}

#[derive(Debug, Args)]
struct ResetArgs {
    /// Confirm the reset.
    #[arg(long)]
    yes: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    let store = StateStore::new(FileStore::open(config.state_path()));
    let remembered = store.last_document();
    let source = config
        .source(cli.source.as_deref(), remembered.as_ref().map(|id| id.0.as_str()))?
        .clone();

    if let Commands::Sources = cli.command {
        return handle_sources(&config, &source.id.0, cli.json);
    }

    let mut reader = Reader::new(store, config.view_settings(), &source);
    let fetcher = Fetcher::new(!config.offline);
    let loaded = load_document(&fetcher, &source).await;
    let opened = reader.open(&source, loaded, Local::now().date_naive());
    if let Phase::Failed { .. } = opened.phase {
        return emit(&opened, cli.json);
    }
    debug!(document = %source.id, "document ready");

    match cli.command {
        Commands::Sources => Ok(()),
        Commands::Show(args) => {
            let view = match args.action() {
                Some(action) => reader.apply(action),
                None => opened,
            };
            emit(&view, cli.json)
        }
        Commands::Search(args) => handle_search(&mut reader, args, cli.json),
        Commands::Note(args) => handle_note(&mut reader, args, cli.json),
        Commands::Visit(args) => {
            let mut view = opened;
            for key in args.keys {
                view = reader.apply(Action::MarkVisited(EntryKey::from(key.as_str())));
            }
            if cli.json {
                return emit(&view, true);
            }
            println!("{}", view.progress.label);
            Ok(())
        }
        Commands::Progress => {
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&opened.progress)?);
                return Ok(());
            }
            println!("{}", opened.progress.label);
            match &opened.resume.target {
                Some(key) => println!("{}: {key}", opened.resume.label),
                None => println!("Nothing to resume."),
            }
            Ok(())
        }
        Commands::Reset(args) => {
            if !args.yes {
                anyhow::bail!("refusing to reset {} without --yes", source.label);
            }
            let view = reader.apply(Action::ResetProgress);
            if cli.json {
                return emit(&view, true);
            }
            println!("Progress and notes cleared for {}.", source.label);
            Ok(())
        }
        Commands::Share(args) => {
            if let Some(action) = args.action() {
                let view = reader.apply(action);
                if let Some(status) = view.status {
                    anyhow::bail!(status);
                }
            }
            let text = reader
                .session()
                .share()
                .context("no entry to share")?;
            println!("{text}");
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let directive = if verbose { "daybook=debug" } else { "daybook=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn handle_sources(config: &Config, active: &str, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&config.sources)?);
        return Ok(());
    }
    for source in &config.sources {
        let marker = if source.id.0 == active { "*" } else { " " };
        println!("{marker} {:<12} {:<28} {}", source.id.0, source.label, source.url);
    }
    Ok(())
}

fn handle_search<S: daybook::state::KeyValueStore>(
    reader: &mut Reader<S>,
    args: SearchArgs,
    json: bool,
) -> Result<()> {
    let SearchArgs { query, filter, more } = args;
    reader.apply(Action::SetFilter(filter));
    let mut view = reader.apply(Action::SetQuery(query));
    for _ in 0..more {
        view = reader.apply(Action::RevealMore);
    }
    if json {
        return emit(&view, true);
    }

    println!("{}", view.search.count_label);
    for hit in &view.search.results {
        println!("{:>6}  {}", hit.key, terminal_text(&hit.title_html));
        if !hit.snippet_html.is_empty() {
            println!("        {}", terminal_text(&hit.snippet_html));
        }
    }
    if view.search.has_more {
        println!(
            "showing {} of {}; pass --more {} for the next page",
            view.search.shown,
            view.search.total,
            more + 1
        );
    }
    Ok(())
}

fn handle_note<S: daybook::state::KeyValueStore>(
    reader: &mut Reader<S>,
    args: NoteArgs,
    json: bool,
) -> Result<()> {
    if let Some(action) = args.target.action() {
        let view = reader.apply(action);
        if let Some(status) = view.status {
            anyhow::bail!(status);
        }
    }
    let key = reader
        .session()
        .current()
        .map(|entry| entry.key.clone())
        .context("no entry to annotate")?;
    let view = reader.apply(Action::EditNote {
        key: key.clone(),
        text: args.text.join(" "),
    });
    if json {
        return emit(&view, true);
    }
    if let Some(status) = &view.status {
        println!("{status}");
    }
    match reader.session().local().note(&key) {
        Some(_) => println!("Saved note on {key}."),
        None => println!("No note on {key}."),
    }
    Ok(())
}

fn emit(view: &ViewModel, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(view)?);
    } else {
        print_view(view);
    }
    Ok(())
}

fn print_view(view: &ViewModel) {
    println!("== {} ==", view.header.title);
    if let Some(meta) = &view.header.meta_line {
        println!("{meta}");
    }
    if let Some(placeholder) = &view.placeholder {
        println!();
        println!("{placeholder}");
    }
    if let Some(status) = &view.status {
        println!();
        println!("! {status}");
    }
    if let Some(entry) = &view.current {
        println!();
        match &entry.date_label {
            Some(date) => println!("{date} | {}", entry.title),
            None => println!("{}", entry.title),
        }
        println!("[{}] {}", entry.status_label, entry.meta_label);
        if let Some(quote) = &entry.quote {
            println!();
            println!("\"{quote}\"");
        }
        if let Some(body) = &entry.body {
            println!();
            println!("{body}");
        }
        for item in &entry.items {
            println!("  - {item}");
        }
        if let Some(source) = &entry.source {
            println!("- {source}");
        }
        if !entry.note.is_empty() {
            println!();
            println!("Note: {}", entry.note);
        }
    }
    if view.phase == Phase::Ready {
        println!();
        println!("{}", view.progress.label);
    }
}

/// Highlight markup rendered for a terminal.
fn terminal_text(html: &str) -> String {
    html.replace("<mark>", "[")
        .replace("</mark>", "]")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
