use std::{path::PathBuf, time::Instant};

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use organizer::autosave::SaveReport;
use organizer::config::OrganizerConfig;
use organizer::core::{CardId, CollectionId, GroupId, SpaceId, SpaceTag};
use organizer::drag::{DragItem, DragPhase, DragSession, DropOutcome, DropTarget};
use organizer::engine::Organizer;
use organizer::snapshot;
use organizer::storage::{FileStore, PIPELINE_KEY, SnapshotStore, TREE_KEY};
use organizer::tree::{Locator, Node, WorkspaceTree};
use organizer::views::{self, ItemQuery};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "organizer",
    about = "Workspace tree and stage pipeline organizer",
    version
)]
struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write empty snapshots into the store directory.
    Init,
    /// Print the workspace tree.
    Tree(ListArgs),
    #[command(subcommand)]
    Space(SpaceCommand),
    #[command(subcommand)]
    Group(GroupCommand),
    #[command(subcommand)]
    Collection(CollectionCommand),
    #[command(subcommand)]
    Task(TaskCommand),
    /// Drag a tree node into a container (`item:<id>`, `collection:<id>`, `group:<id>`).
    Move(MoveArgs),
    /// Flip the open flag of a space or group.
    Toggle(ToggleArgs),
    /// Print the pipeline board.
    Board(BoardArgs),
    #[command(subcommand)]
    Stage(StageCommand),
    #[command(subcommand)]
    Card(CardCommand),
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Emit JSON instead of an indented listing.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum SpaceCommand {
    Add {
        name: String,
        #[arg(long, default_value = "slate")]
        color: String,
        #[arg(long)]
        icon: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum GroupCommand {
    Add { space: SpaceId, name: String },
}

#[derive(Debug, Subcommand)]
enum CollectionCommand {
    /// Add a collection to a space root (`space/<id>`) or group (`space/<id>/group/<id>`).
    Add { at: Locator, name: String },
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    Add { collection: CollectionId, title: String },
}

#[derive(Debug, Args)]
struct MoveArgs {
    item: DragItem,
    to: Locator,
    /// Slot in the destination; appends when omitted.
    #[arg(long)]
    index: Option<usize>,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    #[arg(long, conflicts_with = "group", required_unless_present = "group")]
    space: Option<SpaceId>,
    #[arg(long)]
    group: Option<GroupId>,
}

#[derive(Debug, Args)]
struct BoardArgs {
    #[arg(long)]
    json: bool,
    /// Include archived cards.
    #[arg(long)]
    all: bool,
    /// Only cards whose name or fields contain this text.
    #[arg(long)]
    filter: Option<String>,
}

#[derive(Debug, Subcommand)]
enum StageCommand {
    /// Insert a stage after `after` (0 for the front).
    Insert {
        after: u32,
        title: String,
        #[arg(long, default_value = "")]
        short: String,
    },
    /// Delete a stage; its cards move to the previous stage.
    Delete {
        number: u32,
        #[arg(long)]
        confirm: String,
    },
    Rename {
        number: u32,
        title: String,
        #[arg(long, default_value = "")]
        short: String,
    },
}

#[derive(Debug, Subcommand)]
enum CardCommand {
    Add {
        name: String,
        #[arg(long, default_value_t = 1)]
        stage: u32,
    },
    Move { card: CardId, stage: u32 },
    Archive {
        card: CardId,
        #[arg(long)]
        confirm: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = OrganizerConfig::load(cli.config.as_deref())?;
    init_tracing(cli.verbose, &config.log_level);

    let store_dir = config.store_dir()?;
    let defaults = config.initial_documents()?;
    let (mut org, notices) = Organizer::open(
        FileStore::new(&store_dir),
        config.autosave_quiet(),
        defaults,
    );
    for notice in &notices {
        eprintln!("warning: {}", notice.notice());
    }

    let result = run(cli.command, &config, &mut org);
    report(&org.flush())?;
    result
}

fn init_tracing(verbose: bool, level: &str) {
    let fallback = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run(command: Commands, config: &OrganizerConfig, org: &mut Organizer<FileStore>) -> Result<()> {
    let now = Instant::now();
    match command {
        Commands::Init => handle_init(org),
        Commands::Tree(args) => handle_tree(org.tree(), args),
        Commands::Space(SpaceCommand::Add { name, color, icon }) => {
            let id = org.edit_tree(now, |t| t.create_space(&name, SpaceTag { color, icon }))?;
            println!("{id}");
            Ok(())
        }
        Commands::Group(GroupCommand::Add { space, name }) => {
            let id = org.edit_tree(now, |t| t.create_group(space, &name, None))?;
            println!("{id}");
            Ok(())
        }
        Commands::Collection(CollectionCommand::Add { at, name }) => {
            let id = org.edit_tree(now, |t| t.create_collection(&at, &name, None))?;
            println!("{id}");
            Ok(())
        }
        Commands::Task(TaskCommand::Add { collection, title }) => {
            let at = org
                .tree()
                .items_locator(collection)
                .with_context(|| format!("collection {collection} is not in the tree"))?;
            let id = org.edit_tree(now, |t| t.create_item(&at, &title, Utc::now(), None))?;
            println!("{id}");
            Ok(())
        }
        Commands::Move(MoveArgs { item, to, index }) => {
            let target = DropTarget::Between {
                locator: to,
                index: index.unwrap_or(usize::MAX),
            };
            drag(org, item, target, now)
        }
        Commands::Toggle(ToggleArgs { space, group }) => {
            let open = match (space, group) {
                (Some(space), _) => org.edit_tree(now, |t| t.toggle_space(space))?,
                (None, Some(group)) => org.edit_tree(now, |t| t.toggle_group(group))?,
                (None, None) => bail!("pass --space or --group"),
            };
            println!("{}", if open { "open" } else { "closed" });
            Ok(())
        }
        Commands::Board(args) => handle_board(org, args),
        Commands::Stage(cmd) => handle_stage(org, config, cmd, now),
        Commands::Card(cmd) => handle_card(org, config, cmd, now),
    }
}

fn handle_init(org: &Organizer<FileStore>) -> Result<()> {
    let store = org.store();
    for (key, record) in [
        (TREE_KEY, snapshot::encode(org.tree())?),
        (PIPELINE_KEY, snapshot::encode(org.pipeline())?),
    ] {
        if store.load(key)?.is_some() {
            eprintln!("{key} already exists; left as is");
            continue;
        }
        store.save(key, &record)?;
    }
    println!("{}", store.dir().display());
    Ok(())
}

fn handle_tree(tree: &WorkspaceTree, args: ListArgs) -> Result<()> {
    let summaries = views::space_summaries(tree);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }
    if summaries.is_empty() {
        eprintln!("No spaces yet. Add one with `organizer space add <name>`.");
        return Ok(());
    }
    let query = ItemQuery::default();
    for space in summaries {
        let marker = if space.open { "-" } else { "+" };
        println!("{marker} {} [{}] space/{}", space.name, space.color, space.id);
        if !space.open {
            continue;
        }
        for group in views::items_in(tree, &Locator::SpaceGroups { space: space.id }, &query)? {
            let Node::Group(group_id) = group.node else {
                continue;
            };
            let open = group.open.unwrap_or(true);
            println!("  {} {}/ group:{group_id}", if open { "-" } else { "+" }, group.name);
            if open {
                let at = Locator::GroupCollections {
                    space: space.id,
                    group: group_id,
                };
                print_collections(tree, &at, "    ")?;
            }
        }
        print_collections(tree, &Locator::SpaceCollections { space: space.id }, "  ")?;
    }
    Ok(())
}

fn print_collections(tree: &WorkspaceTree, at: &Locator, indent: &str) -> Result<()> {
    let query = ItemQuery::default();
    for row in views::items_in(tree, at, &query)? {
        let Node::Collection(id) = row.node else {
            continue;
        };
        let progress = row.progress.unwrap_or_default();
        println!(
            "{indent}{} ({}) [{}/{}] collection:{id}",
            row.name, row.children, progress.done, progress.total
        );
        if let Some(items) = tree.items_locator(id) {
            for item in views::items_in(tree, &items, &query)? {
                let status = item
                    .status
                    .map(|s| format!("{s:?}"))
                    .unwrap_or_default();
                let node = match item.node {
                    Node::WorkItem(id) => DragItem::WorkItem(id),
                    _ => continue,
                };
                println!("{indent}  {:<10} {} {node}", status, item.name);
            }
        }
    }
    Ok(())
}

fn handle_board(org: &Organizer<FileStore>, args: BoardArgs) -> Result<()> {
    let query = ItemQuery {
        text: args.filter,
        include_archived: args.all,
        ..ItemQuery::default()
    };
    let columns = views::stage_columns(org.pipeline(), &query);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&columns)?);
        return Ok(());
    }
    for column in columns {
        println!("{:>2}. {} ({})", column.number, column.title, column.count);
        for card in column.cards {
            let archived = if card.archived { " [archived]" } else { "" };
            println!(
                "      {} [{}/{}]{archived} card:{}",
                card.name, card.progress.done, card.progress.total, card.id
            );
        }
    }
    Ok(())
}

fn handle_stage(
    org: &mut Organizer<FileStore>,
    config: &OrganizerConfig,
    cmd: StageCommand,
    now: Instant,
) -> Result<()> {
    match cmd {
        StageCommand::Insert { after, title, short } => {
            let number = org.edit_pipeline(now, |p| p.insert_stage_after(after, &title, &short))?;
            println!("inserted stage {number}");
        }
        StageCommand::Delete { number, confirm } => {
            let auth = config.gate().confirm(&confirm)?;
            let deletion = org.edit_pipeline(now, |p| p.delete_stage(number, &auth))?;
            println!(
                "deleted {:?}; {} card(s) moved to stage {}",
                deletion.removed.title,
                deletion.reassigned.len(),
                deletion.spilled_into
            );
        }
        StageCommand::Rename {
            number,
            title,
            short,
        } => {
            org.edit_pipeline(now, |p| p.rename_stage(number, &title, &short))?;
        }
    }
    Ok(())
}

fn handle_card(
    org: &mut Organizer<FileStore>,
    config: &OrganizerConfig,
    cmd: CardCommand,
    now: Instant,
) -> Result<()> {
    match cmd {
        CardCommand::Add { name, stage } => {
            let id = org.edit_pipeline(now, |p| p.create_card(&name, stage, Utc::now()))?;
            println!("{id}");
        }
        CardCommand::Move { card, stage } => {
            drag(org, DragItem::Card(card), DropTarget::Stage(stage), now)?;
        }
        CardCommand::Archive { card, confirm } => {
            let auth = config.gate().confirm(&confirm)?;
            org.edit_pipeline(now, |p| p.archive_card(card, &auth))?;
        }
    }
    Ok(())
}

/// One scripted drag: pick up, hover the target, release.
fn drag(
    org: &mut Organizer<FileStore>,
    item: DragItem,
    target: DropTarget,
    now: Instant,
) -> Result<()> {
    let mut session = DragSession::new();
    session.begin(item, org.documents())?;
    if session.hover(target, org.documents()) != DragPhase::HoveringLegalTarget {
        let reason = session
            .rejection()
            .map(|(_, r)| format!("{r:?}"))
            .unwrap_or_else(|| "no target".to_string());
        session.cancel();
        bail!("{item} cannot be dropped there ({reason})");
    }
    match org.commit_drop(&mut session, now)? {
        DropOutcome::Dropped { .. } => println!("moved {item}"),
        other => println!("{other:?}"),
    }
    Ok(())
}

fn report(saved: &SaveReport) -> Result<()> {
    for failure in &saved.failures {
        eprintln!("warning: {}", failure.notice());
    }
    if !saved.is_clean() {
        bail!("{} snapshot write(s) failed", saved.failures.len());
    }
    Ok(())
}
