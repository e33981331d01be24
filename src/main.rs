//! Command-line front end for a MindNote collection.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use mindnote::backup::{restore_into, BackupTarget, LocalFolderBackup};
use mindnote::clock::{Clock, SystemClock};
use mindnote::render::links::NoteLinkTable;
use mindnote::types::NoteLink;
use mindnote::{backlinks, transfer, Config, MarkdownRenderer, NotePatch, NoteStore, NotesCache, SqliteNoteStore};

#[derive(Parser, Debug)]
#[command(name = "mindnote")]
#[command(about = "Local Markdown notes with cross-note links")]
struct Args {
    /// SQLite database (defaults to the configured path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List notes, pinned first
    List {
        /// Number of pages to load
        #[arg(long, default_value_t = 1)]
        page: usize,
    },
    /// Create a note
    New {
        title: String,
        #[arg(long, default_value = "")]
        content: String,
    },
    /// Print a note's Markdown
    Show { id: i64 },
    /// Print a note rendered to HTML
    Render { id: i64 },
    /// Change a note's title and/or content
    Edit {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        content: Option<String>,
    },
    /// Toggle a note's pin
    Pin { id: i64 },
    Delete { id: i64 },
    Search { query: String },
    /// Notes that link to this one
    Backlinks { id: i64 },
    /// Export every note as JSON (or Markdown)
    Export {
        #[arg(long)]
        markdown: bool,
        /// Output file (stdout if omitted)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Import a JSON or Markdown export
    Import {
        file: PathBuf,
        #[arg(long)]
        markdown: bool,
    },
    /// Write a backup to a folder
    Backup {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Import the notes of a folder backup
    Restore {
        #[arg(long)]
        dir: Option<PathBuf>,
    },
}

fn print_row(meta: &mindnote::NoteMetadata) {
    let pin = if meta.pinned { "📌" } else { "  " };
    println!("{pin} {:>5}  {}  ({} words)", meta.id, meta.title, meta.word_count);
}

/// Block until every debounced write has reached the store.
async fn wait_for_writes(cache: &NotesCache, debounce: Duration) {
    tokio::time::sleep(debounce).await;
    while cache.pending_write_count() > 0 {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn link_table(store: &dyn NoteStore) -> Result<NoteLinkTable> {
    let notes = store.all_notes().await?;
    Ok(notes.into_iter().map(|n| NoteLink { id: n.id, title: n.title }).collect())
}

fn write_output(out: Option<&Path>, text: &str) -> Result<()> {
    match out {
        Some(path) => std::fs::write(path, text).with_context(|| format!("writing {}", path.display())),
        None => {
            println!("{text}");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    mindnote::init_logging();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::load(),
    };
    let db_path = args.db.clone().unwrap_or_else(|| config.database_path.clone());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn NoteStore> = Arc::new(
        SqliteNoteStore::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    );
    let cache = NotesCache::new(store.clone(), clock.clone(), config.cache.clone());

    match args.command {
        Command::List { page } => {
            cache.load_page(true).await;
            for _ in 1..page {
                cache.load_more().await;
            }
            let state = cache.snapshot().await;
            for meta in &state.notes {
                print_row(meta);
            }
            println!("{} of {} notes", state.notes.len(), state.total_count);
        }
        Command::New { title, content } => {
            let id = cache.create(&title, &content).await?;
            println!("{id}");
        }
        Command::Show { id } => {
            let Some(note) = store.get_note(id).await? else { bail!("note {id} not found") };
            println!("# {}\n\n{}", note.title, note.content);
        }
        Command::Render { id } => {
            let Some(note) = store.get_note(id).await? else { bail!("note {id} not found") };
            let links = link_table(store.as_ref()).await?;
            let mut renderer = MarkdownRenderer::new(&config.render, clock.clone());
            println!("{}", renderer.render(&note.content, &links));
        }
        Command::Edit { id, title, content } => {
            let patch = NotePatch { title, content, pinned: None };
            if patch.is_empty() {
                bail!("nothing to change: pass --title and/or --content");
            }
            if store.get_note(id).await?.is_none() {
                bail!("note {id} not found");
            }
            cache.update(id, patch).await;
            wait_for_writes(&cache, config.cache.update_debounce()).await;
        }
        Command::Pin { id } => {
            let pinned = store.toggle_pin(id).await?;
            println!("{}", if pinned { "pinned" } else { "unpinned" });
        }
        Command::Delete { id } => {
            if store.get_note(id).await?.is_none() {
                bail!("note {id} not found");
            }
            cache.delete(id).await;
        }
        Command::Search { query } => {
            cache.search(&query).await;
            tokio::time::sleep(config.cache.search_debounce() + Duration::from_millis(50)).await;
            while cache.is_loading().await {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            for meta in cache.notes().await {
                print_row(&meta);
            }
        }
        Command::Backlinks { id } => {
            let notes = store.all_notes().await?;
            for note in backlinks::backlinks(id, &notes) {
                println!("{:>5}  {}", note.id, note.title);
            }
        }
        Command::Export { markdown, out } => {
            let text = if markdown {
                transfer::export_markdown(store.as_ref()).await?
            } else {
                transfer::export_json(store.as_ref()).await?
            };
            write_output(out.as_deref(), &text)?;
        }
        Command::Import { file, markdown } => {
            let text = std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
            let as_markdown = markdown || file.extension().is_some_and(|ext| ext == "md");
            let count = if as_markdown {
                transfer::import_markdown(store.as_ref(), &text).await?
            } else {
                transfer::import_json(store.as_ref(), &text).await?
            };
            println!("imported {count} notes");
        }
        Command::Backup { dir } => {
            let target = LocalFolderBackup::new(dir.unwrap_or_else(|| config.backup_dir.clone()), clock.clone());
            let notes = store.all_notes().await?;
            target.backup(&notes).await?;
            println!("backed up {} notes to {}", notes.len(), target.backup_path().display());
        }
        Command::Restore { dir } => {
            let target = LocalFolderBackup::new(dir.unwrap_or_else(|| config.backup_dir.clone()), clock.clone());
            let count = restore_into(store.as_ref(), &target).await?;
            println!("restored {count} notes");
        }
    }

    Ok(())
}
