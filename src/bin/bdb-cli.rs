//! Thin command-line consumer of the engine: open a database rooted at a
//! directory and run one operation against a collection.

use bdb_core::index::{Direction, ValueType};
use bdb_core::Database;
use bson::Document;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bdb-cli", about = "Command-line client for the sharded document store")]
struct Cli {
    /// Root directory the database is stored under.
    #[arg(long, default_value = "./bdb-data")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inserts a JSON document into a collection.
    Insert { collection: String, json: String },
    /// Fetches a record by id.
    Get { collection: String, id: String },
    /// Deep-merges a JSON updates document into a record.
    Update { collection: String, id: String, json: String },
    /// Deletes a record by id.
    Delete { collection: String, id: String },
    /// Creates and builds a sort index on a field.
    EnsureIndex {
        collection: String,
        field: String,
        #[arg(long, default_value = "asc")]
        direction: String,
    },
    /// Lists every record across all shards, in shard-id order.
    Scan { collection: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = bdb_core::init();
    let cli = Cli::parse();
    let db = Database::open(&cli.root);

    match cli.command {
        Command::Insert { collection, json } => {
            let value: serde_json::Value = serde_json::from_str(&json)?;
            let doc: Document = bson::to_document(&value)?;
            let col = db.collection(&collection).await;
            let id = col.insert(None, doc, None).await?;
            println!("{}", bdb_core::ids::canonical(&id));
        }
        Command::Get { collection, id } => {
            let col = db.collection(&collection).await;
            match col.get(&id).await? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record.fields)?),
                None => println!("null"),
            }
        }
        Command::Update { collection, id, json } => {
            let value: serde_json::Value = serde_json::from_str(&json)?;
            let updates: Document = bson::to_document(&value)?;
            let col = db.collection(&collection).await;
            let applied = col.update(&id, &updates, false, None).await?;
            println!("{applied}");
        }
        Command::Delete { collection, id } => {
            let col = db.collection(&collection).await;
            let deleted = col.delete(&id).await?;
            println!("{deleted}");
        }
        Command::EnsureIndex { collection, field, direction } => {
            let dir = Direction::from_str(&direction);
            let col = db.collection(&collection).await;
            col.ensure_sort_index(&field, dir, None::<ValueType>).await?;
            println!("index ready");
        }
        Command::Scan { collection } => {
            let col = db.collection(&collection).await;
            for record in col.iterate_records().await? {
                println!("{} {}", bdb_core::ids::canonical(&record.id), record.fields);
            }
        }
    }
    Ok(())
}
