//! Basic Tandem Example
//!
//! Walks through the embedded project API: saving files, branching, a merge
//! preview and the resulting history.
//!
//! Run with: cargo run --example basic

use std::sync::Arc;

use tandem_core::{ActorId, ChangeMetadata, DocPath, DocumentId, DocumentStore, Value};
use tandem_project::{NoopHooks, Project};
use tandem_storage::{save_document, MemoryStorage, Storage};

const LEVEL: &str = r#"[gd_scene load_steps=2 format=3]

[node name="Level" type="Node2D"]

[node name="Player" type="CharacterBody2D" parent="."]
position = Vector2(0, 0)
speed = 200
"#;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("Tandem Basic Example\n");

    println!("=== Document Store ===\n");
    store_example().await?;

    println!("\n=== Project Branches ===\n");
    project_example().await?;

    println!("\n=== Working Directory ===\n");
    working_directory_example().await?;

    Ok(())
}

async fn store_example() -> Result<(), Box<dyn std::error::Error>> {
    let store = DocumentStore::new(ActorId::new("demo"));

    let id = DocumentId::new("settings:editor")?;
    store.create(id.clone())?;
    let meta = ChangeMetadata::default().with_username("demo");
    store.set(&id, DocPath::root().key("theme"), "dark", meta.clone())?;
    store.set(&id, DocPath::root().key("font_size"), Value::from(14i64), meta)?;

    println!(
        "Theme: {:?}",
        store.get_value(&id, &DocPath::root().key("theme"))?
    );
    println!("Heads: {}", store.heads(&id)?);

    let storage = MemoryStorage::new();
    save_document(&storage, &store.get(&id)?, 0).await?;
    let stats = storage.stats().await?;
    println!(
        "Stored {} changes across {:?}",
        stats.change_count,
        storage.list(None).await?
    );

    Ok(())
}

async fn project_example() -> Result<(), Box<dyn std::error::Error>> {
    let project = Project::in_memory().await?;
    let main = project.main_branch().await?;

    project.save_file("level.tscn", LEVEL).await?;
    project.save_file("README.txt", "A tiny platformer").await?;

    // Fork and move the player on the new branch
    let feature = project.create_branch("faster-player").await?;
    project.checkout_branch(&feature.id).await?;
    project
        .save_file("level.tscn", LEVEL.replace("speed = 200", "speed = 320"))
        .await?;

    // Main keeps moving in the meantime
    project.checkout_branch(&main.id).await?;
    project.save_file("README.txt", "A tiny, fast platformer").await?;

    println!(
        "Safe to merge {}: {}",
        feature.name,
        project.is_safe_to_merge(&feature.id).await?
    );

    let preview = project
        .create_merge_preview_branch(&feature.id, &main.id)
        .await?;
    println!("Preview branch: {}", preview.name);
    if let Some(diff) = project.get_default_diff().await? {
        for file in &diff.files {
            println!("  {} {}", file.change_type, file.path);
            for (node, change) in &file.node_diffs {
                println!("    {} {}", change.change_type, node);
            }
        }
    }
    project.confirm_merge_preview(&preview.id).await?;

    println!("\nHistory of main:");
    for change in project.get_changes().await? {
        println!("  {} {}", change.hash.short(), change.summary);
    }

    println!("\nBranches:");
    for branch in project.get_branches().await? {
        println!("  - {} ({})", branch.name, branch.id);
    }

    Ok(())
}

async fn working_directory_example() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let project = Project::open(dir.path()).await?;
    project.save_file("notes.txt", "written through the API").await?;

    project.start_watching(Arc::new(NoopHooks)).await?;
    println!(
        "On disk: {}",
        std::fs::read_to_string(dir.path().join("notes.txt"))?
    );

    std::fs::write(dir.path().join("todo.txt"), "written on disk")?;
    project.inject_fs_event("todo.txt").await?;
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    println!("Files: {:?}", project.list_all_files().await?);
    project.close().await?;

    Ok(())
}
