use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use client_sdk::RedCloudClient;

#[derive(Debug, Parser)]
#[command(name = "redcloud")]
#[command(about = "CLI client for RedCloud Files")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8000", env = "REDCLOUD_URL")]
    server_url: String,
    /// Bearer token from a previous register/login.
    #[arg(long, env = "REDCLOUD_TOKEN")]
    token: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create an account and print its token.
    Register { username: String, password: String },
    /// Log in and print a fresh token (the old one stops working).
    Login { username: String, password: String },
    /// Upload a file with tags.
    Put {
        path: PathBuf,
        #[arg(long)]
        tags: String,
        /// Name to store under; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Download a file by id.
    Get {
        file_id: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List files matching every given tag.
    Ls {
        #[arg(long)]
        tags: String,
    },
    /// Delete files matching every given tag.
    Rm {
        #[arg(long)]
        tags: String,
    },
    /// Add tags to files matching a tag query.
    Tag {
        #[arg(long)]
        query: String,
        #[arg(long)]
        add: String,
    },
    /// Remove tags from files matching a tag query.
    Untag {
        #[arg(long)]
        query: String,
        #[arg(long)]
        remove: String,
    },
    /// Node health.
    Health,
    /// Cluster summary as seen by this metadata node.
    ClusterStatus,
    /// Known metadata peers and storage nodes.
    Nodes,
}

fn split_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|tag| tag.trim().to_string())
        .filter(|tag| !tag.is_empty())
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut client = RedCloudClient::new(&cli.server_url);
    if let Some(token) = &cli.token {
        client = client.with_token(token);
    }

    match cli.command {
        Commands::Register { username, password } => {
            let user = client.register(&username, &password).await?;
            println!("registered user {}", user.user_id);
            println!("token: {}", user.token);
        }
        Commands::Login { username, password } => {
            let token = client.login(&username, &password).await?;
            println!("token: {token}");
        }
        Commands::Put { path, tags, name } => {
            let payload = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let name = name.unwrap_or_else(|| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "unnamed".to_string())
            });

            let uploaded = client
                .upload(&name, &split_tags(&tags), Bytes::from(payload))
                .await?;
            println!(
                "stored '{}' as {} ({} bytes)",
                uploaded.file.name, uploaded.file.file_id, uploaded.file.size
            );
            if let Some(replaced) = uploaded.replaced_file_id {
                println!("replaced previous file {replaced}");
            }
        }
        Commands::Get { file_id, output } => {
            let payload = client.download(&file_id).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &payload)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("wrote {} bytes to {}", payload.len(), path.display());
                }
                None => {
                    println!("{}", String::from_utf8_lossy(&payload));
                }
            }
        }
        Commands::Ls { tags } => {
            let files = client.list(&split_tags(&tags)).await?;
            if files.is_empty() {
                println!("no files match");
            }
            for file in files {
                println!(
                    "{}  {:>10} bytes  [{}]  {}",
                    file.file_id,
                    file.size,
                    file.tags.join(","),
                    file.name
                );
            }
        }
        Commands::Rm { tags } => {
            let deleted = client.delete(&split_tags(&tags)).await?;
            println!("deleted {} file(s)", deleted.deleted_count);
            for file_id in deleted.file_ids {
                println!("  {file_id}");
            }
        }
        Commands::Tag { query, add } => {
            let result = client
                .add_tags(&split_tags(&query), &split_tags(&add))
                .await?;
            println!("tagged {} file(s)", result.updated_count);
        }
        Commands::Untag { query, remove } => {
            let result = client
                .remove_tags(&split_tags(&query), &split_tags(&remove))
                .await?;
            println!("untagged {} file(s)", result.updated_count);
            for skipped in result.skipped_files {
                println!("  skipped {skipped}: a file must keep at least one tag");
            }
        }
        Commands::Health => {
            let health = client.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::ClusterStatus => {
            let status = client.cluster_status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Nodes => {
            let nodes = client.nodes().await?;
            println!("{}", serde_json::to_string_pretty(&nodes)?);
        }
    }

    Ok(())
}
