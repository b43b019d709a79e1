//! CLI command implementations.

use anyhow::{bail, Result};
use std::io::Write;
use tipfs_tree::{fetch_advertisement, Node, RemoteTree, Transport};
use tokio::io::AsyncWriteExt;

/// Prints the advertised refs and capabilities.
pub async fn refs<T: Transport>(transport: &T) -> Result<()> {
    let advertisement = fetch_advertisement(transport).await?;
    let mut out = std::io::stdout().lock();
    for reference in &advertisement.refs {
        writeln!(out, "{}\t{}", reference.id, reference.name)?;
    }
    writeln!(out, "# capabilities: {}", advertisement.capabilities)?;
    Ok(())
}

async fn describe(tree: &RemoteTree, node: &Node) -> Result<String> {
    if node.is_directory {
        return Ok(format!("d {:>10}  {}", "-", node.name));
    }
    let length = tree.length(&node.path).await?.unwrap_or_default();
    Ok(format!("f {:>10}  {}", length, node.name))
}

/// Lists a directory, descending into subdirectories when `recursive`.
///
/// Plain output prints `d` or `f`, the file length, and the name (the full
/// path when recursive).
pub async fn ls(tree: &RemoteTree, path: &str, recursive: bool, json: bool) -> Result<()> {
    let listing = tree.list_directory(path).await;
    if !listing.exists {
        // Distinguish a broken remote from a missing path.
        tree.populate().await?;
        bail!("not a directory: {path}");
    }

    let mut nodes = Vec::new();
    let mut pending = vec![listing.entries];
    while let Some(entries) = pending.pop() {
        for node in entries {
            if recursive && node.is_directory {
                pending.push(tree.list_directory(&node.path).await.entries);
            }
            nodes.push(node);
        }
    }
    nodes.sort_by(|a, b| a.path.cmp(&b.path));

    if json {
        let mut out = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut out, &nodes)?;
        writeln!(out)?;
        return Ok(());
    }

    let mut lines = Vec::with_capacity(nodes.len());
    for node in &nodes {
        let mut line = describe(tree, node).await?;
        if recursive {
            line = format!("{line}\t{}", node.path);
        }
        lines.push(line);
    }
    let mut out = std::io::stdout().lock();
    for line in lines {
        writeln!(out, "{line}")?;
    }
    Ok(())
}

/// Prints a node and, for files, its length.
pub async fn stat(tree: &RemoteTree, path: &str) -> Result<()> {
    let node = tree.get_node(path).await;
    if !node.exists {
        tree.populate().await?;
        bail!("no such path: {path}");
    }
    let length = tree.length(path).await?;

    let mut value = serde_json::to_value(&node)?;
    if let (Some(length), Some(object)) = (length, value.as_object_mut()) {
        object.insert("length".to_string(), length.into());
    }
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

/// Writes a file's content to stdout.
pub async fn cat(tree: &RemoteTree, path: &str) -> Result<()> {
    let Some(mut reader) = tree.read(path).await? else {
        bail!("not a file: {path}");
    };
    let mut stdout = tokio::io::stdout();
    let written = tokio::io::copy(&mut reader, &mut stdout).await?;
    stdout.flush().await?;
    tracing::debug!(path, bytes = written, "wrote file");
    Ok(())
}
