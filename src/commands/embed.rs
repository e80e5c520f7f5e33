// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embed command: prints one embedding as JSON

use anyhow::Result;
use serde::Serialize;
use std::path::Path;

use evidex::config::Config;
use evidex::embedding::EmbeddingClient;
use evidex::output::to_json;

use super::IndexLayout;

#[derive(Serialize)]
struct EmbedOutput<'a> {
    model: &'a str,
    dimension: usize,
    embedding: Vec<f32>,
}

pub fn run(text: &str, index: Option<&Path>, compact: bool) -> Result<()> {
    let config = Config::load()?;
    let layout = IndexLayout::resolve(index, &config);
    let client = EmbeddingClient::from_config(&config, &layout.root)?;
    let embedding = client.embed_one(text)?;

    let output = EmbedOutput {
        model: client.model_id(),
        dimension: embedding.len(),
        embedding,
    };
    println!("{}", to_json(&output, compact)?);
    Ok(())
}
