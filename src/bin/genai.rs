use std::env;

use clap::Parser;
use log::info;
use whatsmeow_bot::genai::{GenAiError, GenerationConfig, GenerativeModel, API_KEY_ENV, DEFAULT_MODEL};
use whatsmeow_bot::logging;

/// Send one prompt to a generative model and print the answer.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Model name.
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Sampling temperature.
    #[arg(long)]
    temperature: Option<f32>,

    /// Upper bound on generated tokens.
    #[arg(long)]
    max_output_tokens: Option<u32>,

    /// Prompt text.
    #[arg(default_value = "Write a story about a magic backpack.")]
    prompt: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init("warn");
    let cli = Cli::parse();

    let api_key = env::var(API_KEY_ENV).map_err(|_| GenAiError::MissingApiKey)?;
    let model = GenerativeModel::new(api_key, cli.model)?.with_generation_config(GenerationConfig {
        temperature: cli.temperature,
        max_output_tokens: cli.max_output_tokens,
        ..Default::default()
    });

    info!("Querying {}", model.model());
    let response = model.generate_content(&cli.prompt)?;
    for candidate in &response.candidates {
        if let Some(content) = &candidate.content {
            println!("{}", content.text());
        }
    }
    Ok(())
}
