use std::process::ExitCode;

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde::Serialize;
use tracing::info;

use feedguard::{GuardConfig, SecureFetcher, UrlValidator, ValidationResult};

/// Check or fetch feed URLs through the SSRF guard.
#[derive(Parser)]
#[command(name = "feedguard", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate URLs and print one JSON verdict per line.
    Check {
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Fetch a URL through the guarded client and print a summary.
    Fetch { url: String },
    /// Print the effective configuration as JSON.
    Config,
}

#[derive(Serialize)]
struct Verdict<'a> {
    url: &'a str,
    #[serde(flatten)]
    result: ValidationResult,
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("feedguard=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = GuardConfig::from_env()?;

    match cli.command {
        Command::Check { urls } => {
            let validator = UrlValidator::new();
            let results = join_all(urls.iter().map(|u| validator.validate(u))).await;

            let mut all_valid = true;
            for (url, result) in urls.iter().zip(results) {
                all_valid &= result.is_valid();
                println!("{}", serde_json::to_string(&Verdict { url, result })?);
            }
            Ok(if all_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Fetch { url } => {
            let fetcher = SecureFetcher::new(config.fetch)?;
            match fetcher.fetch(&url).await {
                Ok(feed) => {
                    info!(redirects = ?feed.redirects, "fetch complete");
                    println!(
                        "{} {} ({} bytes, {})",
                        feed.status,
                        feed.url,
                        feed.body.len(),
                        feed.content_type.as_deref().unwrap_or("unknown type")
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    eprintln!("{e}");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
