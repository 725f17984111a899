/*!
 * Copyright (c) 2026 Ming Lyu, aka mingcheng
 *
 * This source code is licensed under the MIT License,
 * which is located in the LICENSE file in the source tree's root directory.
 *
 * File: main.rs
 * Author: mingcheng <mingcheng@apache.org>
 * File Created: 2026-02-12 15:38:23
 *
 * Modified By: mingcheng <mingcheng@apache.org>
 * Last Modified: 2026-03-04 15:02:16
 */

use clap::Parser;
use log::{error, info};
use sender_mail_fetcher::config::AppConfig;
use sender_mail_fetcher::fetch_most_recent_email;
use std::io::Write;

struct MultiWriter {
    writers: Vec<Box<dyn Write + Send + 'static>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for w in &mut self.writers {
            let _ = w.write(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for w in &mut self.writers {
            let _ = w.flush();
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    /// Sender address to search for, overrides `sender` from the config
    #[arg(short, long)]
    sender: Option<String>,
}

fn initialize_logger(config: &AppConfig) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();

    if let Some(level) = &config.log_level {
        builder.parse_filters(level);
    } else if let Ok(env_level) = std::env::var("RUST_LOG") {
        builder.parse_filters(&env_level);
    } else {
        builder.filter_level(log::LevelFilter::Info);
    }

    if let Some(log_file) = &config.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .map_err(|e| anyhow::anyhow!("Failed to open log file {}: {}", log_file, e))?;

        if config.quiet {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        } else {
            let multi_writer = MultiWriter {
                writers: vec![Box::new(file), Box::new(std::io::stderr())],
            };
            builder.target(env_logger::Target::Pipe(Box::new(multi_writer)));
        }
    } else if config.quiet {
        builder.target(env_logger::Target::Pipe(Box::new(std::io::sink())));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = match args.config {
        Some(path) => AppConfig::new_from_file(&path),
        None => AppConfig::new(),
    }
    .unwrap_or_else(|e| {
        eprintln!("Failed to load config: {:?}", e);
        if let Ok(path) = std::env::current_dir() {
            eprintln!("Current search path: {:?}", path);
        }
        eprintln!("Please create a `config.toml` or set APP_... environment variables, or specify a config file with --config.");
        std::process::exit(1);
    });

    initialize_logger(&config)?;

    let Some(sender) = args.sender.or_else(|| config.sender.clone()) else {
        error!("No sender given. Use --sender or set `sender` in the config.");
        std::process::exit(1);
    };

    info!("Looking up the latest email from {}", sender);

    match fetch_most_recent_email(&config.imap, &sender).await {
        Ok(text) => {
            println!("{}", text);
            Ok(())
        }
        Err(e) => {
            error!("Failed to fetch email from {}: {:?}", sender, e);
            std::process::exit(1);
        }
    }
}
