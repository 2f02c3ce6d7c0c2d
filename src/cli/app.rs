use super::demo::{self, DemoOptions};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use doctxn::ClientConfig;

pub const DEFAULT_URL: &str =
    "doctxn://localhost:27017/sample_restaurants?w=majority&readConcernLevel=local";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Run document writes as one transactional unit of work."
)]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set (e.g. info, debug).
    #[arg(long = "log-level", global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Insert two restaurants in a single transaction, optionally injecting failures.
    Demo {
        /// Connection string for the in-memory client.
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,

        /// Fail this many inserts with a transient network error.
        #[arg(long = "transient-failures", default_value_t = 0)]
        transient_failures: u32,

        /// Fail this many commits with a network error (unknown commit result).
        #[arg(long = "commit-failures", default_value_t = 0)]
        commit_failures: u32,

        /// Apply the failing commits before reporting the error.
        #[arg(long = "lost-ack", action = ArgAction::SetTrue)]
        lost_ack: bool,

        /// Make the second insert fail with a non-retryable error.
        #[arg(long, action = ArgAction::SetTrue)]
        fatal: bool,

        /// Print the collection and store statistics as JSON.
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },

    /// Parse a connection string and print the resulting configuration.
    Config {
        #[arg(value_name = "URL")]
        url: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Demo {
                url,
                transient_failures,
                commit_failures,
                lost_ack,
                fatal,
                json,
            } => {
                let options = DemoOptions {
                    url,
                    transient_failures,
                    commit_failures,
                    lost_ack,
                    fatal,
                    json,
                };
                demo::run(&options).await
            }
            Command::Config { url } => print_config(&url),
        }
    }
}

fn print_config(url: &str) -> Result<()> {
    let config = ClientConfig::from_url(url)
        .with_context(|| format!("invalid connection string '{url}'"))?;
    let policy = &config.retry_policy;

    println!("host:               {}", config.host);
    println!("port:               {}", config.port);
    println!("database:           {}", config.database);
    println!("app name:           {}", config.app_name.as_deref().unwrap_or("-"));
    println!("read concern:       {}", config.read_concern);
    println!("write concern:      {}", config.write_concern);
    println!("max attempts:       {}", policy.max_attempts);
    println!("max commit retries: {}", policy.max_commit_attempts);
    println!("max elapsed:        {}ms", policy.max_elapsed.as_millis());
    match policy.timeout {
        Some(limit) => println!("timeout:            {}ms", limit.as_millis()),
        None => println!("timeout:            none"),
    }
    println!("normalized:         {}", config.to_url());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_demo_flags() {
        let cli = Cli::parse_from([
            "doctxn",
            "demo",
            "--transient-failures",
            "2",
            "--commit-failures",
            "1",
            "--lost-ack",
        ]);
        match cli.command {
            Command::Demo {
                url,
                transient_failures,
                commit_failures,
                lost_ack,
                fatal,
                ..
            } => {
                assert_eq!(url, DEFAULT_URL);
                assert_eq!(transient_failures, 2);
                assert_eq!(commit_failures, 1);
                assert!(lost_ack);
                assert!(!fatal);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_print_config_rejects_bad_url() {
        assert!(print_config("mongodb://localhost").is_err());
        assert!(print_config(DEFAULT_URL).is_ok());
    }
}
