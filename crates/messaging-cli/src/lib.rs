//! # Messaging CLI
//!
//! Command-line interface for the messaging runtime.
//!
//! This module provides CLI commands for:
//! - Publishing messages, optionally deduplicated by an attribute
//! - Consuming from a durable subscription group
//! - Listening through a throwaway subscription
//! - Validating and printing configuration

use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use messaging_runtime::{
    with_publisher, BackendRegistry, ConfigurationError, ConsumerError, ConsumerOptions,
    HandlerOutcome, Message, Messaging, MessagingError, MessagingSettings, TopicName,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// Messaging CLI - publish, consume and inspect topics
#[derive(Parser)]
#[command(name = "messaging")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish and consume messages through the configured broker")]
#[command(
    long_about = "Publishes and consumes messages through the configured broker backend, with optional publisher-side deduplication"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "MESSAGING_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level, used when RUST_LOG is not set
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Publish a single message
    Publish {
        /// Topic to publish to
        #[arg(short, long, value_parser = parse_topic)]
        topic: TopicName,

        /// Message payload
        #[arg(short, long)]
        data: String,

        /// Message attribute as key=value, may be repeated
        #[arg(short, long = "attribute", value_parser = parse_attribute)]
        attributes: Vec<(String, String)>,

        /// Attribute whose value identifies duplicates
        #[arg(long)]
        deduplicate_by: Option<String>,
    },

    /// Consume messages from a subscription group
    Consume {
        /// Topic to consume from
        #[arg(short, long, value_parser = parse_topic)]
        topic: TopicName,

        /// Subscription group, defaults to the topic name
        #[arg(short, long)]
        group: Option<String>,

        /// Consumer name within the group, defaults to the topic name
        #[arg(long)]
        name: Option<String>,

        /// Stop after this many messages
        #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..))]
        count: Option<u64>,

        /// Leave messages unacknowledged so they are delivered again
        #[arg(long)]
        no_ack: bool,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Consume new messages through a temporary subscription
    Listen {
        /// Topic to listen on
        #[arg(short, long, value_parser = parse_topic)]
        topic: TopicName,

        /// Stop after this many messages
        #[arg(short = 'n', long, value_parser = clap::value_parser!(u64).range(1..))]
        count: Option<u64>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Validate configuration
    Config {
        /// Print the effective configuration
        #[arg(short, long)]
        show: bool,

        /// Format used with --show
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },
}

/// Output format options for received messages
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// One JSON object per line
    Json,
}

/// Configuration format options
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Consumer error: {0}")]
    Consumer(#[from] ConsumerError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output error: {message}")]
    Output { message: String },

    #[error("Logging setup failed: {message}")]
    Logging { message: String },
}

// ============================================================================
// Argument parsing helpers
// ============================================================================

/// Parse a topic argument
pub fn parse_topic(value: &str) -> Result<TopicName, String> {
    TopicName::new(value.to_string()).map_err(|e| e.to_string())
}

/// Parse a `key=value` attribute argument.
///
/// Only the first `=` separates key from value; the key must not be empty.
pub fn parse_attribute(value: &str) -> Result<(String, String), String> {
    let (key, val) = value
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", value))?;

    if key.trim().is_empty() {
        return Err(format!("attribute key is empty in '{}'", value));
    }

    Ok((key.trim().to_string(), val.to_string()))
}

// ============================================================================
// CLI Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Messaging CLI starting");

    let settings = MessagingSettings::load(cli.config.as_deref())?;
    let stdout = Mutex::new(std::io::stdout());

    execute(cli.command, &settings, &stdout).await
}

/// Execute `command` against backends resolved from `settings`, writing
/// command output to `out`
pub async fn execute<W: Write + Send>(
    command: Commands,
    settings: &MessagingSettings,
    out: &Mutex<W>,
) -> Result<(), CliError> {
    if let Commands::Config { show, format } = command {
        return execute_config_command(settings, show, format, out);
    }

    let messaging = Messaging::from_settings(settings)?;

    match command {
        Commands::Publish {
            topic,
            data,
            attributes,
            deduplicate_by,
        } => {
            execute_publish_command(&messaging, &topic, data, attributes, deduplicate_by).await
        }
        Commands::Consume {
            topic,
            group,
            name,
            count,
            no_ack,
            format,
        } => {
            let mut options = ConsumerOptions::new().with_auto_acknowledge(!no_ack);
            if let Some(group) = group {
                options = options.with_group(group);
            }
            if let Some(name) = name {
                options = options.with_name(name);
            }

            let printer = MessagePrinter::new(out, format);
            execute_consume_command(&messaging, &topic, options, count, !no_ack, &printer)
                .await
                .map(|_| ())
        }
        Commands::Listen {
            topic,
            count,
            format,
        } => {
            let printer = MessagePrinter::new(out, format);
            execute_listen_command(&messaging, &topic, count, &printer)
                .await
                .map(|_| ())
        }
        Commands::Config { .. } => Ok(()),
    }
}

/// Initialize logging based on CLI arguments.
///
/// Log output goes to stderr; stdout carries command output only.
pub fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let json_layer = cli
        .json_logs
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!cli.json_logs).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .map_err(|e| CliError::Logging {
            message: e.to_string(),
        })
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Execute publish command
pub async fn execute_publish_command(
    messaging: &Messaging,
    topic: &TopicName,
    data: String,
    attributes: Vec<(String, String)>,
    deduplicate_by: Option<String>,
) -> Result<(), CliError> {
    info!(
        topic = %topic,
        attributes = attributes.len(),
        deduplicate_by = ?deduplicate_by,
        "Publishing message"
    );

    let attributes: HashMap<String, String> = attributes.into_iter().collect();
    let mut publisher = messaging.create_publisher(topic, None, deduplicate_by.as_deref());

    with_publisher(publisher.as_mut(), |p| {
        Box::pin(async move { p.publish_data(Bytes::from(data), attributes).await })
    })
    .await?;

    Ok(())
}

/// Execute consume command, returning the number of messages handled.
///
/// Runs until `count` messages were handled, or until interrupted when no
/// count is given. The last counted message is acknowledged only when
/// `ack_on_stop` is set.
pub async fn execute_consume_command<W: Write + Send>(
    messaging: &Messaging,
    topic: &TopicName,
    options: ConsumerOptions,
    count: Option<u64>,
    ack_on_stop: bool,
    printer: &MessagePrinter<'_, W>,
) -> Result<u64, CliError> {
    info!(
        topic = %topic,
        group = %options.group_or(topic),
        name = %options.name_or(topic),
        count = ?count,
        "Consuming messages"
    );

    let handled = AtomicU64::new(0);
    let handler = |message: Message| {
        let seen = handled.fetch_add(1, Ordering::SeqCst) + 1;
        let printed = printer.print(topic, &message);
        let outcome = match count {
            Some(limit) if seen >= limit => HandlerOutcome::Stop { ack: ack_on_stop },
            _ => HandlerOutcome::Continue,
        };

        async move {
            printed?;
            Ok::<_, anyhow::Error>(outcome)
        }
    };

    let mut consumer = messaging.create_consumer(topic, options);
    tokio::select! {
        result = consumer.run(&handler) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(topic = %topic, "Interrupted, stopping consumer");
        }
    }

    let handled = handled.load(Ordering::SeqCst);
    info!(topic = %topic, handled, "Consumer finished");
    Ok(handled)
}

/// Execute listen command through an ephemeral subscription that only sees
/// messages published after it opens
pub async fn execute_listen_command<W: Write + Send>(
    messaging: &Messaging,
    topic: &TopicName,
    count: Option<u64>,
    printer: &MessagePrinter<'_, W>,
) -> Result<u64, CliError> {
    messaging
        .with_ephemeral_subscription(topic, |params| async move {
            info!(topic = %topic, group = %params.group, "Listening");
            execute_consume_command(
                messaging,
                topic,
                params.consumer_options(),
                count,
                true,
                printer,
            )
            .await
        })
        .await
}

/// Execute config command.
///
/// Settings were validated on load; this also checks that both backend names
/// resolve.
pub fn execute_config_command<W: Write + Send>(
    settings: &MessagingSettings,
    show: bool,
    format: ConfigFormat,
    out: &Mutex<W>,
) -> Result<(), CliError> {
    BackendRegistry::with_builtin_backends().resolve(settings)?;
    info!(broker = %settings.broker, cache = %settings.cache, "Configuration is valid");

    if !show {
        return Ok(());
    }

    let shown = redacted(settings);
    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&shown).map_err(|e| CliError::Output {
            message: e.to_string(),
        })?,
        ConfigFormat::Json => {
            serde_json::to_string_pretty(&shown).map_err(|e| CliError::Output {
                message: e.to_string(),
            })?
        }
    };

    let mut out = lock_output(out)?;
    writeln!(out, "{}", rendered.trim_end())?;
    Ok(())
}

const REDACTED: &str = "********";

/// Copy of `settings` with secrets masked
pub fn redacted(settings: &MessagingSettings) -> MessagingSettings {
    let mut shown = settings.clone();
    if !shown.redis.password.is_empty() {
        shown.redis.password = REDACTED.to_string();
    }
    if shown.redis.url.is_some() {
        shown.redis.url = Some(REDACTED.to_string());
    }
    shown
}

// ============================================================================
// Output
// ============================================================================

/// One received message as printed in JSON output
#[derive(Debug, Serialize)]
pub struct MessageRecord<'a> {
    pub topic: &'a str,
    pub data: String,
    pub attributes: BTreeMap<&'a str, &'a str>,
}

impl<'a> MessageRecord<'a> {
    pub fn new(topic: &'a TopicName, message: &'a Message) -> Self {
        Self {
            topic: topic.as_str(),
            data: String::from_utf8_lossy(message.data()).into_owned(),
            attributes: message
                .attributes()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
        }
    }
}

/// Writes received messages to a shared output
pub struct MessagePrinter<'a, W> {
    out: &'a Mutex<W>,
    format: OutputFormat,
}

impl<'a, W: Write + Send> MessagePrinter<'a, W> {
    pub fn new(out: &'a Mutex<W>, format: OutputFormat) -> Self {
        Self { out, format }
    }

    /// Write one line for `message`
    pub fn print(&self, topic: &TopicName, message: &Message) -> Result<(), CliError> {
        let record = MessageRecord::new(topic, message);
        let line = match self.format {
            OutputFormat::Json => serde_json::to_string(&record).map_err(|e| CliError::Output {
                message: e.to_string(),
            })?,
            OutputFormat::Text => {
                let attributes = record
                    .attributes
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!("[{}] {} {{{}}}", record.topic, record.data, attributes)
            }
        };

        let mut out = lock_output(self.out)?;
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

fn lock_output<W>(out: &Mutex<W>) -> Result<std::sync::MutexGuard<'_, W>, CliError> {
    out.lock().map_err(|_| CliError::Output {
        message: "output lock poisoned".to_string(),
    })
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
