use crate::services::{delivery::DeliveryPolicy, processor::ProcessorConfig};
use anyhow::{Result, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, fmt::Display, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "DOCUMENT_CLEANSER_";

/// Which object store backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    S3,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreBackend,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub kms_key_id: Option<String>,
    pub queue_url: Option<String>,
    pub dead_letter_url: Option<String>,
    pub dead_letter_arn: Option<String>,
    /// Key suffixes to process; empty means all keys.
    pub suffixes: Vec<String>,
    pub policy: DeliveryPolicy,
    pub log_format: LogFormat,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Command {
    /// Serve the HTTP API (default)
    #[default]
    Serve,
    /// Consume the upload queue until interrupted
    Poll,
    /// Print the queue, event source and alarm settings as JSON
    Policy,
    /// Create the local store schema and exit
    Migrate,
}

/// Command-line + environment configuration.
///
/// Every option falls back to `DOCUMENT_CLEANSER_<NAME>` when not given.
#[derive(Parser, Debug)]
#[command(author, version, about = "Strips author metadata from uploaded documents")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Host to bind to (overrides DOCUMENT_CLEANSER_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides DOCUMENT_CLEANSER_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Object store backend (overrides DOCUMENT_CLEANSER_STORE)
    #[arg(long, value_enum, global = true)]
    pub store: Option<StoreBackend>,

    /// Payload directory for the local store (overrides DOCUMENT_CLEANSER_STORAGE_DIR)
    #[arg(long, global = true)]
    pub storage_dir: Option<String>,

    /// SQLite URL for the local store (overrides DOCUMENT_CLEANSER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Bucket checked by readiness and created by the local store (overrides DOCUMENT_CLEANSER_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// AWS region (overrides DOCUMENT_CLEANSER_REGION)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Custom S3/SQS endpoint, e.g. LocalStack (overrides DOCUMENT_CLEANSER_ENDPOINT_URL)
    #[arg(long, global = true)]
    pub endpoint_url: Option<String>,

    /// KMS key for server-side encryption of rewritten objects (overrides DOCUMENT_CLEANSER_KMS_KEY_ID)
    #[arg(long, global = true)]
    pub kms_key_id: Option<String>,

    /// Queue polled by `poll` (overrides DOCUMENT_CLEANSER_QUEUE_URL)
    #[arg(long, global = true)]
    pub queue_url: Option<String>,

    /// Dead-letter queue for rejected messages (overrides DOCUMENT_CLEANSER_DEAD_LETTER_URL)
    #[arg(long, global = true)]
    pub dead_letter_url: Option<String>,

    /// Dead-letter queue ARN for the redrive policy (overrides DOCUMENT_CLEANSER_DEAD_LETTER_ARN)
    #[arg(long, global = true)]
    pub dead_letter_arn: Option<String>,

    /// Comma-separated key suffixes to process (overrides DOCUMENT_CLEANSER_SUFFIXES)
    #[arg(long, global = true)]
    pub suffixes: Option<String>,

    /// Deliveries before dead-lettering (overrides DOCUMENT_CLEANSER_MAX_RECEIVE_COUNT)
    #[arg(long, global = true)]
    pub max_receive_count: Option<u32>,

    /// Handler timeout in seconds (overrides DOCUMENT_CLEANSER_FUNCTION_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub function_timeout_secs: Option<u64>,

    /// Queue visibility timeout in seconds (overrides DOCUMENT_CLEANSER_VISIBILITY_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub visibility_timeout_secs: Option<u64>,

    /// Concurrent handler ceiling (overrides DOCUMENT_CLEANSER_MAX_CONCURRENCY)
    #[arg(long, global = true)]
    pub max_concurrency: Option<u32>,

    /// Messages per batch (overrides DOCUMENT_CLEANSER_BATCH_SIZE)
    #[arg(long, global = true)]
    pub batch_size: Option<u32>,

    /// Log output format (overrides DOCUMENT_CLEANSER_LOG_FORMAT)
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,
}

/// Reads `DOCUMENT_CLEANSER_*` values through an injectable lookup.
struct EnvSource<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvSource<F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{name}")).filter(|value| !value.is_empty())
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(name)
            .map(|value| {
                value
                    .parse::<T>()
                    .map_err(|err| anyhow!("parsing {ENV_PREFIX}{name} value `{value}`: {err}"))
            })
            .transpose()
    }

    fn value_enum<T: ValueEnum>(&self, name: &str) -> Result<Option<T>> {
        self.get(name)
            .map(|value| {
                T::from_str(&value, true)
                    .map_err(|err| anyhow!("parsing {ENV_PREFIX}{name} value `{value}`: {err}"))
            })
            .transpose()
    }
}

fn split_suffixes(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        Self::from_args(Args::parse(), |name| env::var(name).ok())
    }

    /// Merge parsed arguments over values from `lookup` (an environment reader).
    pub fn from_args(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Command)> {
        let env = EnvSource { lookup };
        let defaults = DeliveryPolicy::default();

        let secs = |arg: Option<u64>, name: &str| -> Result<Option<Duration>> {
            Ok(arg.or(env.parse::<u64>(name)?).map(Duration::from_secs))
        };

        let policy = DeliveryPolicy {
            max_receive_count: args
                .max_receive_count
                .or(env.parse("MAX_RECEIVE_COUNT")?)
                .unwrap_or(defaults.max_receive_count),
            function_timeout: secs(args.function_timeout_secs, "FUNCTION_TIMEOUT_SECS")?
                .unwrap_or(defaults.function_timeout),
            visibility_timeout: secs(args.visibility_timeout_secs, "VISIBILITY_TIMEOUT_SECS")?
                .unwrap_or(defaults.visibility_timeout),
            max_concurrency: args
                .max_concurrency
                .or(env.parse("MAX_CONCURRENCY")?)
                .unwrap_or(defaults.max_concurrency),
            batch_size: args
                .batch_size
                .or(env.parse("BATCH_SIZE")?)
                .unwrap_or(defaults.batch_size),
            ..defaults
        };

        let cfg = Self {
            host: args
                .host
                .or_else(|| env.get("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: args.port.or(env.parse("PORT")?).unwrap_or(3000),
            store: args
                .store
                .or(env.value_enum("STORE")?)
                .unwrap_or(StoreBackend::Local),
            storage_dir: args
                .storage_dir
                .or_else(|| env.get("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| env.get("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/document_cleanser.db".into()),
            bucket: args.bucket.or_else(|| env.get("BUCKET")),
            region: args.region.or_else(|| env.get("REGION")),
            endpoint_url: args.endpoint_url.or_else(|| env.get("ENDPOINT_URL")),
            kms_key_id: args.kms_key_id.or_else(|| env.get("KMS_KEY_ID")),
            queue_url: args.queue_url.or_else(|| env.get("QUEUE_URL")),
            dead_letter_url: args.dead_letter_url.or_else(|| env.get("DEAD_LETTER_URL")),
            dead_letter_arn: args.dead_letter_arn.or_else(|| env.get("DEAD_LETTER_ARN")),
            suffixes: args
                .suffixes
                .or_else(|| env.get("SUFFIXES"))
                .map(|raw| split_suffixes(&raw))
                .unwrap_or_default(),
            policy,
            log_format: args
                .log_format
                .or(env.value_enum("LOG_FORMAT")?)
                .unwrap_or(LogFormat::Text),
        };

        Ok((cfg, args.command.unwrap_or_default()))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            suffixes: self.suffixes.clone(),
            policy: self.policy.clone(),
        }
    }

    /// The queue, mapping and alarm settings printed by the `policy` command.
    pub fn policy_document(&self) -> Result<String> {
        let Some(arn) = self.dead_letter_arn.as_deref() else {
            bail!("the policy command needs {ENV_PREFIX}DEAD_LETTER_ARN (or --dead-letter-arn)");
        };
        Ok(serde_json::to_string_pretty(&self.policy.render(arn))?)
    }
}
