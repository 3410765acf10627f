//! Configuration types for extract-pipeline
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Validated runtime configuration for each command

use crate::backend::{BackendConfig, BackendKind, DEFAULT_MAX_CONNECTIONS};
use crate::bulk::{BulkQuery, DEFAULT_ROWS};
use crate::discovery::{PathFilter, ScannerConfig};
use crate::error::ConfigError;
use crate::worker::PoolConfig;
use clap::{Args, Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

/// Maximum reasonable worker count
pub const MAX_WORKERS: usize = 512;

/// Page size limits for bulk runs
const MIN_ROWS: usize = 1;
const MAX_ROWS: usize = 10_000;

/// Regex for document store URLs
static HTTP_URL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^https?://[^\s/]+(/[^\s]*)?$").expect("Invalid HTTP URL regex"));

/// Scan files into a shared queue and extract them with a bounded pool
#[derive(Parser, Debug, Clone)]
#[command(
    name = "extract-pipeline",
    version,
    about = "Scan files into a shared queue and extract them with a bounded worker pool",
    long_about = "Scanners enqueue files, drainers pull them off the queue into a worker pool, and \
                  every outcome is recorded in a report map so runs can be resumed.\n\n\
                  The queue and report map live in memory, in MySQL or in Redis. With MySQL or \
                  Redis, any number of scanners and drainers on different machines share them.",
    after_help = "EXAMPLES:\n    \
        extract-pipeline run /data/docs -j 8 -o out/\n    \
        extract-pipeline --backend mysql --url mysql://u:p@db/pipeline scan /data --include '*.txt'\n    \
        extract-pipeline --backend mysql --url mysql://u:p@db/pipeline drain --poll-for 30 -o out/\n    \
        extract-pipeline --backend redis --url redis://cache/0 status --format json\n    \
        extract-pipeline bulk copy --source http://solr:8983/solr/a --target http://solr:8983/solr/b"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Where the queue and report map live
    #[arg(long, value_enum, default_value_t = BackendKind::Memory, global = true)]
    pub backend: BackendKind,

    /// Backend connection URL (mysql://… or redis://…)
    #[arg(long, env = "PIPELINE_URL", global = true, value_name = "URL")]
    pub url: Option<String>,

    /// Queue table or key prefix
    #[arg(long, default_value = "extract_queue", global = true, value_name = "NAME")]
    pub queue: String,

    /// Report map table or key prefix
    #[arg(long, default_value = "extract_reports", global = true, value_name = "NAME")]
    pub reports: String,

    /// Longest single wait of a blocking poll, in seconds
    #[arg(long, default_value = "1", global = true, value_name = "SECS")]
    pub poll_interval: u64,

    /// MySQL connection pool size
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS, global = true, value_name = "NUM")]
    pub max_connections: u32,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Walk directories and enqueue every accepted file
    Scan(WalkArgs),

    /// Drain the queue into the worker pool
    Drain(DrainArgs),

    /// Scan and drain in one process
    Run {
        #[command(flatten)]
        walk: WalkArgs,

        #[command(flatten)]
        work: WorkArgs,
    },

    /// Show queue and report counts
    Status {
        #[arg(long, value_enum, default_value_t = StatusFormat::Text)]
        format: StatusFormat,
    },

    /// Clear waiting records (and with --all, everything)
    Reset {
        /// Also drop processed records and reports
        #[arg(long)]
        all: bool,

        /// Do not ask for confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Stream documents from a remote store
    Bulk {
        #[command(subcommand)]
        action: BulkAction,
    },
}

/// Walk settings shared by `scan` and `run`
#[derive(Args, Debug, Clone)]
pub struct WalkArgs {
    /// Directories to scan
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<PathBuf>,

    /// Base that relative paths and path globs are resolved against
    /// (defaults to the current directory)
    #[arg(long, value_name = "DIR")]
    pub base: Option<PathBuf>,

    /// Maximum directory depth (unlimited if not set)
    #[arg(short = 'd', long, value_name = "NUM")]
    pub max_depth: Option<usize>,

    /// Follow symbolic links
    #[arg(long)]
    pub follow_symlinks: bool,

    /// Only queue files matching a glob (can be repeated)
    #[arg(long = "include", value_name = "GLOB", action = clap::ArgAction::Append)]
    pub include_patterns: Vec<String>,

    /// Skip files and directories matching a glob (can be repeated)
    #[arg(long = "exclude", value_name = "GLOB", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Do not skip hidden files and directories
    #[arg(long)]
    pub include_hidden: bool,

    /// Do not skip OS metadata files (.DS_Store, Thumbs.db, ...)
    #[arg(long)]
    pub include_os_files: bool,
}

/// Pool settings shared by `drain` and `run`
#[derive(Args, Debug, Clone)]
pub struct WorkArgs {
    /// Number of files extracted at once
    #[arg(short = 'j', long, default_value_t = default_jobs(), value_name = "NUM")]
    pub jobs: usize,

    /// Directory extraction output is written to
    #[arg(short = 'o', long, default_value = "extracted", value_name = "DIR")]
    pub output: PathBuf,

    /// Replace existing outputs instead of reporting NOT_SAVED
    #[arg(long)]
    pub overwrite: bool,

    /// Skip files whose report already says SUCCESS
    #[arg(long)]
    pub skip_processed: bool,
}

/// `drain` arguments
#[derive(Args, Debug, Clone)]
pub struct DrainArgs {
    #[command(flatten)]
    pub work: WorkArgs,

    /// Stop once the queue stays empty this long (block forever if not set)
    #[arg(long, value_name = "SECS", conflicts_with = "follow")]
    pub poll_for: Option<u64>,

    /// Stop once the scanner sharing this backend has finished (Redis)
    #[arg(long)]
    pub follow: bool,

    /// Stop when this path is dequeued
    #[arg(long, value_name = "PATH")]
    pub poison: Option<PathBuf>,
}

/// Output format for `status`
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFormat {
    Text,
    Json,
}

/// Bulk operations
#[derive(Subcommand, Debug, Clone)]
pub enum BulkAction {
    /// Copy every matching document into another store
    Copy {
        #[command(flatten)]
        stream: StreamArgs,

        /// Store documents are copied to
        #[arg(long, value_name = "URL")]
        target: String,
    },

    /// Add a tag to every matching document
    Tag {
        #[command(flatten)]
        stream: StreamArgs,

        /// Store tagged documents are written to (defaults to the source)
        #[arg(long, value_name = "URL")]
        target: Option<String>,

        /// Multi-valued field holding tags
        #[arg(long, default_value = "tags", value_name = "FIELD")]
        field: String,

        /// Tag to add
        #[arg(long, value_name = "TAG")]
        tag: String,
    },

    /// Compare every matching document with another store
    Diff {
        #[command(flatten)]
        stream: StreamArgs,

        /// Store compared against
        #[arg(long, value_name = "URL")]
        target: String,

        /// Store documents missing from the target are copied to
        #[arg(long, value_name = "URL")]
        missing: Option<String>,
    },
}

/// Paging settings shared by bulk operations
#[derive(Args, Debug, Clone)]
pub struct StreamArgs {
    /// Store documents are streamed from
    #[arg(long, value_name = "URL")]
    pub source: String,

    /// Query selecting the documents
    #[arg(long, default_value = "*:*", value_name = "Q")]
    pub query: String,

    /// Worker threads
    #[arg(short = 'p', long, default_value_t = default_jobs(), value_name = "NUM")]
    pub parallelism: usize,

    /// Documents per page
    #[arg(long, default_value_t = DEFAULT_ROWS, value_name = "NUM")]
    pub rows: usize,
}

fn default_jobs() -> usize {
    num_cpus::get()
}

fn check_workers(count: usize) -> Result<(), ConfigError> {
    if count == 0 || count > MAX_WORKERS {
        return Err(ConfigError::InvalidWorkerCount {
            count,
            max: MAX_WORKERS,
        });
    }
    Ok(())
}

fn check_http_url(field: &str, url: &str) -> Result<String, ConfigError> {
    if !HTTP_URL_REGEX.is_match(url) {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: format!("'{}' is not an http(s) URL", url),
        });
    }
    Ok(url.trim_end_matches('/').to_string())
}

impl CliArgs {
    /// Backend settings from the global flags
    pub fn backend_config(&self) -> Result<BackendConfig, ConfigError> {
        if self.poll_interval == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll-interval".to_string(),
                reason: "must be at least 1 second".to_string(),
            });
        }
        let config = BackendConfig {
            kind: self.backend,
            url: self.url.clone(),
            queue: self.queue.clone(),
            reports: self.reports.clone(),
            poll_interval: Duration::from_secs(self.poll_interval),
            max_connections: self.max_connections.max(1),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Validated walk configuration
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Roots, absolute or relative to `base`
    pub roots: Vec<PathBuf>,
    pub base: PathBuf,
    pub scanner: ScannerConfig,
}

impl ScanConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_walk_args(args: &WalkArgs) -> Result<Self, ConfigError> {
        if args.paths.is_empty() {
            return Err(ConfigError::MissingRequired("at least one PATH".to_string()));
        }

        let base = match &args.base {
            Some(base) => base.clone(),
            None => std::env::current_dir().map_err(|e| ConfigError::InvalidValue {
                field: "base".to_string(),
                reason: e.to_string(),
            })?,
        };
        if !base.is_dir() {
            return Err(ConfigError::InvalidValue {
                field: "base".to_string(),
                reason: format!("'{}' is not a directory", base.display()),
            });
        }

        let filter = PathFilter::new(&args.include_patterns, &args.exclude_patterns)?
            .skip_hidden(!args.include_hidden)
            .skip_os_files(!args.include_os_files);

        Ok(Self {
            roots: args.paths.clone(),
            base,
            scanner: ScannerConfig {
                max_depth: args.max_depth,
                follow_symlinks: args.follow_symlinks,
                filter,
            },
        })
    }
}

/// Validated pool configuration
#[derive(Debug, Clone)]
pub struct WorkConfig {
    pub pool: PoolConfig,
    pub output: PathBuf,
    pub overwrite: bool,
}

impl WorkConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_work_args(args: &WorkArgs) -> Result<Self, ConfigError> {
        check_workers(args.jobs)?;

        if args.output.exists() && !args.output.is_dir() {
            return Err(ConfigError::InvalidOutputPath {
                path: args.output.clone(),
                reason: "exists and is not a directory".to_string(),
            });
        }

        Ok(Self {
            pool: PoolConfig {
                jobs: args.jobs,
                skip_processed: args.skip_processed,
            },
            output: args.output.clone(),
            overwrite: args.overwrite,
        })
    }
}

/// When `drain` stops on an empty queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStop {
    /// Never; block for more
    Never,
    /// After the queue stayed empty this long
    After(Duration),
    /// Once the scanner has sealed the shared latch
    Sealed,
}

/// Validated drain configuration
#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub work: WorkConfig,
    pub stop: DrainStop,
    pub poison: Option<PathBuf>,
}

impl DrainConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_drain_args(args: &DrainArgs) -> Result<Self, ConfigError> {
        let stop = match (args.poll_for, args.follow) {
            (Some(0), _) => {
                return Err(ConfigError::InvalidValue {
                    field: "poll-for".to_string(),
                    reason: "must be at least 1 second".to_string(),
                })
            }
            (Some(secs), _) => DrainStop::After(Duration::from_secs(secs)),
            (None, true) => DrainStop::Sealed,
            (None, false) => DrainStop::Never,
        };

        Ok(Self {
            work: WorkConfig::from_work_args(&args.work)?,
            stop,
            poison: args.poison.clone(),
        })
    }
}

/// Which bulk operation to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BulkTask {
    Copy { target: String },
    Tag { target: String, field: String, tag: String },
    Diff { target: String, missing: Option<String> },
}

/// Validated bulk configuration
#[derive(Debug, Clone)]
pub struct BulkConfig {
    pub source: String,
    pub query: BulkQuery,
    pub parallelism: usize,
    pub rows: usize,
    pub task: BulkTask,
}

impl BulkConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_bulk_args(action: &BulkAction) -> Result<Self, ConfigError> {
        let stream = match action {
            BulkAction::Copy { stream, .. }
            | BulkAction::Tag { stream, .. }
            | BulkAction::Diff { stream, .. } => stream,
        };

        check_workers(stream.parallelism)?;
        if stream.rows < MIN_ROWS || stream.rows > MAX_ROWS {
            return Err(ConfigError::InvalidValue {
                field: "rows".to_string(),
                reason: format!("must be between {} and {}", MIN_ROWS, MAX_ROWS),
            });
        }
        let source = check_http_url("source", &stream.source)?;

        let task = match action {
            BulkAction::Copy { target, .. } => {
                let target = check_http_url("target", target)?;
                if target == source {
                    return Err(ConfigError::InvalidValue {
                        field: "target".to_string(),
                        reason: "copy target must differ from the source".to_string(),
                    });
                }
                BulkTask::Copy { target }
            }
            BulkAction::Tag { target, field, tag, .. } => {
                if field.is_empty() || tag.is_empty() {
                    return Err(ConfigError::MissingRequired("--field and --tag".to_string()));
                }
                let target = match target {
                    Some(target) => check_http_url("target", target)?,
                    None => source.clone(),
                };
                BulkTask::Tag {
                    target,
                    field: field.clone(),
                    tag: tag.clone(),
                }
            }
            BulkAction::Diff { target, missing, .. } => BulkTask::Diff {
                target: check_http_url("target", target)?,
                missing: missing
                    .as_deref()
                    .map(|m| check_http_url("missing", m))
                    .transpose()?,
            },
        };

        Ok(Self {
            source,
            query: BulkQuery::new(stream.query.clone()),
            parallelism: stream.parallelism,
            rows: stream.rows,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("extract-pipeline").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&["status", "--backend", "redis", "--url", "redis://cache/0"]);
        let backend = args.backend_config().unwrap();
        assert_eq!(backend.kind, BackendKind::Redis);
        assert_eq!(backend.queue, "extract_queue");
        assert!(matches!(args.command, Command::Status { format: StatusFormat::Text }));
    }

    #[test]
    fn test_backend_requires_url() {
        let args = parse(&["--backend", "mysql", "status"]);
        if std::env::var_os("PIPELINE_URL").is_none() {
            assert!(args.backend_config().is_err());
        }
    }

    #[test]
    fn test_scan_config() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().to_string_lossy().into_owned();
        let args = parse(&[
            "scan", "docs", "--base", base.as_str(), "--include", "*.txt", "--exclude", "tmp/**", "--include-hidden",
        ]);
        let Command::Scan(walk) = &args.command else {
            panic!("expected scan");
        };
        let config = ScanConfig::from_walk_args(walk).unwrap();
        assert_eq!(config.roots, vec![PathBuf::from("docs")]);
        assert_eq!(config.base, dir.path());
        assert!(config.scanner.filter.accepts(&dir.path().join(".notes.txt"), ".notes.txt"));
        assert!(!config.scanner.filter.accepts(&dir.path().join("a.pdf"), "a.pdf"));
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let args = parse(&["scan", "/data", "--include", "[abc"]);
        let Command::Scan(walk) = &args.command else {
            panic!("expected scan");
        };
        assert!(matches!(
            ScanConfig::from_walk_args(walk),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_worker_count_bounds() {
        let args = parse(&["drain", "-j", "0"]);
        let Command::Drain(drain) = &args.command else {
            panic!("expected drain");
        };
        assert!(matches!(
            DrainConfig::from_drain_args(drain),
            Err(ConfigError::InvalidWorkerCount { count: 0, max: MAX_WORKERS })
        ));
    }

    #[test]
    fn test_drain_stop_modes() {
        let stop = |argv: &[&str]| {
            let args = parse(argv);
            let Command::Drain(drain) = &args.command else {
                panic!("expected drain");
            };
            DrainConfig::from_drain_args(drain).map(|c| c.stop)
        };
        assert_eq!(stop(&["drain"]).unwrap(), DrainStop::Never);
        assert_eq!(stop(&["drain", "--poll-for", "5"]).unwrap(), DrainStop::After(Duration::from_secs(5)));
        assert_eq!(stop(&["drain", "--follow"]).unwrap(), DrainStop::Sealed);
        assert!(stop(&["drain", "--poll-for", "0"]).is_err());
        assert!(CliArgs::try_parse_from(["x", "drain", "--follow", "--poll-for", "3"]).is_err());
    }

    #[test]
    fn test_bulk_config() {
        let args = parse(&[
            "bulk", "tag", "--source", "http://solr:8983/solr/docs/", "--tag", "reviewed", "-p", "4",
        ]);
        let Command::Bulk { action } = &args.command else {
            panic!("expected bulk");
        };
        let config = BulkConfig::from_bulk_args(action).unwrap();
        assert_eq!(config.source, "http://solr:8983/solr/docs");
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.rows, DEFAULT_ROWS);
        assert_eq!(
            config.task,
            BulkTask::Tag {
                target: "http://solr:8983/solr/docs".into(),
                field: "tags".into(),
                tag: "reviewed".into(),
            }
        );

        let args = parse(&["bulk", "copy", "--source", "http://a/solr/x", "--target", "http://a/solr/x"]);
        let Command::Bulk { action } = &args.command else {
            panic!("expected bulk");
        };
        assert!(BulkConfig::from_bulk_args(action).is_err());

        let args = parse(&["bulk", "diff", "--source", "ftp://a", "--target", "http://b/solr/y"]);
        let Command::Bulk { action } = &args.command else {
            panic!("expected bulk");
        };
        assert!(BulkConfig::from_bulk_args(action).is_err());
    }
}
