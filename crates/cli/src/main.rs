use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kedit_apply::{diff_lines_bounded, parse_identity, validate_draft};
use kedit_core::{DiffLineKind, DiffResult, ObjectIdentity};
use kedit_persist::EditJournal;
use kedit_session::EditConfig;
use serde::Serialize;
use tracing::info;

mod edit;

#[derive(Parser, Debug)]
#[command(name = "kedit", version, about = "Edit live Kubernetes objects with optimistic concurrency")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a YAML draft offline
    Validate {
        /// Draft file ("-" for stdin)
        file: String,
        /// File holding the object the draft must keep identity with
        #[arg(long = "expect")]
        expect: Option<String>,
        /// Required metadata.resourceVersion
        #[arg(long = "baseline-rv")]
        baseline_rv: Option<String>,
    },
    /// Print the identity a YAML document names
    Identity {
        file: String,
    },
    /// Line diff of two files
    Diff {
        before: String,
        after: String,
    },
    /// Edit a live object in $EDITOR
    Edit {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        name: String,
        /// Namespace for namespaced kinds
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Keep metadata.managedFields in the draft
        #[arg(long = "show-managed-fields", action = ArgAction::SetTrue)]
        show_managed_fields: bool,
    },
    /// Show recent committed edits from the local journal
    History {
        gvk: String,
        name: String,
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long = "limit", default_value_t = 3)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("KEDIT_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KEDIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KEDIT_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(path: &str) -> Result<String> {
    if path == "-" {
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut std::io::stdin(), &mut buf).context("reading stdin")?;
        return Ok(buf);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path))
}

/// Identity for a `gvk name [--ns]` triple.
pub(crate) fn identity_from_args(gvk: &str, name: &str, namespace: Option<String>) -> Result<ObjectIdentity> {
    let gvk = kedit_kubehub::parse_gvk_key(gvk)?;
    Ok(ObjectIdentity {
        api_version: kedit_kubehub::api_version_of(&gvk),
        kind: gvk.kind,
        name: name.to_string(),
        namespace,
        resource_version: None,
    })
}

pub(crate) fn print_diff(diff: &DiffResult) {
    if diff.truncated {
        println!("(diff too large to display)");
        return;
    }
    for l in &diff.lines {
        let sign = match l.kind {
            DiffLineKind::Context => ' ',
            DiffLineKind::Added => '+',
            DiffLineKind::Removed => '-',
        };
        let no = |n: Option<u32>| n.map(|n| n.to_string()).unwrap_or_default();
        println!("{:>4} {:>4} {} {}", no(l.left_line_no), no(l.right_line_no), sign, l.value);
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateReport {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct HistoryRow {
    rv: String,
    ts: i64,
    yaml: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file, expect, baseline_rv } => {
            info!(file = %file, "validate invoked");
            let draft = read_input(&file)?;
            let expected = match expect {
                Some(p) => Some(parse_identity(&read_input(&p)?).ok_or_else(|| anyhow!("{}: no object identity found", p))?),
                None => None,
            };
            let res = validate_draft(&draft, expected.as_ref(), baseline_rv.as_deref());
            let report = match &res {
                Ok(v) => ValidateReport { ok: true, resource_version: Some(v.resource_version.clone()), normalized: Some(v.normalized_text.clone()), error: None },
                Err(e) => ValidateReport { ok: false, resource_version: None, normalized: None, error: Some(e.to_string()) },
            };
            match cli.output {
                Output::Human => match &res {
                    Ok(v) => {
                        eprintln!("ok  •  rv={}", v.resource_version);
                        print!("{}", v.normalized_text);
                    }
                    Err(e) => eprintln!("invalid: {}", e),
                },
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }
            if let Err(e) = res {
                return Err(anyhow!("validation failed: {}", e));
            }
        }
        Commands::Identity { file } => {
            let id = parse_identity(&read_input(&file)?);
            match (cli.output, id) {
                (Output::Human, Some(id)) => {
                    println!("{}", id);
                    println!("resourceVersion: {}", id.resource_version.as_deref().unwrap_or("-"));
                }
                (Output::Human, None) => println!("unknown"),
                (Output::Json, id) => println!("{}", serde_json::to_string_pretty(&id)?),
            }
        }
        Commands::Diff { before, after } => {
            let cfg = EditConfig::from_env();
            let diff = diff_lines_bounded(&read_input(&before)?, &read_input(&after)?, cfg.diff_max_lines);
            match cli.output {
                Output::Human => print_diff(&diff),
                Output::Json => println!("{}", serde_json::to_string_pretty(&diff)?),
            }
        }
        Commands::Edit { gvk, name, namespace, show_managed_fields } => {
            let identity = identity_from_args(&gvk, &name, namespace)?;
            let mut cfg = EditConfig::from_env();
            cfg.show_managed_fields |= show_managed_fields;
            info!(object = %identity, "edit invoked");
            edit::run(identity, cfg, cli.output).await?;
        }
        Commands::History { gvk, name, namespace, limit } => {
            let identity = identity_from_args(&gvk, &name, namespace)?;
            let journal = kedit_persist::SqliteJournal::open(&kedit_persist::JournalConfig::from_env())?;
            let rows = journal.history(&identity, limit)?;
            match cli.output {
                Output::Human => {
                    if rows.is_empty() {
                        println!("no committed edits recorded for {}", identity);
                    }
                    for r in &rows {
                        let when = chrono::DateTime::<chrono::Utc>::from_timestamp(r.committed_at, 0)
                            .map(|d| d.to_rfc3339())
                            .unwrap_or_else(|| r.committed_at.to_string());
                        println!("{}  rv={}  {} bytes", when, r.resource_version(), r.yaml.len());
                    }
                }
                Output::Json => {
                    let out: Vec<HistoryRow> = rows.iter().map(|r| HistoryRow { rv: r.resource_version().to_string(), ts: r.committed_at, yaml: r.yaml.clone() }).collect();
                    println!("{}", serde_json::to_string_pretty(&out)?);
                }
            }
        }
    }

    Ok(())
}
