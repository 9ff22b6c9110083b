use std::path::{Path as FsPath, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kestrel_core::{group_by_namespace, ResourceId, Value, WatchQuery};
use kestrel_diff::merge::{prefer_left, prefer_right, unresolved};
use kestrel_diff::{apply, diff_with, merge_diffs, Diff, DiffOptions, Key, MergeConflict, Op, Path, Resolution};
use kestrel_kubehub::KubeSource;
use kestrel_store::{ResourceStore, StoreConfig, StoreSnapshot, StoreState};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kestrelctl", version, about = "Kestrel CLI: structural diff, patch, merge and watch")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Prefer {
    Local,
    Remote,
    None,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the edit script turning OLD into NEW
    Diff {
        /// JSON or YAML document ("-" for stdin)
        old: PathBuf,
        new: PathBuf,
    },
    /// Apply an edit script (JSON or YAML, as printed by `diff -o json`) to a document
    Apply {
        doc: PathBuf,
        script: PathBuf,
    },
    /// Three-way merge of LOCAL and REMOTE against BASE
    Merge {
        base: PathBuf,
        local: PathBuf,
        remote: PathBuf,
        /// Side kept on conflicts; `none` leaves them unresolved (exit code 1)
        #[arg(long = "prefer", value_enum, default_value_t = Prefer::None)]
        prefer: Prefer,
    },
    /// Watch a GVK and print snapshot changes
    Watch {
        /// GVK key, e.g. "v1/ConfigMap" or "apps/v1/Deployment"
        gvk: String,
        /// Kubernetes namespace (default: all)
        #[arg(long = "ns")]
        namespace: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KESTREL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KESTREL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KESTREL_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(path: &FsPath) -> Result<String> {
    if path == FsPath::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("reading stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

/// JSON first, then YAML (a superset for our purposes).
fn parse_doc(text: &str) -> Result<serde_json::Value> {
    match serde_json::from_str(text) {
        Ok(v) => Ok(v),
        Err(json_err) => serde_yaml::from_str(text).with_context(|| format!("not JSON ({}) nor YAML", json_err)),
    }
}

fn load_doc(path: &FsPath) -> Result<Value> {
    let raw = parse_doc(&read_input(path)?).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Value::from(raw))
}

fn load_script(path: &FsPath) -> Result<Diff> {
    let raw = parse_doc(&read_input(path)?).with_context(|| format!("parsing {}", path.display()))?;
    serde_json::from_value(raw).with_context(|| format!("{} is not an edit script", path.display()))
}

fn print_doc(output: Output, v: &Value) -> Result<()> {
    match output {
        Output::Human => print!("{}", serde_yaml::to_string(&v.to_json())?),
        Output::Json => println!("{}", serde_json::to_string_pretty(v)?),
    }
    Ok(())
}

/// One line per leaf op: `~ path = value`, `+ path value`, `- path`.
fn render_ops(diff: &Diff, path: &mut Path, out: &mut Vec<String>) {
    for op in diff.iter() {
        match op {
            Op::Replace(v) => out.push(format!("~ {} = {}", path, v)),
            Op::Insert { index, value } => out.push(format!("+ {} {}", path.child(Key::Index(*index)), value)),
            Op::Delete(key) => out.push(format!("- {}", path.child(key.clone()))),
            Op::Descend { key, diff } => {
                path.push(key.clone());
                render_ops(diff, path, out);
                path.pop();
            }
        }
    }
}

fn render(diff: &Diff) -> Vec<String> {
    let mut out = Vec::new();
    render_ops(diff, &mut Path::root(), &mut out);
    out
}

fn print_diff(output: Output, d: &Diff) -> Result<()> {
    match output {
        Output::Human => {
            for line in render(d) {
                println!("{}", line);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(d)?),
    }
    Ok(())
}

fn policy(prefer: Prefer) -> fn(&MergeConflict) -> Resolution {
    match prefer {
        Prefer::Local => prefer_left,
        Prefer::Remote => prefer_right,
        Prefer::None => unresolved,
    }
}

fn cmd_merge(output: Output, base: &FsPath, local: &FsPath, remote: &FsPath, prefer: Prefer) -> Result<ExitCode> {
    let opts = DiffOptions::from_env();
    let base = load_doc(base)?;
    let left = diff_with(&base, &load_doc(local)?, &opts);
    let right = diff_with(&base, &load_doc(remote)?, &opts);
    let outcome = merge_diffs(&left, &right, policy(prefer));
    let merged = apply(&base, &outcome.diff)?;
    info!(conflicts = outcome.conflicts.len(), finalized = outcome.is_finalized(), "merge done");

    match output {
        Output::Human => {
            for report in outcome.conflicts.iter() {
                eprintln!("conflict at {} ({:?})", report.conflict.location(), report.resolution);
                for line in render(&report.conflict.left) {
                    eprintln!("  local:  {}", line);
                }
                for line in render(&report.conflict.right) {
                    eprintln!("  remote: {}", line);
                }
            }
            print_doc(output, &merged)?;
        }
        Output::Json => {
            #[derive(serde::Serialize)]
            struct Merged<'a> {
                merged: &'a Value,
                diff: &'a Diff,
                conflicts: &'a [kestrel_diff::ConflictReport],
            }
            let body = Merged { merged: &merged, diff: &outcome.diff, conflicts: &outcome.conflicts };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }
    Ok(if outcome.is_finalized() { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

/// Lines describing how `next` differs from `prev`, in identifier order.
fn snapshot_changes(prev: &StoreSnapshot, next: &StoreSnapshot, opts: &DiffOptions) -> Vec<String> {
    let mut lines = Vec::new();
    for id in prev.ids.difference(&next.ids) {
        lines.push(format!("- {}", id));
    }
    for (id, v) in next.iter() {
        match prev.get(id) {
            None => lines.push(format!("+ {}", id)),
            Some(old) if !old.same(v) => {
                let d = diff_with(old, v, opts);
                if !d.is_empty() {
                    lines.push(format!("~ {} ({})", id, render(&d).join(", ")));
                }
            }
            Some(_) => {}
        }
    }
    lines
}

async fn cmd_watch(output: Output, gvk: &str, namespace: Option<&str>) -> Result<()> {
    let query = WatchQuery::parse(gvk, namespace)?;
    info!(query = %query, "watch invoked");
    let source = KubeSource::try_default().await?;
    let store = ResourceStore::new(Arc::new(source), [query], StoreConfig::from_env());
    let mut epochs = store.subscribe_epoch();
    let listener = store.subscribe(|_| {})?;
    let opts = DiffOptions::from_env();

    let mut prev = store.snapshot();
    let mut last_error = None;
    loop {
        tokio::select! {
            changed = epochs.changed() => {
                if changed.is_err() {
                    warn!("store closed; exiting watch loop");
                    break;
                }
                let next = store.snapshot();
                if next.error != last_error {
                    if let Some(err) = &next.error {
                        eprintln!("! {} ({})", err.message, err.at.to_rfc3339());
                    }
                    last_error = next.error.clone();
                }
                if prev.state != StoreState::Ready && next.state == StoreState::Ready {
                    for (ns, ids) in group_by_namespace(next.ids.iter()) {
                        info!(namespace = ns.unwrap_or("<cluster>"), items = ids.len(), "initial list loaded");
                    }
                }
                match output {
                    Output::Human => {
                        for line in snapshot_changes(&prev, &next, &opts) {
                            println!("{}", line);
                        }
                    }
                    Output::Json => {
                        #[derive(serde::Serialize)]
                        struct Frame<'a> {
                            epoch: u64,
                            ids: Vec<&'a ResourceId>,
                        }
                        let frame = Frame { epoch: next.epoch, ids: next.ids.iter().collect() };
                        println!("{}", serde_json::to_string(&frame)?);
                    }
                }
                prev = next;
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    store.unsubscribe(listener);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Diff { old, new } => {
            let d = diff_with(&load_doc(&old)?, &load_doc(&new)?, &DiffOptions::from_env());
            print_diff(cli.output, &d)?;
            Ok(if d.is_empty() { ExitCode::SUCCESS } else { ExitCode::from(1) })
        }
        Commands::Apply { doc, script } => {
            let patched = apply(&load_doc(&doc)?, &load_script(&script)?)?;
            print_doc(cli.output, &patched)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Merge { base, local, remote, prefer } => cmd_merge(cli.output, &base, &local, &remote, prefer),
        Commands::Watch { gvk, namespace } => {
            cmd_watch(cli.output, &gvk, namespace.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_and_json_both_load() {
        let j = parse_doc(r#"{"a": [1, 2]}"#).unwrap();
        let y = parse_doc("a:\n  - 1\n  - 2\n").unwrap();
        assert_eq!(j, y);
        assert!(parse_doc("{unclosed").is_err());
    }

    #[test]
    fn ops_render_as_pointer_lines() {
        let a = Value::from(serde_json::json!({"spec": {"replicas": 1, "paused": true}, "items": ["x"]}));
        let b = Value::from(serde_json::json!({"spec": {"replicas": 3}, "items": ["x", "y"]}));
        let lines = render(&kestrel_diff::diff(&a, &b));
        assert_eq!(lines, vec!["~ /spec/replicas = 3", "- /spec/paused", "+ /items/1 \"y\""]);
    }

    #[test]
    fn snapshot_changes_list_adds_removes_and_edits() {
        use kestrel_core::WatchEvent;
        use kestrel_store::StoreBuilder;

        let q = WatchQuery::new("v1", "ConfigMap", Some("ns"));
        let cm = |name: &str, v: i64| {
            Value::from(serde_json::json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": "ns"}, "data": {"v": v}
            }))
        };
        let mut b = StoreBuilder::new();
        b.register(q.clone());
        b.activate();
        let first = b.apply(vec![(q.clone(), WatchEvent::InitialList(vec![cm("a", 1), cm("b", 1)]).into())]).unwrap();
        let second = b
            .apply(vec![
                (q.clone(), WatchEvent::Update(cm("a", 2)).into()),
                (q.clone(), WatchEvent::Remove(ResourceId::new("v1", "ConfigMap", Some("ns"), "b")).into()),
                (q.clone(), WatchEvent::Add(cm("c", 1)).into()),
            ])
            .unwrap();
        let lines = snapshot_changes(&first, &second, &DiffOptions::default());
        assert_eq!(lines, vec!["- ConfigMap/ns/b", "~ ConfigMap/ns/a (~ /data/v = 2)", "+ ConfigMap/ns/c"]);
    }
}
