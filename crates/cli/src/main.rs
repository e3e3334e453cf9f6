mod capture;
mod renderer;

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use memcct_core::export::{ExportDataDumper, ExportFormat, export_tree};
use memcct_core::settings::{MemorySettings, ProfilingMode};
use memcct_core::snapshot::{MemorySnapshot, SnapshotDiff};
use memcct_core::views::SortKey;
use memcct_core::ProfilingSession;
use memcct_protocol::{ClassId, SharedStr};
use tracing_subscriber::EnvFilter;

use capture::Capture;

const USAGE: &str = "\
Usage: memcct <capture.json | snapshot.json> [options]

Options:
  --class NAME         class to show (default: largest by size)
  --mode MODE          allocations | liveness
  --settings FILE      JSON settings file
  --prune              hide liveness paths without live objects
  --sort KEY           name | total_size | calls | live_objects | avg_age | generations
  --asc                ascending sort
  --depth N            levels to print below the class root (default 16)
  --filter TEXT        only show paths through nodes containing TEXT
  --diff FILE          diff against a second capture or snapshot (FILE is newer)
  --export FORMAT      csv | html | xml instead of the text tree
  --out FILE           write export here instead of stdout
  --save FILE          persist the snapshot as JSON";

#[derive(Debug, Default)]
struct Args {
    input: PathBuf,
    class: Option<String>,
    mode: Option<ProfilingMode>,
    settings: Option<PathBuf>,
    prune: bool,
    sort: Option<SortKey>,
    ascending: bool,
    depth: Option<usize>,
    filter: Option<String>,
    diff: Option<PathBuf>,
    export: Option<ExportFormat>,
    out: Option<PathBuf>,
    save: Option<PathBuf>,
}

fn parse_args(mut raw: impl Iterator<Item = String>) -> Result<Args> {
    let mut args = Args::default();
    let mut input = None;
    while let Some(arg) = raw.next() {
        let mut value = |flag: &str| raw.next().with_context(|| format!("{flag} needs a value"));
        match arg.as_str() {
            "--class" => args.class = Some(value("--class")?),
            "--mode" => {
                args.mode = Some(match value("--mode")?.as_str() {
                    "allocations" => ProfilingMode::Allocations,
                    "liveness" => ProfilingMode::Liveness,
                    other => bail!("unknown mode `{other}`"),
                })
            }
            "--settings" => args.settings = Some(value("--settings")?.into()),
            "--prune" => args.prune = true,
            "--sort" => {
                let key = value("--sort")?;
                args.sort = Some(
                    serde_json::from_value(serde_json::Value::String(key.clone()))
                        .with_context(|| format!("unknown sort key `{key}`"))?,
                );
            }
            "--asc" => args.ascending = true,
            "--depth" => args.depth = Some(value("--depth")?.parse().context("--depth")?),
            "--filter" => args.filter = Some(value("--filter")?),
            "--diff" => args.diff = Some(value("--diff")?.into()),
            "--export" => {
                args.export = Some(match value("--export")?.as_str() {
                    "csv" => ExportFormat::Csv,
                    "html" => ExportFormat::Html,
                    "xml" => ExportFormat::Xml,
                    other => bail!("unknown export format `{other}`"),
                })
            }
            "--out" => args.out = Some(value("--out")?.into()),
            "--save" => args.save = Some(value("--save")?.into()),
            "-h" | "--help" => bail!("{USAGE}"),
            flag if flag.starts_with("--") => bail!("unknown option `{flag}`\n\n{USAGE}"),
            _ if input.is_none() => input = Some(PathBuf::from(&arg)),
            _ => bail!("unexpected argument `{arg}`\n\n{USAGE}"),
        }
    }
    args.input = input.with_context(|| USAGE.to_owned())?;
    Ok(args)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    let mut settings = match &args.settings {
        Some(path) => MemorySettings::load(path)
            .with_context(|| format!("loading settings {}", path.display()))?,
        None => MemorySettings::default(),
    };
    if let Some(mode) = args.mode {
        settings.mode = mode;
    }
    settings.dont_show_zero_live_obj_alloc_paths |= args.prune;
    if let Some(key) = args.sort {
        settings.sort.key = key;
        settings.sort.ascending = args.ascending;
    }

    let snapshot = Arc::new(load_snapshot(&args.input, &settings)?);
    if let Some(path) = &args.save {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        snapshot
            .write_to(std::io::BufWriter::new(file))
            .with_context(|| format!("saving snapshot to {}", path.display()))?;
    }

    match &args.diff {
        Some(newer) => {
            let newer = Arc::new(load_snapshot(newer, &settings)?);
            show_diff(&args, &settings, snapshot, newer)
        }
        None => show_snapshot(&args, &settings, &snapshot),
    }
}

/// A saved snapshot, or a capture replayed through a fresh session.
fn load_snapshot(path: &Path, settings: &MemorySettings) -> Result<MemorySnapshot> {
    let saved = File::open(path)
        .map_err(anyhow::Error::from)
        .and_then(|f| Ok(MemorySnapshot::read_from(BufReader::new(f))?));
    let not_a_snapshot = match saved {
        Ok(snapshot) => {
            tracing::info!(path = %path.display(), kind = %snapshot.kind(), "loaded saved snapshot");
            return Ok(snapshot);
        }
        Err(err) => err,
    };
    tracing::debug!(path = %path.display(), error = %not_a_snapshot, "not a saved snapshot, trying capture");

    replay_capture(path, settings).map_err(|err| {
        err.context(format!(
            "{} is neither a saved snapshot ({not_a_snapshot:#}) nor a capture",
            path.display()
        ))
    })
}

fn replay_capture(path: &Path, settings: &MemorySettings) -> Result<MemorySnapshot> {
    let capture = Capture::load(path)?;
    let session = ProfilingSession::new(Arc::new(capture.client()), settings.clone());
    for class in &capture.manifest.classes {
        session.define_class(ClassId(class.id), &class.name);
    }
    let decoded = session
        .process_buffer(&capture.frames)
        .with_context(|| format!("decoding frames of {}", path.display()))?;
    tracing::info!(records = decoded, "capture replayed");
    session.take_snapshot().context("taking snapshot")
}

fn pick_class(
    names: &[SharedStr],
    wanted: Option<&str>,
    sizes: impl Fn(usize) -> i64,
) -> Result<usize> {
    match wanted {
        Some(name) => names
            .iter()
            .position(|n| n.as_str() == name)
            .with_context(|| format!("class `{name}` not found")),
        None => (0..names.len())
            .max_by_key(|&i| sizes(i).abs())
            .context("snapshot has no classes"),
    }
}

fn show_snapshot(args: &Args, settings: &MemorySettings, snapshot: &MemorySnapshot) -> Result<()> {
    let class = pick_class(snapshot.class_names(), args.class.as_deref(), |i| {
        snapshot.class_stats(i).map_or(0, |s| s.size)
    })?;
    let mut tree = snapshot
        .create_presentation_cct(class)
        .with_context(|| format!("building tree of {}", snapshot.class_names()[class]))?;
    tree.sort_children(settings.sort.key, settings.sort.ascending);
    if let Some(text) = &args.filter
        && !tree.filter(|name| name.contains(text.as_str()))
    {
        tracing::warn!(filter = %text, "no node matches the filter");
    }
    match args.export {
        Some(format) => write_export(args, |dumper| {
            export_tree(&tree, format, &settings.csv_separator, dumper);
        }),
        None => {
            let mut out = std::io::stdout().lock();
            renderer::render_tree(&mut out, &tree, args.depth.unwrap_or(16))?;
            Ok(())
        }
    }
}

fn show_diff(
    args: &Args,
    settings: &MemorySettings,
    older: Arc<MemorySnapshot>,
    newer: Arc<MemorySnapshot>,
) -> Result<()> {
    let diff = SnapshotDiff::new(older, newer)?;
    let mut out = std::io::stdout().lock();
    writeln!(
        out,
        "{} classes, size delta range [{}, {}]",
        diff.n_profiled_classes(),
        diff.min_delta_size(),
        diff.max_delta_size()
    )?;
    drop(out);

    let class = pick_class(diff.class_names(), args.class.as_deref(), |i| {
        diff.class_delta(i).map_or(0, |d| d.size)
    })?;
    let mut tree = diff.create_presentation_cct(class)?;
    tree.sort_children(settings.sort.key, settings.sort.ascending);
    match args.export {
        Some(format) => write_export(args, |dumper| {
            export_tree(&tree, format, &settings.csv_separator, dumper);
        }),
        None => {
            let mut out = std::io::stdout().lock();
            renderer::render_diff(&mut out, &tree, args.depth.unwrap_or(16))?;
            Ok(())
        }
    }
}

fn write_export(
    args: &Args,
    run: impl FnOnce(&mut ExportDataDumper<Box<dyn Write>>),
) -> Result<()> {
    let sink: Box<dyn Write> = match &args.out {
        Some(path) => Box::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut dumper = ExportDataDumper::new(sink);
    run(&mut dumper);
    dumper.finish().context("writing export")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|s| (*s).to_owned()))
    }

    #[test]
    fn parses_flags() {
        let args = parse(&[
            "cap.json", "--mode", "liveness", "--prune", "--sort", "live_objects", "--asc",
            "--export", "xml", "--class", "byte[]",
        ])
        .unwrap();
        assert_eq!(args.input, PathBuf::from("cap.json"));
        assert_eq!(args.mode, Some(ProfilingMode::Liveness));
        assert!(args.prune && args.ascending);
        assert_eq!(args.sort, Some(SortKey::LiveObjects));
        assert_eq!(args.export, Some(ExportFormat::Xml));
        assert_eq!(args.class.as_deref(), Some("byte[]"));
    }

    #[test]
    fn unreadable_snapshot_error_is_reported() {
        let path = std::env::temp_dir()
            .join(format!("memcct-{}-bad-snapshot.json", std::process::id()));
        let body = r#"{"version": 1, "snapshot": {"kind": "martian"}, "methods": []}"#;
        std::fs::write(&path, body).unwrap();
        let err = load_snapshot(&path, &MemorySettings::default()).unwrap_err();
        std::fs::remove_file(&path).unwrap();

        let chain = format!("{err:#}");
        assert!(chain.contains("neither a saved snapshot"), "{chain}");
        assert!(chain.contains("martian"), "{chain}");
        assert!(chain.contains("parsing capture manifest"), "{chain}");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["a.json", "--mode", "cpu"]).is_err());
        assert!(parse(&["a.json", "--sort", "colour"]).is_err());
        assert!(parse(&["a.json", "--depth"]).is_err());
        assert!(parse(&["a.json", "b.json"]).is_err());
    }
}
