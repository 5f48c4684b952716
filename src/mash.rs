//! Folds a directory of source files into a single source text.
//!
//! The entry unit may place two marker comments: a line containing
//! [`UPDATESTAMP_MARKER`] is replaced by the timestamp comment, and a line
//! containing [`CODE_MARKER`] by every other unit. Without them the timestamp
//! goes on top and the other units after the entry unit.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, bail};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::compiler::{CompileError, Compiler, Diagnostic};
use crate::session::SessionId;
use crate::source::{SourceUnit, validate_units};

pub const UNIT_EXTENSION: &str = "mash";

pub const UPDATESTAMP_MARKER: &str = "[[CM::UPDATESTAMP]]";
pub const CODE_MARKER: &str = "[[CM::CODE]]";

/// How often a watched directory is scanned for changes
pub const WATCH_PERIOD: Duration = Duration::from_millis(250);

/// Served while no coalesced source has compiled yet
pub const NO_SOURCE: &str = "// No code :(\n";

/// Compilations outside any session are tagged with this id; the scheduler
/// starts counting at 1.
const MASHER_SESSION: SessionId = SessionId(0);

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MashReport {
    pub source: String,
    pub compiles: bool,
    pub diagnostics: Vec<Diagnostic>,
}

/// Reads every `*.mash` file of `dir`, sorted by file name
///
/// Units are named after the file stem; the one read from `main_file` is the
/// entry point.
pub fn gather_units(dir: &Path, main_file: &str) -> anyhow::Result<Vec<SourceUnit>> {
    let mut units = Vec::new();
    let mut found_main = false;
    for path in unit_paths(dir)? {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            log::warn!("Skipping {}: file name is not valid UTF-8", path.display());
            continue;
        };
        let is_main = path.file_name().is_some_and(|name| name == main_file);
        found_main |= is_main;
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        units.push(SourceUnit::new(stem, text, is_main));
    }
    if !found_main {
        bail!("main file '{main_file}' not found in {}", dir.display());
    }
    Ok(units)
}

fn unit_paths(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == UNIT_EXTENSION) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// One source text: the entry unit with the timestamp and every other unit
/// placed at its markers
pub fn coalesce(units: &[SourceUnit]) -> Result<String, CompileError> {
    let entry = validate_units(units)?;
    let stamp = format!(
        "// mashed {}",
        chrono::Local::now().format("%Y-%m-%d|%H:%M:%S%.3f")
    );
    let others: Vec<_> = units.iter().filter(|u| !u.entry_point).collect();
    let has_stamp = entry.text.contains(UPDATESTAMP_MARKER);
    let has_code = entry.text.contains(CODE_MARKER);

    let mut source = String::new();
    if !has_stamp {
        source.push_str(&stamp);
        source.push_str("\n\n");
    }
    for line in entry.text.lines() {
        let indent = &line[..line.len() - line.trim_start().len()];
        if line.contains(UPDATESTAMP_MARKER) {
            source.push_str(indent);
            source.push_str(&stamp);
            source.push('\n');
        } else if line.contains(CODE_MARKER) {
            for unit in &others {
                push_unit(&mut source, unit);
            }
        } else {
            source.push_str(line);
            source.push('\n');
        }
    }
    if !has_code {
        for unit in &others {
            source.push('\n');
            push_unit(&mut source, unit);
        }
    }
    Ok(source)
}

fn push_unit(source: &mut String, unit: &SourceUnit) {
    source.push_str(&format!("// unit: {}\n", unit.name));
    source.push_str(&unit.text);
    if !unit.text.ends_with('\n') {
        source.push('\n');
    }
}

/// Coalesces `units` and checks that the result compiles on its own
pub fn mash(compiler: &Compiler, units: &[SourceUnit]) -> Result<MashReport, CompileError> {
    let source = coalesce(units)?;
    let entry = validate_units(units)?;
    let coalesced = [SourceUnit::entry(entry.name.as_str(), source.as_str())];
    let (compiles, diagnostics) = match compiler.compile(MASHER_SESSION, &coalesced) {
        Ok(unit) => (true, unit.warnings().to_vec()),
        Err(CompileError::Failure(diagnostics)) => (false, diagnostics),
        Err(e) => return Err(e),
    };
    Ok(MashReport {
        source,
        compiles,
        diagnostics,
    })
}

/// Runs [`mash`] on the blocking pool, at most `concurrency` at a time
pub struct Masher {
    compiler: Arc<Compiler>,
    permits: Semaphore,
}

impl Masher {
    pub fn new(compiler: Arc<Compiler>, concurrency: usize) -> Self {
        Self {
            compiler,
            permits: Semaphore::new(concurrency.max(1)),
        }
    }

    pub async fn mash(&self, units: Vec<SourceUnit>) -> Result<MashReport, CompileError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| CompileError::Unavailable(e.to_string()))?;
        let compiler = self.compiler.clone();
        tokio::task::spawn_blocking(move || mash(&compiler, &units))
            .await
            .map_err(|e| {
                log::error!("Mash task failed to complete: {e}");
                CompileError::Unavailable(format!("mash aborted: {e}"))
            })?
    }
}

/// The most recent coalesced source that compiled
#[derive(Debug, Default)]
pub struct LatestSource {
    source: Mutex<Option<String>>,
}

impl LatestSource {
    pub fn get(&self) -> Option<String> {
        self.source.lock().clone()
    }

    pub fn publish(&self, source: String) {
        *self.source.lock() = Some(source);
    }
}

type Fingerprint = Vec<(PathBuf, Option<SystemTime>, u64)>;

/// Names, modification times and sizes of the unit files of `dir`
fn fingerprint(dir: &Path) -> anyhow::Result<Fingerprint> {
    unit_paths(dir)?
        .into_iter()
        .map(|path| {
            let meta = std::fs::metadata(&path)
                .with_context(|| format!("cannot stat {}", path.display()))?;
            Ok((path, meta.modified().ok(), meta.len()))
        })
        .collect()
}

/// Re-mashes `dir` whenever one of its unit files is created, modified or
/// deleted, until `token` is cancelled
///
/// Only versions that compile are published to `latest`; `on_publish` runs
/// after each of them.
pub async fn watch(
    dir: PathBuf,
    main_file: String,
    masher: &Masher,
    latest: &LatestSource,
    period: Duration,
    token: CancellationToken,
    mut on_publish: impl FnMut(&MashReport),
) -> anyhow::Result<()> {
    log::info!("Watching {} for changes", dir.display());
    let mut ticker = tokio::time::interval(period);
    let mut seen: Option<Fingerprint> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Stopped watching {}", dir.display());
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let current = fingerprint(&dir)?;
        if seen.as_ref() == Some(&current) {
            continue;
        }
        seen = Some(current);

        let units = match gather_units(&dir, &main_file) {
            Ok(units) => units,
            Err(e) => {
                log::warn!("Cannot gather units: {e:#}");
                continue;
            }
        };
        let report = match masher.mash(units).await {
            Ok(report) => report,
            Err(e) => {
                log::warn!("Cannot mash {}: {e}", dir.display());
                continue;
            }
        };
        if report.compiles {
            log::info!("Coalesced source of {} updated", dir.display());
            on_publish(&report);
            latest.publish(report.source);
        } else {
            for diagnostic in &report.diagnostics {
                log::warn!("{diagnostic}");
            }
            log::warn!("Coalesced source does not compile, keeping the previous one");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, text: &str) {
        std::fs::write(dir.join(name), text).unwrap();
    }

    #[test]
    fn test_gather_units_sorted_with_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "zeta.mash", "fn zeta() { }");
        write(dir.path(), "main.mash", "fn main() { }");
        write(dir.path(), "alpha.mash", "fn alpha() { }");
        write(dir.path(), "notes.txt", "ignored");

        let units = gather_units(dir.path(), "main.mash").unwrap();
        let names: Vec<_> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["alpha", "main", "zeta"]);
        assert!(units[1].entry_point);
        assert!(!units[0].entry_point);

        assert!(gather_units(dir.path(), "other.mash").is_err());
    }

    #[test]
    fn test_coalesce_puts_entry_first() {
        let units = vec![
            SourceUnit::library("helper", "fn helper() { return 1; }"),
            SourceUnit::entry("main", "fn main() { return helper(); }\n"),
        ];
        let source = coalesce(&units).unwrap();
        let body = source.split_once("\n\n").unwrap().1;
        assert!(source.starts_with("// mashed "));
        assert_eq!(
            body,
            "fn main() { return helper(); }\n\n// unit: helper\nfn helper() { return 1; }\n"
        );
    }

    #[test]
    fn test_mash_reports_compilation() {
        let compiler = Compiler::default();
        let good = vec![
            SourceUnit::entry("main", "fn main() { return helper(); }"),
            SourceUnit::library("helper", "fn helper() { return 1; }"),
        ];
        let report = mash(&compiler, &good).unwrap();
        assert!(report.compiles);
        assert!(report.diagnostics.is_empty());

        let bad = vec![SourceUnit::entry("main", "fn main() { return missing(); }")];
        let report = mash(&compiler, &bad).unwrap();
        assert!(!report.compiles);
        assert_eq!(report.diagnostics[0].message, "undefined function 'missing'");

        assert!(matches!(mash(&compiler, &[]), Err(CompileError::Invalid(_))));
    }

    #[test]
    fn test_coalesce_honors_markers() {
        let units = vec![
            SourceUnit::library("helper", "fn helper() { return 1; }"),
            SourceUnit::entry(
                "main",
                "fn main() {\n    // [[CM::UPDATESTAMP]]\n    return helper();\n}\n\n// [[CM::CODE]]\n// end\n",
            ),
        ];
        let source = coalesce(&units).unwrap();
        let lines: Vec<_> = source.lines().collect();
        assert_eq!(lines[0], "fn main() {");
        assert!(lines[1].starts_with("    // mashed "));
        assert_eq!(
            &lines[2..],
            [
                "    return helper();",
                "}",
                "",
                "// unit: helper",
                "fn helper() { return 1; }",
                "// end",
            ]
        );
        assert!(!source.contains("[[CM::"));
        assert!(mash(&Compiler::default(), &units).unwrap().compiles);
    }

    #[tokio::test]
    async fn test_masher_runs_bounded_mashes() {
        let masher = Arc::new(Masher::new(Arc::new(Compiler::default()), 0));
        let mut mashes = tokio::task::JoinSet::new();
        for i in 0..4 {
            let masher = masher.clone();
            mashes.spawn(async move {
                let text = format!("fn main() {{ return {i}; }}");
                masher.mash(vec![SourceUnit::entry("main", text)]).await
            });
        }
        while let Some(report) = mashes.join_next().await {
            assert!(report.unwrap().unwrap().compiles);
        }
        assert_eq!(masher.permits.available_permits(), 1);
    }

    async fn published(latest: &LatestSource, expected: &str) -> String {
        for _ in 0..400 {
            if let Some(source) = latest.get().filter(|s| s.contains(expected)) {
                return source;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no coalesced source containing {expected:?} was published");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_watch_keeps_last_compiling_version() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.mash", "fn main() { return helper(); }");
        write(dir.path(), "helper.mash", "fn helper() { return 1; }");

        let masher = Arc::new(Masher::new(Arc::new(Compiler::default()), 1));
        let latest = Arc::new(LatestSource::default());
        let token = CancellationToken::new();
        let publishes = Arc::new(Mutex::new(0));
        let watcher = tokio::spawn({
            let (dir, masher, latest, token) =
                (dir.path().to_path_buf(), masher.clone(), latest.clone(), token.clone());
            let publishes = publishes.clone();
            async move {
                watch(
                    dir,
                    "main.mash".into(),
                    &masher,
                    &latest,
                    Duration::from_millis(10),
                    token,
                    |_| *publishes.lock() += 1,
                )
                .await
            }
        });

        published(&latest, "return 1;").await;

        // a broken edit is not published
        write(dir.path(), "helper.mash", "fn helper() { return 2 +; }");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(latest.get().unwrap().contains("return 1;"));
        assert_eq!(*publishes.lock(), 1);

        // a new file that compiles is picked up
        write(dir.path(), "helper.mash", "fn helper() { return three(); }");
        write(dir.path(), "three.mash", "fn three() { return 3; }");
        let source = published(&latest, "return 3;").await;
        assert!(source.contains("// unit: three"));

        token.cancel();
        watcher.await.unwrap().unwrap();
    }
}
