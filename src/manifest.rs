use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::{AuditError, AuditResult};

pub(crate) const MANIFEST_EXTENSION: &str = "archive";

/// Where the manifests for one run come from. The modes are exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ManifestSource {
    Subsystem { tag: String, area: Option<String> },
    File(PathBuf),
    Directory(PathBuf),
    /// A text file listing one manifest path per line.
    PathList(PathBuf),
}

/// One line of an extended manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ManifestEntry {
    pub(crate) pv_name: String,
    pub(crate) scan: String,
    pub(crate) method: String,
}

/// IOC directory pattern relative to the manifest base, e.g.
/// `*-li24*-bp*/archive/*.archive`.
pub(crate) fn discovery_pattern(tag: &str, area: Option<&str>) -> String {
    let ioc = match area {
        Some(area) => format!("*-{}*-{}*", area.to_lowercase(), tag.to_lowercase()),
        None => format!("*-*-{}*", tag.to_lowercase()),
    };
    format!("{ioc}/archive/*.{MANIFEST_EXTENSION}")
}

fn compile_pattern(pattern: &str) -> AuditResult<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| AuditError::Discovery(format!("bad pattern {pattern}: {e}")))
}

/// Find manifests for a subsystem under `base`. Results are sorted; an empty
/// result is not an error.
pub(crate) fn locate(base: &Path, tag: &str, area: Option<&str>) -> AuditResult<Vec<PathBuf>> {
    if tag.trim().is_empty() {
        return Err(AuditError::Discovery("subsystem tag is empty".into()));
    }
    let pattern = discovery_pattern(tag, area);
    let matcher = compile_pattern(&pattern)?;
    debug!(base = %base.display(), pattern = %pattern, "manifest discovery");

    if !base.is_dir() {
        return Err(AuditError::Discovery(format!(
            "manifest base {} is not a directory",
            base.display()
        )));
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(base)
        .min_depth(3)
        .max_depth(3)
        .follow_links(true)
    {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(base = %base.display(), error = %err, "unreadable entry skipped during discovery");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(base) else {
            continue;
        };
        if matcher.is_match(relative) {
            debug!(path = %entry.path().display(), "manifest matched");
            found.push(entry.path().to_path_buf());
        }
    }
    found.sort();
    Ok(found)
}

/// Every regular `.archive` file directly inside `dir`.
pub(crate) fn list_directory(dir: &Path) -> AuditResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(AuditError::Discovery(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| {
            entry
                .map_err(|err| {
                    warn!(dir = %dir.display(), error = %err, "unreadable entry skipped");
                })
                .ok()
        })
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == MANIFEST_EXTENSION)
        })
        .collect();
    found.sort();
    Ok(found)
}

pub(crate) fn read_path_list(list: &Path) -> AuditResult<Vec<PathBuf>> {
    let text = fs::read_to_string(list).map_err(|source| AuditError::ManifestIo {
        path: list.to_path_buf(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

pub(crate) fn resolve_manifests(source: &ManifestSource, base: &Path) -> AuditResult<Vec<PathBuf>> {
    match source {
        ManifestSource::Subsystem { tag, area } => locate(base, tag, area.as_deref()),
        ManifestSource::File(path) => Ok(vec![path.clone()]),
        ManifestSource::Directory(dir) => list_directory(dir),
        ManifestSource::PathList(list) => read_path_list(list),
    }
}

fn manifest_lines(path: &Path) -> AuditResult<Vec<(usize, String)>> {
    let io_err = |source: std::io::Error| AuditError::ManifestIo {
        path: path.to_path_buf(),
        source,
    };
    let file = fs::File::open(path).map_err(io_err)?;
    let mut lines = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        lines.push((idx + 1, line));
    }
    Ok(lines)
}

/// PV names in manifest order. Duplicates are kept.
pub(crate) fn parse_manifest(path: &Path) -> AuditResult<Vec<String>> {
    Ok(manifest_lines(path)?
        .into_iter()
        .filter_map(|(_, line)| line.split_whitespace().next().map(str::to_string))
        .collect())
}

/// Extended form: every line must be exactly `name scan method`.
pub(crate) fn parse_manifest_entries(path: &Path) -> AuditResult<Vec<ManifestEntry>> {
    let mut entries = Vec::new();
    for (line_no, line) in manifest_lines(path)? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let [pv_name, scan, method] = parts.as_slice() else {
            return Err(AuditError::MalformedManifest {
                path: path.to_path_buf(),
                line: line_no,
                reason: format!("expected 'name scan method', found {} fields", parts.len()),
            });
        };
        entries.push(ManifestEntry {
            pv_name: pv_name.to_string(),
            scan: scan.to_string(),
            method: method.to_string(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("archiver_audit_test")
            .join(format!("manifest_{}_{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(path: &Path, text: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, text).unwrap();
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let dir = temp_dir("skip");
        let path = dir.join("bpm.archive");
        write(&path, "# comment\n\nPV:A 1 MONITOR\nPV:B 2 SCAN\n");
        assert_eq!(parse_manifest(&path).unwrap(), vec!["PV:A", "PV:B"]);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn parse_takes_first_token_for_tabs_and_spaces() {
        let dir = temp_dir("tabs");
        let path = dir.join("mixed.archive");
        write(&path, "PV:A\t1\tMONITOR\nPV:B   2 SCAN\nPV:C\n   \nPV:A 1 MONITOR\n");
        assert_eq!(
            parse_manifest(&path).unwrap(),
            vec!["PV:A", "PV:B", "PV:C", "PV:A"]
        );
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn extended_parse_reads_scan_and_method() {
        let dir = temp_dir("extended");
        let path = dir.join("ext.archive");
        write(&path, "# header\nPV:A 1 MONITOR\nPV:B\t2\tSCAN\n");
        let entries = parse_manifest_entries(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].pv_name, "PV:B");
        assert_eq!(entries[1].scan, "2");
        assert_eq!(entries[1].method, "SCAN");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn extended_parse_rejects_short_lines() {
        let dir = temp_dir("short");
        let path = dir.join("short.archive");
        write(&path, "PV:A 1 MONITOR\nPV:B 2\n");
        let err = parse_manifest_entries(&path).unwrap_err();
        assert!(matches!(err, AuditError::MalformedManifest { line: 2, .. }));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_manifest_is_an_io_error() {
        let dir = temp_dir("missing");
        let err = parse_manifest(&dir.join("nope.archive")).unwrap_err();
        assert!(matches!(err, AuditError::ManifestIo { .. }));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn pattern_shape() {
        assert_eq!(discovery_pattern("BP", None), "*-*-bp*/archive/*.archive");
        assert_eq!(
            discovery_pattern("bp", Some("LI24")),
            "*-li24*-bp*/archive/*.archive"
        );
    }

    #[test]
    fn locate_matches_subsystem_and_area() {
        let base = temp_dir("locate");
        write(&base.join("ioc-li24-bp01/archive/b.archive"), "X\n");
        write(&base.join("ioc-li24-bp01/archive/a.archive"), "X\n");
        write(&base.join("ioc-in20-bp02/archive/c.archive"), "X\n");
        write(&base.join("ioc-li24-mg01/archive/m.archive"), "X\n");
        write(&base.join("ioc-li24-bp01/archive/notes.txt"), "X\n");
        write(&base.join("ioc-li24-bp01/other/d.archive"), "X\n");

        let all = locate(&base, "bp", None).unwrap();
        let names: Vec<String> = all.iter().map(|p| crate::manifest_key(p)).collect();
        assert_eq!(names, vec!["c.archive", "a.archive", "b.archive"]);

        let area = locate(&base, "BP", Some("li24")).unwrap();
        assert_eq!(area.len(), 2);
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn locate_without_matches_is_empty() {
        let base = temp_dir("empty");
        write(&base.join("ioc-li24-mg01/archive/m.archive"), "X\n");
        assert!(locate(&base, "bp", None).unwrap().is_empty());
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn directory_mode_lists_archive_files_only() {
        let dir = temp_dir("dirmode");
        write(&dir.join("b.archive"), "X\n");
        write(&dir.join("a.archive"), "X\n");
        write(&dir.join("readme.md"), "X\n");
        write(&dir.join("nested/c.archive"), "X\n");
        let found = list_directory(&dir).unwrap();
        assert_eq!(found, vec![dir.join("a.archive"), dir.join("b.archive")]);
        fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn broken_link_in_directory_is_skipped() {
        let dir = temp_dir("brokenlink");
        write(&dir.join("a.archive"), "X\n");
        std::os::unix::fs::symlink(dir.join("gone.archive"), dir.join("b.archive")).unwrap();
        let found = list_directory(&dir).unwrap();
        assert_eq!(found, vec![dir.join("a.archive")]);
        fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn broken_link_during_discovery_is_skipped() {
        let base = temp_dir("brokendiscovery");
        write(&base.join("ioc-li24-bp01/archive/a.archive"), "X\n");
        std::os::unix::fs::symlink(
            base.join("ioc-li24-bp01/archive/gone.archive"),
            base.join("ioc-li24-bp01/archive/b.archive"),
        )
        .unwrap();
        let found = locate(&base, "bp", None).unwrap();
        assert_eq!(found, vec![base.join("ioc-li24-bp01/archive/a.archive")]);
        fs::remove_dir_all(&base).ok();
    }

    #[test]
    fn path_list_ignores_blank_lines() {
        let dir = temp_dir("pathlist");
        let list = dir.join("paths.txt");
        write(&list, "/a/x.archive\n\n  /b/y.archive  \n");
        let source = ManifestSource::PathList(list);
        assert_eq!(
            resolve_manifests(&source, &dir).unwrap(),
            vec![PathBuf::from("/a/x.archive"), PathBuf::from("/b/y.archive")]
        );
        fs::remove_dir_all(&dir).ok();
    }
}
