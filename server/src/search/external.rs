//! Command-line search backends: a trigram-indexed engine plus the fast grep
//! family. Children run with process-level deadlines — on timeout the child
//! is killed and `Timeout` raised, partial output discarded.

use super::{parse_search_output, SearchBackend, SearchQuery};
use crate::errors::{Result, ServerError};
use code_index_core::fuzzy::{create_safe_fuzzy_pattern, glob_to_regex};
use code_index_core::types::SearchMatches;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Query deadline for external tools.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for index construction.
pub const INDEX_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run a child process with a deadline. Output is drained on reader threads
/// so a chatty child cannot deadlock on a full pipe; on deadline the child
/// is killed and awaited before `Timeout` is raised.
pub fn run_with_deadline(mut cmd: Command, timeout: Duration, tool: &str) -> Result<ToolOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn().map_err(|e| ServerError::SearchFailed {
        tool: tool.to_string(),
        stderr: format!("spawn failed: {e}"),
    })?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_thread = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = stdout_pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_thread.join().unwrap_or_default();
                let stderr = stderr_thread.join().unwrap_or_default();
                return Ok(ToolOutput {
                    status: status.code().unwrap_or(-1),
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    let _ = stdout_thread.join();
                    let _ = stderr_thread.join();
                    return Err(ServerError::Timeout {
                        tool: tool.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                std::thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = stdout_thread.join();
                let _ = stderr_thread.join();
                return Err(ServerError::SearchFailed {
                    tool: tool.to_string(),
                    stderr: e.to_string(),
                });
            }
        }
    }
}

// Exit code 1 means "no matches" for the whole grep family.
fn parse_tool_result(output: ToolOutput, tool: &str, base: &Path) -> Result<SearchMatches> {
    match output.status {
        0 => Ok(parse_search_output(&output.stdout, base)),
        1 => Ok(SearchMatches::new()),
        _ => Err(ServerError::SearchFailed {
            tool: tool.to_string(),
            stderr: output.stderr.trim().to_string(),
        }),
    }
}

fn effective_pattern(query: &SearchQuery) -> String {
    if query.fuzzy {
        create_safe_fuzzy_pattern(&query.pattern)
    } else {
        query.pattern.clone()
    }
}

fn thread_count() -> String {
    num_cpus::get().to_string()
}

// ---------------------------------------------------------------------------
// ripgrep
// ---------------------------------------------------------------------------

pub struct RipgrepBackend;

impl SearchBackend for RipgrepBackend {
    fn name(&self) -> &'static str {
        "ripgrep"
    }

    fn is_available(&self) -> bool {
        which::which("rg").is_ok()
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchMatches> {
        let mut cmd = Command::new("rg");
        cmd.arg("--line-number")
            .arg("--no-heading")
            .arg("--color")
            .arg("never")
            .arg("--threads")
            .arg(thread_count());
        if !query.case_sensitive {
            cmd.arg("--ignore-case");
        }
        if !query.fuzzy {
            cmd.arg("--fixed-strings");
        }
        if query.context_lines > 0 {
            cmd.arg("--context").arg(query.context_lines.to_string());
        }
        if let Some(glob) = &query.file_glob {
            cmd.arg("--glob").arg(glob);
        }
        cmd.arg("--").arg(effective_pattern(query)).arg(&query.base);

        let output = run_with_deadline(cmd, SEARCH_TIMEOUT, self.name())?;
        parse_tool_result(output, self.name(), &query.base)
    }
}

// ---------------------------------------------------------------------------
// ugrep
// ---------------------------------------------------------------------------

pub struct UgrepBackend;

impl SearchBackend for UgrepBackend {
    fn name(&self) -> &'static str {
        "ugrep"
    }

    fn is_available(&self) -> bool {
        which::which("ug").is_ok()
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchMatches> {
        let mut cmd = Command::new("ug");
        cmd.arg("--recursive")
            .arg("--line-number")
            .arg("--no-heading")
            .arg("--color=never")
            .arg("-J")
            .arg(thread_count());
        if !query.case_sensitive {
            cmd.arg("--ignore-case");
        }
        if !query.fuzzy {
            cmd.arg("--fixed-strings");
        }
        if query.context_lines > 0 {
            cmd.arg(format!("-C{}", query.context_lines));
        }
        if let Some(glob) = &query.file_glob {
            cmd.arg(format!("--include={glob}"));
        }
        cmd.arg("--").arg(effective_pattern(query)).arg(&query.base);

        let output = run_with_deadline(cmd, SEARCH_TIMEOUT, self.name())?;
        parse_tool_result(output, self.name(), &query.base)
    }
}

// ---------------------------------------------------------------------------
// the silver searcher
// ---------------------------------------------------------------------------

pub struct AgBackend;

impl SearchBackend for AgBackend {
    fn name(&self) -> &'static str {
        "ag"
    }

    fn is_available(&self) -> bool {
        which::which("ag").is_ok()
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchMatches> {
        let mut cmd = Command::new("ag");
        cmd.arg("--numbers").arg("--noheading").arg("--nocolor");
        if !query.case_sensitive {
            cmd.arg("--ignore-case");
        } else {
            cmd.arg("--case-sensitive");
        }
        if !query.fuzzy {
            cmd.arg("--literal");
        }
        if query.context_lines > 0 {
            cmd.arg(format!("-C{}", query.context_lines));
        }
        if let Some(glob) = &query.file_glob {
            // ag takes a regex file filter, not a glob
            cmd.arg("--file-search-regex").arg(glob_to_regex(glob));
        }
        cmd.arg("--").arg(effective_pattern(query)).arg(&query.base);

        let output = run_with_deadline(cmd, SEARCH_TIMEOUT, self.name())?;
        parse_tool_result(output, self.name(), &query.base)
    }
}

// ---------------------------------------------------------------------------
// plain grep
// ---------------------------------------------------------------------------

pub struct GrepBackend;

impl SearchBackend for GrepBackend {
    fn name(&self) -> &'static str {
        "grep"
    }

    fn is_available(&self) -> bool {
        which::which("grep").is_ok()
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchMatches> {
        let mut cmd = Command::new("grep");
        cmd.arg("-r").arg("-n").arg("-H");
        if !query.case_sensitive {
            cmd.arg("-i");
        }
        if query.fuzzy {
            cmd.arg("-E");
        } else {
            cmd.arg("-F");
        }
        if query.context_lines > 0 {
            cmd.arg("-C").arg(query.context_lines.to_string());
        }
        if let Some(glob) = &query.file_glob {
            cmd.arg(format!("--include={glob}"));
        }
        cmd.arg("--").arg(effective_pattern(query)).arg(&query.base);

        let output = run_with_deadline(cmd, SEARCH_TIMEOUT, self.name())?;
        parse_tool_result(output, self.name(), &query.base)
    }
}

// ---------------------------------------------------------------------------
// trigram-indexed backend (zoekt)
// ---------------------------------------------------------------------------

/// Zoekt: builds a trigram index on first use under the configured location;
/// searches go against the index rather than the live tree.
pub struct TrigramBackend {
    index_dir: PathBuf,
    binaries: Mutex<Option<(PathBuf, PathBuf)>>,
    indexed: AtomicBool,
}

impl TrigramBackend {
    pub fn new(index_dir: &Path) -> Self {
        Self {
            index_dir: index_dir.to_path_buf(),
            binaries: Mutex::new(None),
            indexed: AtomicBool::new(false),
        }
    }

    // Locate zoekt and zoekt-index via PATH, then the usual Go install dirs.
    fn locate(&self) -> Option<(PathBuf, PathBuf)> {
        if let Some(found) = self.binaries.lock().unwrap().clone() {
            return Some(found);
        }
        let mut search: Option<PathBuf> = which::which("zoekt").ok();
        let mut index: Option<PathBuf> = which::which("zoekt-index").ok();

        if search.is_none() || index.is_none() {
            let mut go_bins: Vec<PathBuf> = Vec::new();
            if let Ok(output) = Command::new("go").arg("env").arg("GOPATH").output() {
                let gopath = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !gopath.is_empty() {
                    go_bins.push(PathBuf::from(gopath).join("bin"));
                }
            }
            if let Some(home) = dirs::home_dir() {
                go_bins.push(home.join("go").join("bin"));
            }
            go_bins.push(PathBuf::from("/usr/local/go/bin"));
            for bin_dir in go_bins {
                let s = bin_dir.join("zoekt");
                let i = bin_dir.join("zoekt-index");
                if s.exists() && i.exists() {
                    search.get_or_insert(s);
                    index.get_or_insert(i);
                    break;
                }
            }
        }

        let found = Some((search?, index?));
        *self.binaries.lock().unwrap() = found.clone();
        found
    }

    fn has_shards(&self) -> bool {
        fs::read_dir(&self.index_dir)
            .map(|entries| {
                entries.flatten().any(|e| {
                    e.path()
                        .extension()
                        .map(|ext| ext == "zoekt")
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    }

    fn build_index(&self, base: &Path) -> Result<()> {
        let Some((_, indexer)) = self.locate() else {
            return Err(ServerError::SearchFailed {
                tool: "zoekt".to_string(),
                stderr: "zoekt-index binary not found".to_string(),
            });
        };
        fs::create_dir_all(&self.index_dir)?;
        info!(base = %base.display(), index = %self.index_dir.display(), "Building trigram index");

        let mut cmd = Command::new(indexer);
        cmd.arg("-index")
            .arg(&self.index_dir)
            .arg("-parallelism")
            .arg("2")
            .arg(base);
        let output = run_with_deadline(cmd, INDEX_TIMEOUT, "zoekt-index")?;
        if output.status != 0 {
            return Err(ServerError::SearchFailed {
                tool: "zoekt-index".to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        self.indexed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl SearchBackend for TrigramBackend {
    fn name(&self) -> &'static str {
        "zoekt"
    }

    fn is_available(&self) -> bool {
        self.locate().is_some()
    }

    fn prepare(&self, base: &Path) -> Result<()> {
        if self.indexed.load(Ordering::SeqCst) && self.has_shards() {
            return Ok(());
        }
        self.build_index(base)
    }

    /// Incremental refresh recreates the index.
    fn refresh_index(&self, base: &Path) -> Result<()> {
        self.indexed.store(false, Ordering::SeqCst);
        if self.index_dir.exists() {
            for entry in fs::read_dir(&self.index_dir)?.flatten() {
                let _ = fs::remove_file(entry.path());
            }
        }
        self.build_index(base)
    }

    fn search(&self, query: &SearchQuery) -> Result<SearchMatches> {
        self.prepare(&query.base)?;
        let Some((searcher, _)) = self.locate() else {
            return Err(ServerError::SearchFailed {
                tool: "zoekt".to_string(),
                stderr: "zoekt binary not found".to_string(),
            });
        };

        // Literal queries are regex-escaped; fuzzy queries pass through as
        // regex. File globs use zoekt's native file: atom.
        let mut q = if query.fuzzy {
            query.pattern.clone()
        } else {
            regex::escape(&query.pattern)
        };
        if query.case_sensitive {
            q = format!("case:yes {q}");
        }
        if let Some(glob) = &query.file_glob {
            q = format!("file:{} {q}", glob_to_regex(glob));
        }

        let mut cmd = Command::new(searcher);
        cmd.arg("-index_dir").arg(&self.index_dir).arg(q);
        let output = run_with_deadline(cmd, SEARCH_TIMEOUT, self.name())?;
        if output.status != 0 && output.status != 1 {
            warn!(status = output.status, "zoekt returned unexpected status");
        }
        parse_tool_result(output, self.name(), &query.base)
    }
}

/// Backend priority order: trigram first, then the grep family by expected
/// throughput, with the in-process fallback last.
pub fn backend_stack(trigram_index_dir: &Path) -> Vec<std::sync::Arc<dyn SearchBackend>> {
    vec![
        std::sync::Arc::new(TrigramBackend::new(trigram_index_dir)),
        std::sync::Arc::new(RipgrepBackend),
        std::sync::Arc::new(UgrepBackend),
        std::sync::Arc::new(AgBackend),
        std::sync::Arc::new(GrepBackend),
        std::sync::Arc::new(super::fallback::FallbackBackend),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_with_deadline_captures_output() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 0");
        let output = run_with_deadline(cmd, Duration::from_secs(5), "sh").unwrap();
        assert_eq!(output.status, 0);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn test_run_with_deadline_kills_on_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let err = run_with_deadline(cmd, Duration::from_millis(200), "sleep").unwrap_err();
        assert!(matches!(err, ServerError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_exit_one_is_empty_result() {
        let output = ToolOutput {
            status: 1,
            stdout: String::new(),
            stderr: String::new(),
        };
        let matches = parse_tool_result(output, "rg", Path::new("/p")).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_exit_two_is_search_failed() {
        let output = ToolOutput {
            status: 2,
            stdout: String::new(),
            stderr: "bad pattern".to_string(),
        };
        let err = parse_tool_result(output, "rg", Path::new("/p")).unwrap_err();
        match err {
            ServerError::SearchFailed { tool, stderr } => {
                assert_eq!(tool, "rg");
                assert_eq!(stderr, "bad pattern");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
