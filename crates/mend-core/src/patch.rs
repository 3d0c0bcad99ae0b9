//! Line-range patches and their application.
//!
//! A [`PatchSpec`] replaces the half-open range `[start_line, end_line)` of a
//! file's line sequence. Lines keep their terminators, so rendering the
//! patched sequence reproduces the file byte for byte outside the range.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid line range {start}..{end} for a file of {line_count} lines")]
    InvalidRange {
        start: i64,
        end: i64,
        line_count: usize,
    },
    #[error("replacement is empty and empty patches are not allowed")]
    EmptyReplacement,
    #[error("{0} changed since the session snapshot; refusing to commit")]
    DigestMismatch(PathBuf),
    #[error("{0} is not valid UTF-8")]
    NotUtf8(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// Line terminator convention of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineEnding {
    #[default]
    Lf,
    CrLf,
}

impl LineEnding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lf => "\n",
            Self::CrLf => "\r\n",
        }
    }

    /// Detect the convention from the first terminated line. Defaults to `\n`.
    pub fn detect(text: &str) -> Self {
        match text.find('\n') {
            Some(idx) if idx > 0 && text.as_bytes()[idx - 1] == b'\r' => Self::CrLf,
            _ => Self::Lf,
        }
    }
}

/// A source file split into terminator-preserving lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub lines: Vec<String>,
    pub line_ending: LineEnding,
}

impl SourceFile {
    pub fn parse(text: &str) -> Self {
        Self {
            lines: split_lines(text),
            line_ending: LineEnding::detect(text),
        }
    }

    /// Read and parse a file from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        let text = String::from_utf8(bytes).map_err(|_| PatchError::NotUtf8(path.to_path_buf()))?;
        Ok(Self::parse(&text))
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Whether the final line lacks a terminator.
    pub fn ends_unterminated(&self) -> bool {
        self.lines.last().is_some_and(|line| !line.ends_with('\n'))
    }

    /// Join a line sequence using this file's terminator convention.
    pub fn render(&self, lines: &[String]) -> String {
        render_lines(lines, self.line_ending)
    }
}

/// Split text into lines, keeping each line's terminator.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

/// Concatenate lines, terminating any non-final line that lacks a terminator.
pub fn render_lines(lines: &[String], ending: LineEnding) -> String {
    let mut out = String::with_capacity(lines.iter().map(String::len).sum::<usize>() + lines.len());
    for (idx, line) in lines.iter().enumerate() {
        out.push_str(line);
        if idx + 1 < lines.len() && !line.ends_with('\n') {
            out.push_str(ending.as_str());
        }
    }
    out
}

/// A validated replacement of a contiguous line range.
///
/// `start_line..end_line` is 0-based and half-open over the original file's
/// lines. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSpec {
    start_line: usize,
    end_line: usize,
    replacement_lines: Vec<String>,
    rationale: String,
}

impl PatchSpec {
    /// Build a patch from a 0-based half-open range.
    ///
    /// `start == end` is a pure insertion; `end == line_count` reaches the tail.
    pub fn new(
        start_line: usize,
        end_line: usize,
        replacement_lines: Vec<String>,
        rationale: impl Into<String>,
        line_count: usize,
    ) -> Result<Self> {
        if start_line > end_line || end_line > line_count {
            return Err(PatchError::InvalidRange {
                start: i64::try_from(start_line).unwrap_or(i64::MAX),
                end: i64::try_from(end_line).unwrap_or(i64::MAX),
                line_count,
            });
        }
        Ok(Self {
            start_line,
            end_line,
            replacement_lines,
            rationale: rationale.into(),
        })
    }

    /// Build a patch from a collaborator's 1-based inclusive range.
    ///
    /// The last replaced 0-based index is `end - 1`, so the exclusive bound
    /// is `end`. Replacement text is split into lines and normalized to the
    /// source file's terminator convention.
    pub fn from_one_based(
        start: i64,
        end: i64,
        replacement_text: &str,
        rationale: impl Into<String>,
        source: &SourceFile,
        allow_empty: bool,
    ) -> Result<Self> {
        let line_count = source.line_count();
        let invalid = || PatchError::InvalidRange {
            start,
            end,
            line_count,
        };

        if start < 1 || end < 1 || start > end {
            return Err(invalid());
        }
        let start0 = usize::try_from(start - 1).map_err(|_| invalid())?;
        let end0 = usize::try_from(end).map_err(|_| invalid())?;
        if end0 > line_count {
            return Err(invalid());
        }

        let keep_unterminated = end0 == line_count && source.ends_unterminated();
        let replacement_lines =
            normalize_replacement(replacement_text, source.line_ending, keep_unterminated);
        if replacement_lines.is_empty() && !allow_empty {
            return Err(PatchError::EmptyReplacement);
        }

        Self::new(start0, end0, replacement_lines, rationale, line_count)
    }

    pub fn start_line(&self) -> usize {
        self.start_line
    }

    pub fn end_line(&self) -> usize {
        self.end_line
    }

    pub fn replacement_lines(&self) -> &[String] {
        &self.replacement_lines
    }

    pub fn rationale(&self) -> &str {
        &self.rationale
    }

    /// Replacement text exactly as it will be spliced in.
    pub fn replacement_text(&self) -> String {
        self.replacement_lines.concat()
    }

    /// The range as 1-based inclusive line numbers, for display.
    pub fn one_based_range(&self) -> (usize, usize) {
        (self.start_line + 1, self.end_line)
    }
}

/// Split replacement text and give every line the source terminator.
///
/// The final line is left unterminated only when `keep_unterminated` is set,
/// i.e. the patch reaches an end-of-file that had no trailing newline.
fn normalize_replacement(text: &str, ending: LineEnding, keep_unterminated: bool) -> Vec<String> {
    let pieces = split_lines(text);
    let count = pieces.len();
    pieces
        .into_iter()
        .enumerate()
        .map(|(idx, piece)| {
            let body = piece
                .strip_suffix('\n')
                .map_or(piece.as_str(), |s| s.strip_suffix('\r').unwrap_or(s));
            if idx + 1 == count && keep_unterminated {
                body.to_string()
            } else {
                format!("{body}{}", ending.as_str())
            }
        })
        .collect()
}

/// Splice a patch into a line sequence, returning a new sequence.
///
/// Equal to `original[..start] + replacement + original[end..]`. The input
/// is never mutated. The range is rechecked here because a spec read back
/// from disk skips the constructor.
pub fn apply(original: &[String], spec: &PatchSpec) -> Result<Vec<String>> {
    if spec.start_line > spec.end_line || spec.end_line > original.len() {
        return Err(PatchError::InvalidRange {
            start: i64::try_from(spec.start_line).unwrap_or(i64::MAX),
            end: i64::try_from(spec.end_line).unwrap_or(i64::MAX),
            line_count: original.len(),
        });
    }

    let mut patched = Vec::with_capacity(
        original.len() - (spec.end_line - spec.start_line) + spec.replacement_lines.len(),
    );
    patched.extend_from_slice(&original[..spec.start_line]);
    patched.extend_from_slice(&spec.replacement_lines);
    patched.extend_from_slice(&original[spec.end_line..]);
    Ok(patched)
}

/// SHA-256 hex digest of a byte slice.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and an atomic rename.
///
/// Readers see either the old content or the new content, never a partial
/// write. Existing permissions are carried over to the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    if let Ok(metadata) = fs::metadata(path) {
        tmp.as_file().set_permissions(metadata.permissions())?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Permanently apply a verified patch to the canonical file.
///
/// Refuses when the file no longer matches `expected_digest`, i.e. it was
/// edited after the session snapshot the patch was computed against.
pub fn commit(original_path: &Path, spec: &PatchSpec, expected_digest: &str) -> Result<()> {
    let bytes = fs::read(original_path)?;
    if digest(&bytes) != expected_digest {
        return Err(PatchError::DigestMismatch(original_path.to_path_buf()));
    }
    let text = String::from_utf8(bytes).map_err(|_| PatchError::NotUtf8(original_path.to_path_buf()))?;
    let source = SourceFile::parse(&text);
    let patched = apply(&source.lines, spec)?;
    write_atomic(original_path, source.render(&patched).as_bytes())?;

    info!(
        path = %original_path.display(),
        start_line = spec.start_line,
        end_line = spec.end_line,
        "committed patch"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    fn sample() -> Vec<String> {
        lines(&["a\n", "b\n", "c\n", "d\n"])
    }

    #[test]
    fn apply_replaces_single_line() {
        let original = lines(&["def add(a,b):\n", "    return a-b\n"]);
        let spec = PatchSpec::new(1, 2, lines(&["    return a+b\n"]), "fix sign", 2).unwrap();
        let patched = apply(&original, &spec).unwrap();
        assert_eq!(patched, lines(&["def add(a,b):\n", "    return a+b\n"]));
    }

    #[test]
    fn apply_is_pure_and_deterministic() {
        let original = sample();
        let before = original.clone();
        let spec = PatchSpec::new(1, 3, lines(&["x\n"]), "r", original.len()).unwrap();

        let first = apply(&original, &spec).unwrap();
        let second = apply(&original, &spec).unwrap();
        assert_eq!(first, second);
        assert_eq!(original, before);
    }

    #[test]
    fn apply_length_matches_range_arithmetic() {
        let original = sample();
        for start in 0..=original.len() {
            for end in start..=original.len() {
                for repl_len in 0..3 {
                    let replacement = vec!["r\n".to_string(); repl_len];
                    let spec =
                        PatchSpec::new(start, end, replacement, "r", original.len()).unwrap();
                    let patched = apply(&original, &spec).unwrap();
                    assert_eq!(patched.len(), original.len() - (end - start) + repl_len);
                }
            }
        }
    }

    #[test]
    fn no_op_patch_round_trips() {
        let original = sample();
        let spec = PatchSpec::new(1, 3, original[1..3].to_vec(), "noop", original.len()).unwrap();
        assert_eq!(apply(&original, &spec).unwrap(), original);
    }

    #[test]
    fn pure_insertion_and_tail_append_apply() {
        let original = sample();
        let insert = PatchSpec::new(2, 2, lines(&["new\n"]), "insert", 4).unwrap();
        assert_eq!(
            apply(&original, &insert).unwrap(),
            lines(&["a\n", "b\n", "new\n", "c\n", "d\n"])
        );

        let append = PatchSpec::new(4, 4, lines(&["e\n"]), "append", 4).unwrap();
        assert_eq!(apply(&original, &append).unwrap().last().unwrap(), "e\n");
    }

    #[test]
    fn new_rejects_out_of_bounds_ranges() {
        assert!(matches!(
            PatchSpec::new(3, 2, vec![], "r", 4),
            Err(PatchError::InvalidRange { .. })
        ));
        assert!(matches!(
            PatchSpec::new(0, 5, vec![], "r", 4),
            Err(PatchError::InvalidRange { .. })
        ));
    }

    #[test]
    fn apply_rejects_spec_longer_than_input() {
        let spec = PatchSpec::new(0, 4, vec![], "r", 4).unwrap();
        let short = lines(&["a\n"]);
        assert!(matches!(apply(&short, &spec), Err(PatchError::InvalidRange { .. })));
    }

    #[test]
    fn apply_rejects_inverted_range_read_from_disk() {
        let spec: PatchSpec = serde_json::from_str(
            r#"{"start_line": 3, "end_line": 1, "replacement_lines": ["x\n"], "rationale": "r"}"#,
        )
        .unwrap();
        assert!(matches!(apply(&sample(), &spec), Err(PatchError::InvalidRange { .. })));
    }

    #[test]
    fn one_based_inclusive_converts_to_half_open() {
        let source = SourceFile::parse("a\nb\nc\n");
        let spec = PatchSpec::from_one_based(2, 2, "B", "r", &source, true).unwrap();
        assert_eq!((spec.start_line(), spec.end_line()), (1, 2));
        assert_eq!(spec.replacement_lines(), ["B\n"]);
        assert_eq!(spec.one_based_range(), (2, 2));

        let whole = PatchSpec::from_one_based(1, 3, "x\ny\n", "r", &source, true).unwrap();
        assert_eq!((whole.start_line(), whole.end_line()), (0, 3));
    }

    #[test]
    fn one_based_rejects_inverted_nonpositive_and_overlong() {
        let source = SourceFile::parse("a\nb\nc\n");
        for (start, end) in [(5, 2), (0, 1), (1, 0), (-1, 2), (2, 4)] {
            let err = PatchSpec::from_one_based(start, end, "x", "r", &source, true).unwrap_err();
            assert!(
                matches!(err, PatchError::InvalidRange { .. }),
                "({start}, {end}) should be invalid"
            );
        }
    }

    #[test]
    fn empty_replacement_follows_policy() {
        let source = SourceFile::parse("a\nb\n");
        let deletion = PatchSpec::from_one_based(1, 1, "", "delete", &source, true).unwrap();
        assert!(deletion.replacement_lines().is_empty());

        let err = PatchSpec::from_one_based(1, 1, "", "delete", &source, false).unwrap_err();
        assert!(matches!(err, PatchError::EmptyReplacement));
    }

    #[test]
    fn replacement_adopts_crlf_convention() {
        let source = SourceFile::parse("a\r\nb\r\nc\r\n");
        assert_eq!(source.line_ending, LineEnding::CrLf);
        let spec = PatchSpec::from_one_based(2, 2, "x\ny", "r", &source, true).unwrap();
        assert_eq!(spec.replacement_lines(), ["x\r\n", "y\r\n"]);
    }

    #[test]
    fn replacement_keeps_missing_trailing_newline_at_eof() {
        let source = SourceFile::parse("a\nb");
        let spec = PatchSpec::from_one_based(2, 2, "B\n", "r", &source, true).unwrap();
        let patched = apply(&source.lines, &spec).unwrap();
        assert_eq!(source.render(&patched), "a\nB");

        let mid = PatchSpec::from_one_based(1, 1, "A", "r", &source, true).unwrap();
        let patched = apply(&source.lines, &mid).unwrap();
        assert_eq!(source.render(&patched), "A\nb");
    }

    #[test]
    fn render_terminates_lines_before_a_tail_append() {
        let source = SourceFile::parse("a\nb");
        let append = PatchSpec::new(2, 2, lines(&["c\n"]), "append", 2).unwrap();
        let patched = apply(&source.lines, &append).unwrap();
        assert_eq!(source.render(&patched), "a\nb\nc\n");
    }

    #[test]
    fn parse_and_render_round_trip() {
        for text in ["", "a", "a\n", "a\nb", "a\r\nb\r\n", "\n\n"] {
            let source = SourceFile::parse(text);
            assert_eq!(source.render(&source.lines), text);
        }
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file.py");
        std::fs::write(&path, "old\n").unwrap();

        write_atomic(&path, b"new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");
        // Only the target remains; the temp file was renamed over it.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn commit_applies_when_digest_matches() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("add.py");
        let original = "def add(a,b):\n    return a-b\n";
        std::fs::write(&path, original).unwrap();

        let source = SourceFile::parse(original);
        let spec = PatchSpec::from_one_based(2, 2, "    return a+b", "fix", &source, true).unwrap();
        commit(&path, &spec, &digest(original.as_bytes())).unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "def add(a,b):\n    return a+b\n"
        );
    }

    #[test]
    fn commit_refuses_when_file_changed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("add.py");
        std::fs::write(&path, "changed\n").unwrap();

        let spec = PatchSpec::new(0, 1, lines(&["x\n"]), "r", 1).unwrap();
        let err = commit(&path, &spec, &digest(b"original\n")).unwrap_err();
        assert!(matches!(err, PatchError::DigestMismatch(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "changed\n");
    }
}
