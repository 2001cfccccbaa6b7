//! Reading and writing the retention manifest
//!
//! The manifest is plain text, one retained key per line. Parsing is
//! whitespace-tokenized, so trailing newlines or a hand-edited file with
//! extra spacing still load cleanly.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::Path;

/// Read the retained keys in file order, dropping duplicate tokens.
pub(crate) fn read_keys(path: &Path) -> io::Result<Vec<String>> {
    let text = fs::read_to_string(path)?;
    let mut seen = HashSet::new();
    let mut keys = Vec::new();
    for token in text.split_whitespace() {
        if seen.insert(token) {
            keys.push(token.to_owned());
        }
    }
    Ok(keys)
}

/// Write the retained keys one per line, truncating any previous manifest.
pub(crate) fn write_keys(path: &Path, keys: &[String]) -> io::Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for key in keys {
        writeln!(out, "{key}")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest");

        let keys = vec!["c".to_owned(), "a".to_owned(), "b".to_owned()];
        write_keys(&path, &keys).unwrap();
        assert_eq!(read_keys(&path).unwrap(), keys);
    }

    #[test]
    fn read_tokenizes_any_whitespace_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest");

        fs::write(&path, "a  b\n\nc\tb a\n").unwrap();
        assert_eq!(read_keys(&path).unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn read_missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_keys(&dir.path().join("manifest")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn write_truncates_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest");

        write_keys(&path, &["old".to_owned(), "stale".to_owned()]).unwrap();
        write_keys(&path, &["fresh".to_owned()]).unwrap();
        assert_eq!(read_keys(&path).unwrap(), vec!["fresh"]);
    }
}
