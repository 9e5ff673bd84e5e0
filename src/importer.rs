//! Importer resolution: turns a wire `Importer` oneof into something the
//! engine can actually ask for contents from, and implements the one case
//! that never touches the host — the filesystem importer (`spec.md` §6.1:
//! "Filesystem importers are constructed directly from a base path without
//! host involvement").

use crate::engine::EngineError;
use crate::proto_gen::host::importer::Importer as WireImporter;
use crate::proto_gen::host::Importer;
use std::fs;
use std::path::{Path, PathBuf};

/// A resolved reference to one of the three importer kinds a `CompileRequest`
/// may list.
#[derive(Debug, Clone)]
pub enum ImporterRef {
    Filesystem(PathBuf),
    Host(u32),
    FileHost(u32),
}

impl ImporterRef {
    pub fn from_wire(importer: &Importer) -> Result<Self, EngineError> {
        match &importer.importer {
            Some(WireImporter::Path(path)) => Ok(ImporterRef::Filesystem(PathBuf::from(path))),
            Some(WireImporter::ImporterId(id)) => Ok(ImporterRef::Host(*id)),
            Some(WireImporter::FileImporterId(id)) => Ok(ImporterRef::FileHost(*id)),
            None => Err(EngineError::internal("Importer.importer is not set.")),
        }
    }
}

/// Loads stylesheet contents directly from a base directory, with no host
/// round trip. Tries `<url>`, then `<url>.scss`, then `<url>.css`, matching
/// the load-path probing an on-disk importer is expected to perform.
pub fn load_from_filesystem(base: &Path, url: &str) -> Result<String, EngineError> {
    for candidate in candidates(base, url) {
        if let Ok(contents) = fs::read_to_string(&candidate) {
            return Ok(contents);
        }
    }
    Err(EngineError::not_found(file_uri(&base.join(url))))
}

fn candidates(base: &Path, url: &str) -> Vec<PathBuf> {
    let joined = base.join(url);
    vec![
        joined.clone(),
        with_extension(&joined, "scss"),
        with_extension(&joined, "css"),
    ]
}

fn with_extension(path: &Path, ext: &str) -> PathBuf {
    let mut path = path.to_path_buf();
    path.set_extension(ext);
    path
}

/// Renders a filesystem path as a `file:` URI for use in a zero-location
/// span when a `PathInput` itself cannot be found (`spec.md` §4.C step 4).
pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_filesystem_import_tries_scss_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("x.scss")).unwrap();
        write!(file, "c{{d:1}}").unwrap();

        let contents = load_from_filesystem(dir.path(), "x").unwrap();
        assert_eq!(contents, "c{d:1}");
    }

    #[test]
    fn test_filesystem_import_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_from_filesystem(dir.path(), "missing").unwrap_err();
        assert!(err.message.starts_with("file://"));
    }

    #[test]
    fn test_file_uri_format() {
        assert_eq!(file_uri(Path::new("/tmp/a.scss")), "file:///tmp/a.scss");
    }
}
