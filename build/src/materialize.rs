//! Writes the auxiliary files an invocation asks for before it runs.

use std::io;

use thiserror::Error;
use tracing::debug;

use pbx_interface::Filesystem;
use pbx_invocation::{AuxiliaryFile, Chunk};
use pbx_metrics::scoped_metric;
use pbx_paths::{join, parent};

#[derive(Error, Debug)]
pub enum AuxiliaryFileErrorKind {
    #[error("creating parent directory: {0}")]
    CreateDirectory(#[source] io::Error),
    #[error("reading chunk {path}: {source}")]
    ReadChunk { path: String, source: io::Error },
    #[error("{0}")]
    Write(#[source] io::Error),
    #[error("setting the executable bit: {0}")]
    SetExecutable(#[source] io::Error),
}

#[derive(Error, Debug)]
#[error("writing auxiliary file {path}: {kind}")]
pub struct AuxiliaryFileError {
    pub path: String,
    #[source]
    pub kind: AuxiliaryFileErrorKind,
}

/// The concatenation of all chunks.
pub fn contents(
    fs: &dyn Filesystem,
    file: &AuxiliaryFile,
    working_directory: &str,
) -> Result<Vec<u8>, AuxiliaryFileError> {
    let mut data = Vec::new();
    for chunk in file.chunks() {
        match chunk {
            Chunk::Data(bytes) => data.extend_from_slice(bytes),
            Chunk::File(source) => {
                let source = join(working_directory, source);
                let bytes = fs.read_all(&source).map_err(|e| AuxiliaryFileError {
                    path: join(working_directory, file.path()),
                    kind: AuxiliaryFileErrorKind::ReadChunk {
                        path: source.clone(),
                        source: e,
                    },
                })?;
                data.extend_from_slice(&bytes);
            }
        }
    }
    Ok(data)
}

pub fn materialize(
    fs: &dyn Filesystem,
    file: &AuxiliaryFile,
    working_directory: &str,
) -> Result<(), AuxiliaryFileError> {
    scoped_metric!("materialize");
    let path = join(working_directory, file.path());
    let error = |kind| AuxiliaryFileError {
        path: path.clone(),
        kind,
    };
    let data = contents(fs, file, working_directory)?;
    if let Some(directory) = parent(&path) {
        fs.create_directory(directory)
            .map_err(|e| error(AuxiliaryFileErrorKind::CreateDirectory(e)))?;
    }
    fs.write(&data, &path)
        .map_err(|e| error(AuxiliaryFileErrorKind::Write(e)))?;
    if file.executable() {
        fs.set_executable(&path, true)
            .map_err(|e| error(AuxiliaryFileErrorKind::SetExecutable(e)))?;
    }
    debug!(path = %path, bytes = data.len(), "materialized auxiliary file");
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use pbx_interface::testing::MemoryFilesystem;

    #[test]
    fn test_chunks_concatenate() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/src/header.sh", "#!/bin/sh\n");
        let file = AuxiliaryFile::new(
            "scripts/run.sh",
            vec![
                Chunk::File("header.sh".to_owned()),
                Chunk::Data(b"exec \"$@\"\n".to_vec()),
            ],
            true,
        );
        materialize(&fs, &file, "/src").unwrap();
        assert_eq!(
            fs.contents("/src/scripts/run.sh").unwrap(),
            b"#!/bin/sh\nexec \"$@\"\n"
        );
        assert!(fs.is_executable("/src/scripts/run.sh"));
    }

    #[test]
    fn test_not_executable_unless_asked() {
        let fs = MemoryFilesystem::new();
        materialize(&fs, &AuxiliaryFile::data("/out/list.txt", "a\nb\n", false), "/").unwrap();
        assert!(!fs.is_executable("/out/list.txt"));
    }

    #[test]
    fn test_missing_chunk_source() {
        let fs = MemoryFilesystem::new();
        let err = materialize(
            &fs,
            &AuxiliaryFile::file("/out/copy.txt", "/nowhere.txt", false),
            "/",
        )
        .unwrap_err();
        assert!(matches!(err.kind, AuxiliaryFileErrorKind::ReadChunk { .. }));
        assert!(!fs.exists("/out/copy.txt"));
        insta::assert_snapshot!(
            err.to_string(),
            @"writing auxiliary file /out/copy.txt: reading chunk /nowhere.txt: /nowhere.txt: not found"
        );
    }

    #[test]
    fn test_parent_is_a_file() {
        let fs = MemoryFilesystem::new();
        fs.add_file("/out", "");
        let err = materialize(&fs, &AuxiliaryFile::data("/out/x", "", false), "/").unwrap_err();
        assert!(matches!(
            err.kind,
            AuxiliaryFileErrorKind::CreateDirectory(_)
        ));
    }
}
