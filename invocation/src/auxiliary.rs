/// One piece of an auxiliary file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    /// Contents of another file, read when the auxiliary file is written.
    File(String),
}

/// A file written to disk right before its invocation runs, such as a generated script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryFile {
    path: String,
    chunks: Vec<Chunk>,
    executable: bool,
}

impl AuxiliaryFile {
    pub fn new<S: Into<String>>(path: S, chunks: Vec<Chunk>, executable: bool) -> AuxiliaryFile {
        AuxiliaryFile {
            path: path.into(),
            chunks,
            executable,
        }
    }

    pub fn data<S: Into<String>, D: Into<Vec<u8>>>(
        path: S,
        data: D,
        executable: bool,
    ) -> AuxiliaryFile {
        AuxiliaryFile::new(path, vec![Chunk::Data(data.into())], executable)
    }

    pub fn file<S: Into<String>, F: Into<String>>(
        path: S,
        file: F,
        executable: bool,
    ) -> AuxiliaryFile {
        AuxiliaryFile::new(path, vec![Chunk::File(file.into())], executable)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn executable(&self) -> bool {
        self.executable
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_constructors() {
        let script = AuxiliaryFile::data("/tmp/script.sh", "#!/bin/sh\n", true);
        assert_eq!(script.chunks(), &[Chunk::Data(b"#!/bin/sh\n".to_vec())]);
        assert!(script.executable());

        let copy = AuxiliaryFile::file("/tmp/Info.plist", "/src/Info.plist", false);
        assert_eq!(copy.path(), "/tmp/Info.plist");
        assert_eq!(copy.chunks(), &[Chunk::File("/src/Info.plist".to_owned())]);
        assert!(!copy.executable());
    }
}
