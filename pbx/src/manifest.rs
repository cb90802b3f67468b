//! The invocation manifest: an array of invocation objects with camelCase keys, as JSON or as an
//! XML property list.

use std::io;

use thiserror::Error;

use pbx_interface::Filesystem;
use pbx_invocation::{
    AuxiliaryFile, Chunk, DependencyInfo, DependencyInfoFormat, Executable, Invocation,
};
use pbx_plist::{Dictionary, Format, FormatError, Json, SimpleXml, Value};

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error("expected an array of invocations, got {0}")]
    NotAnArray(&'static str),
    #[error("invocation {index}: {message}")]
    Invalid { index: usize, message: String },
}

const KEYS: &[&str] = &[
    "executable",
    "arguments",
    "environment",
    "workingDirectory",
    "inputs",
    "outputs",
    "phonyInputs",
    "inputDependencies",
    "orderDependencies",
    "dependencyInfo",
    "auxiliaryFiles",
    "logMessage",
    "showEnvironmentInLog",
    "createsProductStructure",
];

fn unexpected(key: &str, wanted: &str, got: &Value) -> String {
    format!("'{}' must be {}, got {}", key, wanted, got.kind())
}

fn string<'a>(dict: &'a Dictionary, key: &str) -> Result<Option<&'a str>, String> {
    match dict.get(key) {
        None => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or_else(|| unexpected(key, "a string", value)),
    }
}

fn strings(dict: &Dictionary, key: &str) -> Result<Vec<String>, String> {
    let value = match dict.get(key) {
        None => return Ok(vec![]),
        Some(value) => value,
    };
    let items = value
        .as_array()
        .ok_or_else(|| unexpected(key, "an array of strings", value))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| unexpected(key, "an array of strings", item))
        })
        .collect()
}

fn boolean(dict: &Dictionary, key: &str) -> Result<bool, String> {
    match dict.get(key) {
        None => Ok(false),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| unexpected(key, "a boolean", value)),
    }
}

fn dictionaries<'a>(dict: &'a Dictionary, key: &str) -> Result<Vec<&'a Dictionary>, String> {
    let value = match dict.get(key) {
        None => return Ok(vec![]),
        Some(value) => value,
    };
    let items = value
        .as_array()
        .ok_or_else(|| unexpected(key, "an array of objects", value))?;
    items
        .iter()
        .map(|item| {
            item.as_dictionary()
                .ok_or_else(|| unexpected(key, "an array of objects", item))
        })
        .collect()
}

fn environment(dict: &Dictionary) -> Result<Vec<(String, String)>, String> {
    let value = match dict.get("environment") {
        None => return Ok(vec![]),
        Some(value) => value,
    };
    let entries = value
        .as_dictionary()
        .ok_or_else(|| unexpected("environment", "an object", value))?;
    entries
        .iter()
        .map(|(name, value)| match value.as_str() {
            Some(v) => Ok((name.to_owned(), v.to_owned())),
            None => Err(unexpected(&format!("environment.{}", name), "a string", value)),
        })
        .collect()
}

fn dependency_info(dict: &Dictionary) -> Result<Vec<DependencyInfo>, String> {
    dictionaries(dict, "dependencyInfo")?
        .into_iter()
        .map(|entry| {
            let format = string(entry, "format")?
                .ok_or_else(|| "dependency info needs a 'format'".to_owned())?
                .parse::<DependencyInfoFormat>()
                .map_err(|e| e.to_string())?;
            let path =
                string(entry, "path")?.ok_or_else(|| "dependency info needs a 'path'".to_owned())?;
            Ok(DependencyInfo::new(format, path))
        })
        .collect()
}

fn chunk(entry: &Dictionary) -> Result<Chunk, String> {
    match (entry.get("data"), string(entry, "file")?) {
        (Some(Value::String(s)), None) => Ok(Chunk::Data(s.as_bytes().to_vec())),
        (Some(Value::Data(d)), None) => Ok(Chunk::Data(d.clone())),
        (None, Some(file)) => Ok(Chunk::File(file.to_owned())),
        _ => Err("a chunk has exactly one of 'data' or 'file'".to_owned()),
    }
}

fn auxiliary_files(dict: &Dictionary) -> Result<Vec<AuxiliaryFile>, String> {
    dictionaries(dict, "auxiliaryFiles")?
        .into_iter()
        .map(|entry| {
            let path =
                string(entry, "path")?.ok_or_else(|| "auxiliary file needs a 'path'".to_owned())?;
            let chunks = dictionaries(entry, "chunks")?
                .into_iter()
                .map(chunk)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(AuxiliaryFile::new(path, chunks, boolean(entry, "executable")?))
        })
        .collect()
}

fn invocation(value: &Value) -> Result<Invocation, String> {
    let dict = value
        .as_dictionary()
        .ok_or_else(|| format!("expected an object, got {}", value.kind()))?;
    if let Some(key) = dict.keys().find(|k| !KEYS.contains(k)) {
        return Err(format!("unknown key '{}'", key));
    }
    Ok(Invocation::new()
        .with_executable(Executable::determine(
            string(dict, "executable")?.unwrap_or(""),
        ))
        .with_arguments(strings(dict, "arguments")?)
        .with_environment(environment(dict)?)
        .with_working_directory(string(dict, "workingDirectory")?.unwrap_or(""))
        .with_inputs(strings(dict, "inputs")?)
        .with_outputs(strings(dict, "outputs")?)
        .with_phony_inputs(strings(dict, "phonyInputs")?)
        .with_input_dependencies(strings(dict, "inputDependencies")?)
        .with_order_dependencies(strings(dict, "orderDependencies")?)
        .with_dependency_info(dependency_info(dict)?)
        .with_auxiliary_files(auxiliary_files(dict)?)
        .with_log_message(string(dict, "logMessage")?.unwrap_or(""))
        .with_show_environment_in_log(boolean(dict, "showEnvironmentInLog")?)
        .with_creates_product_structure(boolean(dict, "createsProductStructure")?))
}

pub fn parse(contents: &[u8]) -> Result<Vec<Invocation>, ManifestError> {
    parse_with(&Json::new(), contents)
}

pub fn parse_with(format: &dyn Format, contents: &[u8]) -> Result<Vec<Invocation>, ManifestError> {
    let root = format.deserialize(contents)?;
    let items = root
        .as_array()
        .ok_or_else(|| ManifestError::NotAnArray(root.kind()))?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            invocation(item).map_err(|message| ManifestError::Invalid { index, message })
        })
        .collect()
}

pub fn load(fs: &dyn Filesystem, path: &str) -> Result<Vec<Invocation>, ManifestError> {
    let contents = fs.read_all(path).map_err(|source| ManifestError::Io {
        path: path.to_owned(),
        source,
    })?;
    parse_with(format_for(path), &contents)
}

/// Property list manifests are XML, anything else is JSON.
fn format_for(path: &str) -> &'static dyn Format {
    if path.ends_with(".plist") || path.ends_with(".xml") {
        &SimpleXml
    } else {
        &Json { pretty: false }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_full_invocation() {
        let manifest = br#"[
            {
                "executable": "/usr/bin/clang",
                "arguments": ["-c", "main.c", "-o", "main.o", "-MD", "-MF", "main.d"],
                "environment": {"LANG": "C"},
                "workingDirectory": "build",
                "inputs": ["main.c"],
                "outputs": ["main.o"],
                "phonyInputs": ["headers"],
                "inputDependencies": ["config.h"],
                "orderDependencies": ["gen.stamp"],
                "dependencyInfo": [{"format": "makefile", "path": "main.d"}],
                "auxiliaryFiles": [
                    {"path": "args.resp", "executable": false, "chunks": [{"data": "-O2 "}, {"file": "extra.resp"}]}
                ],
                "logMessage": "Compile main.c",
                "showEnvironmentInLog": true
            },
            {"executable": "builtin-create-build-directory", "arguments": ["App.app"],
             "outputs": ["App.app"], "createsProductStructure": true}
        ]"#;
        let invocations = parse(manifest).unwrap();
        assert_eq!(invocations.len(), 2);

        let compile = &invocations[0];
        assert_eq!(
            compile.executable(),
            Some(&Executable::external("/usr/bin/clang"))
        );
        assert_eq!(compile.environment()["LANG"], "C");
        assert_eq!(compile.working_directory(), "build");
        assert_eq!(compile.phony_inputs(), &["headers".to_owned()]);
        assert_eq!(
            compile.content_inputs().collect::<Vec<_>>(),
            vec!["main.c", "config.h"]
        );
        assert_eq!(compile.order_dependencies(), &["gen.stamp".to_owned()]);
        assert_eq!(
            compile.dependency_info(),
            &[DependencyInfo::new(DependencyInfoFormat::Makefile, "main.d")]
        );
        assert_eq!(
            compile.auxiliary_files()[0].chunks(),
            &[
                Chunk::Data(b"-O2 ".to_vec()),
                Chunk::File("extra.resp".to_owned())
            ]
        );
        assert_eq!(compile.description(), "Compile main.c");
        assert!(compile.show_environment_in_log());

        let mkdir = &invocations[1];
        assert_eq!(
            mkdir.executable(),
            Some(&Executable::builtin("create-build-directory"))
        );
        assert!(mkdir.creates_product_structure());
    }

    #[test]
    fn test_property_list_manifest() {
        let manifest = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0">
<array>
    <dict>
        <key>executable</key>
        <string>cc</string>
        <key>arguments</key>
        <array><string>-o</string><string>app</string><string>main.o</string></array>
        <key>inputs</key>
        <array><string>main.o</string></array>
        <key>outputs</key>
        <array><string>app</string></array>
        <key>auxiliaryFiles</key>
        <array>
            <dict>
                <key>path</key>
                <string>link.resp</string>
                <key>executable</key>
                <false/>
                <key>chunks</key>
                <array><dict><key>data</key><data>LWxt</data></dict></array>
            </dict>
        </array>
    </dict>
</array>
</plist>"#;
        let invocations = parse_with(&SimpleXml, manifest).unwrap();
        assert_eq!(invocations[0].command_line(), "cc -o app main.o");
        assert_eq!(
            invocations[0].auxiliary_files()[0].chunks(),
            &[Chunk::Data(b"-lm".to_vec())]
        );
        assert_eq!(format_for("build/manifest.plist").name(), "SimpleXML");
        assert_eq!(format_for("manifest.json").name(), "JSON");
    }

    #[test]
    fn test_empty_executable_runs_nothing() {
        let invocations = parse(br#"[{"outputs": ["marker"]}]"#).unwrap();
        assert_eq!(invocations[0].executable(), None);
    }

    #[test]
    fn test_errors() {
        insta::assert_snapshot!(
            parse(br#"{"outputs": []}"#).unwrap_err().to_string(),
            @"expected an array of invocations, got dictionary"
        );
        insta::assert_snapshot!(
            parse(br#"[{}, {"output": ["a"]}]"#).unwrap_err().to_string(),
            @"invocation 1: unknown key 'output'"
        );
        insta::assert_snapshot!(
            parse(br#"[{"inputs": "a.c"}]"#).unwrap_err().to_string(),
            @"invocation 0: 'inputs' must be an array of strings, got string"
        );
        insta::assert_snapshot!(
            parse(br#"[{"dependencyInfo": [{"format": "xml", "path": "a"}]}]"#)
                .unwrap_err()
                .to_string(),
            @"invocation 0: unknown dependency info format 'xml'"
        );
        insta::assert_snapshot!(
            parse(br#"[{"auxiliaryFiles": [{"path": "a", "chunks": [{}]}]}]"#)
                .unwrap_err()
                .to_string(),
            @"invocation 0: a chunk has exactly one of 'data' or 'file'"
        );
    }
}
