//! A single tool run and everything the engine needs to know to order it, decide whether it is
//! up to date and prepare the disk for it.

use std::{collections::HashMap, fmt::Display, str::FromStr};

use thiserror::Error;

mod auxiliary;
pub use auxiliary::{AuxiliaryFile, Chunk};

/// Raw executable strings starting with this marker name an in-process tool.
pub const BUILTIN_PREFIX: &str = "builtin-";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Executable {
    /// A relative or absolute path to a program.
    External(String),
    /// A tool implemented by the engine itself. Never touches the filesystem to resolve.
    Builtin(String),
}

impl Executable {
    pub fn external<S: Into<String>>(path: S) -> Executable {
        Executable::External(path.into())
    }

    pub fn builtin<S: Into<String>>(name: S) -> Executable {
        Executable::Builtin(name.into())
    }

    /// Classifies a raw executable string. An empty string means the invocation runs nothing,
    /// which is valid for auxiliary-file-only and marker invocations.
    pub fn determine(raw: &str) -> Option<Executable> {
        if let Some(name) = raw.strip_prefix(BUILTIN_PREFIX) {
            Some(Executable::Builtin(name.to_owned()))
        } else if raw.is_empty() {
            None
        } else {
            Some(Executable::External(raw.to_owned()))
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, Executable::Builtin(_))
    }
}

impl Display for Executable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Executable::External(path) => write!(f, "{}", path),
            Executable::Builtin(name) => write!(f, "{}{}", BUILTIN_PREFIX, name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DependencyInfoFormat {
    /// ld64 style records: opcode byte then a NUL terminated path.
    Binary,
    /// Every file below the declared directory.
    Directory,
    /// make style `target: deps` rules.
    Makefile,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown dependency info format '{0}'")]
pub struct UnknownFormatError(String);

impl FromStr for DependencyInfoFormat {
    type Err = UnknownFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(DependencyInfoFormat::Binary),
            "directory" => Ok(DependencyInfoFormat::Directory),
            "makefile" => Ok(DependencyInfoFormat::Makefile),
            e => Err(UnknownFormatError(e.to_owned())),
        }
    }
}

impl Display for DependencyInfoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DependencyInfoFormat::Binary => "binary",
            DependencyInfoFormat::Directory => "directory",
            DependencyInfoFormat::Makefile => "makefile",
        };
        write!(f, "{}", name)
    }
}

/// A dependency file the tool is expected to write while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyInfo {
    format: DependencyInfoFormat,
    path: String,
}

impl DependencyInfo {
    pub fn new<S: Into<String>>(format: DependencyInfoFormat, path: S) -> DependencyInfo {
        DependencyInfo {
            format,
            path: path.into(),
        }
    }

    pub fn format(&self) -> DependencyInfoFormat {
        self.format
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

fn strings<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    executable: Option<Executable>,
    arguments: Vec<String>,
    environment: HashMap<String, String>,
    working_directory: String,

    inputs: Vec<String>,
    outputs: Vec<String>,
    phony_inputs: Vec<String>,

    input_dependencies: Vec<String>,
    order_dependencies: Vec<String>,

    dependency_info: Vec<DependencyInfo>,
    auxiliary_files: Vec<AuxiliaryFile>,

    log_message: String,
    show_environment_in_log: bool,

    creates_product_structure: bool,
}

impl Invocation {
    pub fn new() -> Invocation {
        Invocation::default()
    }

    pub fn with_executable(mut self, executable: Option<Executable>) -> Self {
        self.executable = executable;
        self
    }

    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = strings(arguments);
        self
    }

    pub fn with_environment<I, K, V>(mut self, environment: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = environment
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn with_working_directory<S: Into<String>>(mut self, directory: S) -> Self {
        self.working_directory = directory.into();
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = strings(inputs);
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = strings(outputs);
        self
    }

    pub fn with_phony_inputs<I, S>(mut self, phony_inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.phony_inputs = strings(phony_inputs);
        self
    }

    pub fn with_input_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_dependencies = strings(dependencies);
        self
    }

    pub fn with_order_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order_dependencies = strings(dependencies);
        self
    }

    pub fn with_dependency_info<I>(mut self, dependency_info: I) -> Self
    where
        I: IntoIterator<Item = DependencyInfo>,
    {
        self.dependency_info = dependency_info.into_iter().collect();
        self
    }

    pub fn with_auxiliary_files<I>(mut self, auxiliary_files: I) -> Self
    where
        I: IntoIterator<Item = AuxiliaryFile>,
    {
        self.auxiliary_files = auxiliary_files.into_iter().collect();
        self
    }

    pub fn with_log_message<S: Into<String>>(mut self, message: S) -> Self {
        self.log_message = message.into();
        self
    }

    pub fn with_show_environment_in_log(mut self, show: bool) -> Self {
        self.show_environment_in_log = show;
        self
    }

    pub fn with_creates_product_structure(mut self, creates: bool) -> Self {
        self.creates_product_structure = creates;
        self
    }

    pub fn executable(&self) -> Option<&Executable> {
        self.executable.as_ref()
    }

    pub fn arguments(&self) -> &[String] {
        &self.arguments
    }

    pub fn environment(&self) -> &HashMap<String, String> {
        &self.environment
    }

    pub fn working_directory(&self) -> &str {
        &self.working_directory
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Inputs that may not exist, or may be generated by another invocation.
    pub fn phony_inputs(&self) -> &[String] {
        &self.phony_inputs
    }

    pub fn input_dependencies(&self) -> &[String] {
        &self.input_dependencies
    }

    pub fn order_dependencies(&self) -> &[String] {
        &self.order_dependencies
    }

    pub fn dependency_info(&self) -> &[DependencyInfo] {
        &self.dependency_info
    }

    pub fn auxiliary_files(&self) -> &[AuxiliaryFile] {
        &self.auxiliary_files
    }

    pub fn log_message(&self) -> &str {
        &self.log_message
    }

    pub fn show_environment_in_log(&self) -> bool {
        self.show_environment_in_log
    }

    pub fn creates_product_structure(&self) -> bool {
        self.creates_product_structure
    }

    /// The first output. Persisted state is keyed by it.
    pub fn primary_output(&self) -> Option<&str> {
        self.outputs.first().map(String::as_str)
    }

    /// Shell-like rendering of the executable and arguments, used in logs and to notice command
    /// changes between runs.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.arguments.len() + 1);
        if let Some(executable) = &self.executable {
            parts.push(quote(&executable.to_string()));
        }
        parts.extend(self.arguments.iter().map(|a| quote(a)));
        parts.join(" ")
    }

    /// `inputs ∪ input_dependencies`, the paths whose content decides staleness.
    pub fn content_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .chain(self.input_dependencies.iter())
            .map(String::as_str)
    }

    /// A short name for logs: the log message, else the primary output, else the command.
    pub fn description(&self) -> String {
        if !self.log_message.is_empty() {
            self.log_message.clone()
        } else if let Some(output) = self.primary_output() {
            output.to_owned()
        } else {
            self.command_line()
        }
    }
}

fn quote(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_owned();
    }
    if arg
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '\'' | '"' | '\\' | '$' | '`'))
    {
        format!("'{}'", arg.replace('\'', "'\\''"))
    } else {
        arg.to_owned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_determine() {
        assert_eq!(
            Executable::determine("builtin-copy"),
            Some(Executable::Builtin("copy".to_owned()))
        );
        assert_eq!(
            Executable::determine("/usr/bin/clang"),
            Some(Executable::External("/usr/bin/clang".to_owned()))
        );
        assert_eq!(
            Executable::determine("clang"),
            Some(Executable::External("clang".to_owned()))
        );
        assert_eq!(Executable::determine(""), None);
    }

    #[test]
    fn test_builtin_display_round_trips_through_determine() {
        let exe = Executable::builtin("create-build-directory");
        assert_eq!(exe.to_string(), "builtin-create-build-directory");
        assert_eq!(Executable::determine(&exe.to_string()), Some(exe));
    }

    #[test]
    fn test_format_names() {
        assert_eq!(
            "makefile".parse::<DependencyInfoFormat>(),
            Ok(DependencyInfoFormat::Makefile)
        );
        assert_eq!(
            "xml".parse::<DependencyInfoFormat>(),
            Err(UnknownFormatError("xml".to_owned()))
        );
        assert_eq!(DependencyInfoFormat::Binary.to_string(), "binary");
    }

    #[test]
    fn test_command_line_quotes() {
        let invocation = Invocation::new()
            .with_executable(Executable::determine("/bin/sh"))
            .with_arguments(vec!["-c", "echo it's done"]);
        assert_eq!(
            invocation.command_line(),
            "/bin/sh -c 'echo it'\\''s done'"
        );
    }

    #[test]
    fn test_description_fallbacks() {
        let marker = Invocation::new();
        assert_eq!(marker.description(), "");
        let with_output = Invocation::new().with_outputs(vec!["/out/a.o"]);
        assert_eq!(with_output.description(), "/out/a.o");
        let with_message = with_output.with_log_message("CompileC a.o");
        assert_eq!(with_message.description(), "CompileC a.o");
    }

    #[test]
    fn test_content_inputs_exclude_order_and_phony() {
        let invocation = Invocation::new()
            .with_inputs(vec!["a.c"])
            .with_input_dependencies(vec!["gen.h"])
            .with_order_dependencies(vec!["dir"])
            .with_phony_inputs(vec!["marker"]);
        let inputs: Vec<&str> = invocation.content_inputs().collect();
        assert_eq!(inputs, vec!["a.c", "gen.h"]);
    }
}
