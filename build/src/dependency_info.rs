/*
 * Copyright 2020 Nikhil Marathe <nsm.nikhil@gmail.com>
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Readers for the files tools write to report what they actually read.

use std::{io, str};

use thiserror::Error;

use pbx_interface::Filesystem;
use pbx_invocation::{DependencyInfo, DependencyInfoFormat};
use pbx_metrics::scoped_metric;
use pbx_paths::join;

#[derive(Error, Debug)]
pub enum DependencyInfoError {
    #[error("reading {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("{path}: {message}")]
    Malformed { path: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredDependencies {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    /// Paths the tool looked for and did not find.
    pub missing: Vec<String>,
}

impl DiscoveredDependencies {
    fn resolve(self, working_directory: &str) -> DiscoveredDependencies {
        let all = |paths: Vec<String>| -> Vec<String> {
            paths
                .into_iter()
                .map(|p| join(working_directory, &p))
                .collect()
        };
        DiscoveredDependencies {
            inputs: all(self.inputs),
            outputs: all(self.outputs),
            missing: all(self.missing),
        }
    }
}

fn push_unique(list: &mut Vec<String>, path: String) {
    if !list.contains(&path) {
        list.push(path);
    }
}

/// Reads one dependency info file. Relative paths, both of the file and inside it, are taken
/// relative to `working_directory`.
pub fn read(
    fs: &dyn Filesystem,
    info: &DependencyInfo,
    working_directory: &str,
) -> Result<DiscoveredDependencies, DependencyInfoError> {
    scoped_metric!("dependency_info");
    let path = join(working_directory, info.path());
    let io_error = |source| DependencyInfoError::Io {
        path: path.clone(),
        source,
    };
    let parsed = match info.format() {
        DependencyInfoFormat::Directory => DiscoveredDependencies {
            inputs: walk_directory(fs, &path).map_err(io_error)?,
            ..Default::default()
        },
        format => {
            let contents = fs.read_all(&path).map_err(io_error)?;
            let parsed = if format == DependencyInfoFormat::Binary {
                parse_binary(&contents)
            } else {
                parse_makefile(&contents)
            };
            parsed.map_err(|message| DependencyInfoError::Malformed {
                path: path.clone(),
                message,
            })?
        }
    };
    Ok(parsed.resolve(working_directory))
}

/// Every file below `root`, sorted.
pub fn walk_directory(fs: &dyn Filesystem, root: &str) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_owned()];
    while let Some(directory) = pending.pop() {
        let mut names = Vec::new();
        fs.enumerate_directory(&directory, &mut |name| names.push(name.to_owned()))?;
        let mut subdirectories = Vec::new();
        for name in names {
            let path = join(&directory, &name);
            if fs.is_directory(&path) {
                subdirectories.push(path);
            } else {
                files.push(path);
            }
        }
        pending.extend(subdirectories);
    }
    files.sort();
    Ok(files)
}

/// Opcode records, each one byte followed by a NUL terminated path.
pub fn parse_binary(contents: &[u8]) -> Result<DiscoveredDependencies, String> {
    const VERSION: u8 = 0x00;
    const INPUT: u8 = 0x10;
    const MISSING: u8 = 0x11;
    const OUTPUT: u8 = 0x40;

    let mut result = DiscoveredDependencies::default();
    let mut pos = 0;
    while pos < contents.len() {
        let opcode = contents[pos];
        pos += 1;
        let len = contents[pos..]
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| format!("unterminated record at offset {}", pos - 1))?;
        let operand = str::from_utf8(&contents[pos..pos + len])
            .map_err(|e| format!("record at offset {}: {}", pos - 1, e))?
            .to_owned();
        pos += len + 1;
        match opcode {
            VERSION => {}
            INPUT => push_unique(&mut result.inputs, operand),
            MISSING => push_unique(&mut result.missing, operand),
            OUTPUT => push_unique(&mut result.outputs, operand),
            other => return Err(format!("unknown opcode {:#04x}", other)),
        }
    }
    Ok(result)
}

#[derive(Default)]
struct Rule {
    targets: Vec<String>,
    dependencies: Vec<String>,
    has_colon: bool,
}

/// Make style `target...: dependency...` rules.
pub fn parse_makefile(contents: &[u8]) -> Result<DiscoveredDependencies, String> {
    let text = str::from_utf8(contents).map_err(|e| e.to_string())?;
    let mut result = DiscoveredDependencies::default();
    let mut rule = Rule::default();
    let mut token = String::new();
    let mut line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some('\n') => {
                    chars.next();
                    line += 1;
                    finish_token(&mut rule, &mut token);
                }
                Some('\r') => {
                    chars.next();
                    if chars.peek() == Some(&'\n') {
                        chars.next();
                    }
                    line += 1;
                    finish_token(&mut rule, &mut token);
                }
                Some(' ') | Some('#') | Some(':') | Some('\\') => {
                    if let Some(escaped) = chars.next() {
                        token.push(escaped);
                    }
                }
                _ => token.push('\\'),
            },
            '$' if chars.peek() == Some(&'$') => {
                chars.next();
                token.push('$');
            }
            ':' if !rule.has_colon
                && matches!(chars.peek(), None | Some(' ') | Some('\t') | Some('\n') | Some('\r')) =>
            {
                finish_token(&mut rule, &mut token);
                if rule.targets.is_empty() {
                    return Err(format!("line {}: rule without targets", line));
                }
                rule.has_colon = true;
            }
            ' ' | '\t' | '\r' => finish_token(&mut rule, &mut token),
            '\n' => {
                finish_token(&mut rule, &mut token);
                finish_rule(&mut result, std::mem::take(&mut rule), line)?;
                line += 1;
            }
            c => token.push(c),
        }
    }
    finish_token(&mut rule, &mut token);
    finish_rule(&mut result, rule, line)?;
    Ok(result)
}

fn finish_token(rule: &mut Rule, token: &mut String) {
    if token.is_empty() {
        return;
    }
    let token = std::mem::take(token);
    if rule.has_colon {
        rule.dependencies.push(token);
    } else {
        rule.targets.push(token);
    }
}

fn finish_rule(result: &mut DiscoveredDependencies, rule: Rule, line: usize) -> Result<(), String> {
    if !rule.has_colon {
        if rule.targets.is_empty() {
            return Ok(());
        }
        return Err(format!("line {}: expected ':'", line));
    }
    // Empty rules naming headers (`cc -MP`) keep deleted headers from breaking make.
    if rule.dependencies.is_empty() && rule.targets.iter().all(|t| result.inputs.contains(t)) {
        return Ok(());
    }
    for target in rule.targets {
        push_unique(&mut result.outputs, target);
    }
    for dependency in rule.dependencies {
        push_unique(&mut result.inputs, dependency);
    }
    Ok(())
}
