//! The work-unit document: its grammar, its parsed shape, and the
//! `${NAME}` placeholder substitution rule shared by filename resolution
//! and command templating.
//!
//! The grammar itself is treated as an external collaborator (some
//! upstream system hands us a `Workunit`); this module supplies a concrete
//! line-oriented grammar so the rest of the workspace has something real
//! to parse and round-trip in tests.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A `FILE`/`EXECFILE` entry: a (possibly `${ARCH}`-templated) filename and
/// its expected SHA-1 checksum, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub filename: String,
    pub sha1: String,
}

/// The parsed form of a work-unit document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workunit {
    pub wuid: String,
    pub files: Vec<FileRef>,
    pub execfiles: Vec<FileRef>,
    pub commands: Vec<String>,
    pub results: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("work-unit text has no WORKUNIT line")]
    MissingId,
    #[error("work-unit text declares more than one WORKUNIT id")]
    DuplicateId,
    #[error("malformed {section} line {line:?}: expected {expected}")]
    Malformed {
        section: &'static str,
        line: String,
        expected: &'static str,
    },
    #[error("unrecognized section keyword {0:?}")]
    UnknownSection(String),
}

impl Workunit {
    /// Parse a work-unit document.
    ///
    /// Grammar: one `WORKUNIT <id>` line, then any number of
    /// `FILE <name> <sha1>`, `EXECFILE <name> <sha1>`, `COMMAND <text>`, and
    /// `RESULT <name>` lines, in any order. Blank lines and `#`-prefixed
    /// lines are ignored. `COMMAND` takes the remainder of the line
    /// verbatim (it may itself contain whitespace-separated arguments).
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut wuid: Option<String> = None;
        let mut files = Vec::new();
        let mut execfiles = Vec::new();
        let mut commands = Vec::new();
        let mut results = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();
            match keyword {
                "WORKUNIT" => {
                    if rest.is_empty() {
                        return Err(ParseError::Malformed {
                            section: "WORKUNIT",
                            line: raw_line.to_string(),
                            expected: "WORKUNIT <id>",
                        });
                    }
                    if wuid.is_some() {
                        return Err(ParseError::DuplicateId);
                    }
                    wuid = Some(rest.to_string());
                }
                "FILE" | "EXECFILE" => {
                    let (name, sha1) = rest.split_once(char::is_whitespace).ok_or(
                        ParseError::Malformed {
                            section: keyword,
                            line: raw_line.to_string(),
                            expected: "FILE <name> <sha1>",
                        },
                    )?;
                    let entry = FileRef {
                        filename: name.trim().to_string(),
                        sha1: sha1.trim().to_lowercase(),
                    };
                    if keyword == "FILE" {
                        files.push(entry);
                    } else {
                        execfiles.push(entry);
                    }
                }
                "COMMAND" => {
                    if rest.is_empty() {
                        return Err(ParseError::Malformed {
                            section: "COMMAND",
                            line: raw_line.to_string(),
                            expected: "COMMAND <shell text>",
                        });
                    }
                    commands.push(rest.to_string());
                }
                "RESULT" => {
                    if rest.is_empty() {
                        return Err(ParseError::Malformed {
                            section: "RESULT",
                            line: raw_line.to_string(),
                            expected: "RESULT <name>",
                        });
                    }
                    results.push(rest.to_string());
                }
                other => return Err(ParseError::UnknownSection(other.to_string())),
            }
        }

        Ok(Workunit {
            wuid: wuid.ok_or(ParseError::MissingId)?,
            files,
            execfiles,
            commands,
            results,
        })
    }

    /// All FILE and EXECFILE entries, in declaration order, the order the
    /// client is expected to materialize them in.
    pub fn all_file_refs(&self) -> impl Iterator<Item = &FileRef> {
        self.files.iter().chain(self.execfiles.iter())
    }
}

/// `${NAME}` placeholder substitution: replace names found in `vars`,
/// leave unrecognized `${...}` tokens (and bare `$`) untouched. Mirrors
/// Python's `string.Template.safe_substitute`.
pub fn safe_substitute(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(dollar) = rest.find("${") {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 2..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                out.push_str("${");
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_full_document() {
        let text = "\
            WORKUNIT W1\n\
            FILE data.bin aaaa1111\n\
            EXECFILE prog${ARCH} bbbb2222\n\
            COMMAND ${WORKDIR}/prog${ARCH} --in ${DLDIR}/data.bin\n\
            RESULT out.txt\n";
        let wu = Workunit::parse(text).unwrap();
        assert_eq!(wu.wuid, "W1");
        assert_eq!(wu.files, vec![FileRef { filename: "data.bin".into(), sha1: "aaaa1111".into() }]);
        assert_eq!(wu.execfiles[0].filename, "prog${ARCH}");
        assert_eq!(wu.commands.len(), 1);
        assert_eq!(wu.results, vec!["out.txt".to_string()]);
    }

    #[test]
    fn missing_id_is_an_error() {
        let err = Workunit::parse("FILE a.txt deadbeef\n").unwrap_err();
        assert!(matches!(err, ParseError::MissingId));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# a comment\n\nWORKUNIT W2\n\n# another\nCOMMAND echo hi\n";
        let wu = Workunit::parse(text).unwrap();
        assert_eq!(wu.wuid, "W2");
        assert_eq!(wu.commands, vec!["echo hi".to_string()]);
    }

    #[test]
    fn safe_substitute_leaves_unknown_tokens_literal() {
        let vars = vars(&[("ARCH", "x86_64")]);
        assert_eq!(safe_substitute("prog${ARCH}", &vars), "progx86_64");
        assert_eq!(safe_substitute("${UNKNOWN}-x", &vars), "${UNKNOWN}-x");
        assert_eq!(safe_substitute("no placeholders", &vars), "no placeholders");
    }

    #[test]
    fn safe_substitute_empty_value_for_missing_arch() {
        let vars = vars(&[("ARCH", "")]);
        assert_eq!(safe_substitute("prog${ARCH}", &vars), "prog");
    }
}
