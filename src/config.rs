//! The mirror table: a tab-separated file with a header row, one rule per
//! line. Columns: repository URL, path pattern inside the repository, output
//! location. Blank lines and `#` comments are ignored; rows are grouped by
//! repository in first-seen order.

use std::path::PathBuf;

use tracing::{error, warn};

/// One row of the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub pattern: String,
    pub output: PathBuf,
}

/// All rules for one repository, in file order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRules {
    pub url: String,
    pub rules: Vec<Rule>,
}

/// Parse the table. Bad rows are reported and dropped; the remainder is
/// still usable.
pub fn parse(text: &str) -> Vec<RepoRules> {
    let mut repos: Vec<RepoRules> = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let number = index + 1;
        if number == 1 || line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let mut fields = line.split('\t').map(str::trim);
        let (Some(url), Some(pattern), Some(output)) =
            (fields.next(), fields.next(), fields.next())
        else {
            error!(line = number, "missing fields in mirror table row");
            continue;
        };
        if url.is_empty() || pattern.is_empty() || output.is_empty() {
            error!(line = number, "missing fields in mirror table row");
            continue;
        }
        if let Some(extra) = fields.next() {
            if !extra.is_empty() {
                warn!(line = number, extra, "extra text in mirror table row");
            }
        }
        if pattern.contains("..") || output.contains("..") {
            error!(line = number, "paths may not contain '..'");
            continue;
        }

        let rule = Rule {
            pattern: pattern.to_string(),
            output: PathBuf::from(output),
        };
        match repos.iter_mut().find(|repo| repo.url == url) {
            Some(repo) => repo.rules.push(rule),
            None => repos.push(RepoRules {
                url: url.to_string(),
                rules: vec![rule],
            }),
        }
    }

    repos
}
