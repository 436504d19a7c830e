use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use gitsip::config::{self, RepoRules};
use gitsip::mirror::Mirror;
use gitsip::sparse;
use gitsip::transport::SshTransport;

/// Keep sparse local mirrors of remote Git repositories current.
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Mirror table: tab-separated `<repo> <pattern> <output>` rows
    #[arg(short, long)]
    config: PathBuf,

    /// Cache directory for object stores and working trees
    #[arg(short = 'o', long)]
    cache: Option<PathBuf>,

    /// Branch to track when a repository is seen for the first time
    #[arg(short, long, default_value = "master")]
    branch: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let cache_dir = match cli.cache {
        Some(dir) => dir,
        None => {
            let home = std::env::var("HOME").context("HOME is not set and --cache was not given")?;
            PathBuf::from(home).join(".cache/gitsip")
        }
    };

    let table = fs::read_to_string(&cli.config)
        .with_context(|| format!("reading mirror table '{}'", cli.config.display()))?;
    let repos = config::parse(&table);
    anyhow::ensure!(
        !repos.is_empty(),
        "mirror table '{}' has no usable rows",
        cli.config.display()
    );

    let mut failures = 0usize;
    for repo in &repos {
        match pull_repo(repo, &cli.branch, &cache_dir) {
            Ok(changed) => {
                info!(repo = %repo.url, changed, "mirror run complete");
            }
            Err(err) => {
                error!(repo = %repo.url, %err, "mirror run failed");
                failures += 1;
            }
        }
    }

    anyhow::ensure!(
        failures == 0,
        "{failures} of {} repositories failed",
        repos.len()
    );
    Ok(())
}

fn pull_repo(repo: &RepoRules, branch: &str, cache_dir: &Path) -> anyhow::Result<bool> {
    let mut mirror = Mirror::open(&repo.url, branch, cache_dir)?;
    let mut transport = SshTransport::new(&mirror.domain, &mirror.name, &mirror.socket);

    let patterns: Vec<String> = repo.rules.iter().map(|rule| rule.pattern.clone()).collect();
    let report = mirror.pull(&mut transport, &patterns)?;

    for rule in &repo.rules {
        deliver(&report.files, rule);
    }
    Ok(report.changed)
}

/// Copy the files a rule matched to its configured output location: a single
/// match goes to the output path itself, several matches into it as a
/// directory.
fn deliver(files: &[(String, PathBuf)], rule: &config::Rule) {
    let matched: Vec<&(String, PathBuf)> = files
        .iter()
        .filter(|(virtual_path, _)| sparse::path_matches(virtual_path, &rule.pattern))
        .collect();

    for (virtual_path, source) in &matched {
        let dest = if matched.len() == 1 {
            rule.output.clone()
        } else {
            match Path::new(virtual_path).file_name() {
                Some(file_name) => rule.output.join(file_name),
                None => continue,
            }
        };
        let copied = dest
            .parent()
            .map(fs::create_dir_all)
            .unwrap_or(Ok(()))
            .and_then(|()| fs::copy(source, &dest));
        if let Err(err) = copied {
            error!(from = %source.display(), to = %dest.display(), %err, "failed to deliver file");
        }
    }
}
