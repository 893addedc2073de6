//! testpick - Run only the specs your monorepo changes touch
//!
//! testpick looks at what changed in git (unstaged, staged, and committed since
//! a base ref), maps those files to `*.spec.ts` files in the owning Nx projects,
//! and runs just those specs through `nx test`, remembering how each one did.

mod output;

use clap::{Parser, Subcommand};
use eyre::{Result, WrapErr};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use testpick::cache::RunCache;
use testpick::changes::{DetectOptions, detect_changed_files};
use testpick::config::{Config, NxJson, resolve_base_ref};
use testpick::nx::NxCli;
use testpick::orchestrator::{
    NxLauncher, Orchestrator, OrchestratorOptions, OutputStream, RunEvent, RunRequest,
};
use testpick::projects::ProjectIndex;
use testpick::workspace::{
    LoadOptions, Selection, WorkspaceState, absolutize, group_by_owner, load_workspace_state,
    select_runs,
};
use testpick::{default_config_path, find_workspace_root, load_config, load_config_or_default};
use testpick_core::Project;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Run only the specs your changes touch
#[derive(Parser, Debug)]
#[command(name = "testpick")]
#[command(version)]
#[command(about = "Run only the specs your monorepo changes touch", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Where to start looking for nx.json (default: current directory)
    #[arg(long, global = true, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Path to config file (default: .config/testpick/config.json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List projects and their test runners
    Projects,

    /// List changed files
    Changed {
        /// Base ref for committed changes
        #[arg(long, value_name = "REF")]
        base: Option<String>,
        /// Don't fetch the base branch first
        #[arg(long)]
        skip_fetch: bool,
    },

    /// Show changed specs per project, with their last results
    Status {
        /// Base ref for committed changes
        #[arg(long, value_name = "REF")]
        base: Option<String>,
        /// Don't fetch the base branch first
        #[arg(long)]
        skip_fetch: bool,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Run specs
    Run {
        /// Run this project's specs
        #[arg(short, long, value_name = "NAME")]
        project: Option<String>,
        /// Only specs whose own file changed (all projects unless --project is given)
        #[arg(long)]
        changed: bool,
        /// Re-run specs that failed last time
        #[arg(long, conflicts_with_all = ["project", "changed"])]
        failed: bool,
        /// Collect coverage
        #[arg(long)]
        coverage: bool,
        /// Base ref for committed changes
        #[arg(long, value_name = "REF")]
        base: Option<String>,
        /// Don't fetch the base branch first
        #[arg(long)]
        skip_fetch: bool,
        /// Spec files to run
        #[arg(value_name = "SPEC", conflicts_with_all = ["project", "changed", "failed"])]
        specs: Vec<PathBuf>,
    },

    /// Inspect or clear the run cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// List cached results
    Show,
    /// Forget all cached results for this workspace
    Clear,
    /// Print the cache file location
    Path,
}

/// `--verbose` or `verbose: true` in the config file.
fn verbose_enabled(flag: bool, config: &Config) -> bool {
    flag || config.verbose
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "testpick=debug"
    } else {
        "testpick=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let cwd = std::env::current_dir().wrap_err("Failed to get current directory")?;
    let start = args.root.clone().unwrap_or_else(|| cwd.clone());
    let root = find_workspace_root(&start)?;
    // git reports canonical paths; keep ours comparable
    let root = std::fs::canonicalize(&root).unwrap_or(root);

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => load_config_or_default(&default_config_path(&root)),
    };
    let verbose = verbose_enabled(args.verbose, &config);
    init_tracing(verbose);
    debug!(root = %root.display(), "workspace root");

    let ctx = Context {
        root,
        cwd,
        config,
        verbose,
    };

    match args.command {
        Command::Projects => ctx.projects().await,
        Command::Changed { base, skip_fetch } => ctx.changed(base, skip_fetch).await,
        Command::Status {
            base,
            skip_fetch,
            json,
        } => ctx.status(base, skip_fetch, json).await,
        Command::Run {
            project,
            changed,
            failed,
            coverage,
            base,
            skip_fetch,
            specs,
        } => {
            let all_passed = ctx
                .run(RunArgs {
                    project,
                    changed,
                    failed,
                    coverage,
                    base,
                    skip_fetch,
                    specs,
                })
                .await?;
            if !all_passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Cache { action } => ctx.cache(action).await,
    }
}

struct RunArgs {
    project: Option<String>,
    changed: bool,
    failed: bool,
    coverage: bool,
    base: Option<String>,
    skip_fetch: bool,
    specs: Vec<PathBuf>,
}

struct Context {
    root: PathBuf,
    cwd: PathBuf,
    config: Config,
    verbose: bool,
}

impl Context {
    async fn index(&self) -> ProjectIndex {
        ProjectIndex::new(NxCli::resolve(&self.root).await, &self.config)
    }

    async fn base_ref(&self, cli: Option<&str>) -> String {
        let nx = NxJson::load(&self.root).await;
        resolve_base_ref(cli, &self.config, &nx)
    }

    async fn load_cache(&self) -> Result<RunCache> {
        let mut cache = RunCache::new(&self.root)?;
        cache.load().await;
        Ok(cache)
    }

    async fn load_state(&self, base: Option<String>, skip_fetch: bool) -> Result<WorkspaceState> {
        let options = LoadOptions {
            workspace_root: self.root.clone(),
            base_ref: self.base_ref(base.as_deref()).await,
            skip_fetch: skip_fetch || self.config.skip_fetch,
            verbose: self.verbose,
        };
        let index = self.index().await;
        load_workspace_state(&index, &options, |msg| debug!("{}", msg)).await
    }

    async fn projects(&self) -> Result<()> {
        let projects = self.index().await.discover(&self.root).await;
        print!("{}", output::render_projects(&projects, &self.root));
        Ok(())
    }

    async fn changed(&self, base: Option<String>, skip_fetch: bool) -> Result<()> {
        let base_ref = self.base_ref(base.as_deref()).await;
        let files = detect_changed_files(DetectOptions {
            cwd: &self.root,
            base_ref: &base_ref,
            skip_fetch: skip_fetch || self.config.skip_fetch,
            verbose: self.verbose,
        })
        .await?;
        print!("{}", output::render_changed(&files, &base_ref));
        Ok(())
    }

    async fn status(&self, base: Option<String>, skip_fetch: bool, json: bool) -> Result<()> {
        let (state, cache) = tokio::try_join!(self.load_state(base, skip_fetch), self.load_cache())?;
        if json {
            println!("{}", output::render_status_json(&state, &cache)?);
        } else {
            print!("{}", output::render_status(&state, &cache));
        }
        Ok(())
    }

    async fn cache(&self, action: CacheAction) -> Result<()> {
        let mut cache = self.load_cache().await?;
        match action {
            CacheAction::Show => print!("{}", output::render_cache(&cache)),
            CacheAction::Path => println!("{}", cache.path().display()),
            CacheAction::Clear => {
                let count = cache.stats().entries;
                cache.clear();
                cache.save().await?;
                eprintln!(
                    "{} Cleared {} cached results",
                    "OK".green().bold(),
                    count
                );
            }
        }
        Ok(())
    }

    /// Specs that failed on their last recorded run and still exist.
    fn last_failed(&self, cache: &RunCache) -> Vec<PathBuf> {
        cache
            .entries()
            .filter(|(_, m)| !m.passed())
            .map(|(rel, _)| self.root.join(rel))
            .filter(|p| p.is_file())
            .collect()
    }

    fn requests_for_specs(&self, projects: &[Project], specs: &[PathBuf]) -> Vec<RunRequest> {
        let (requests, unowned) = group_by_owner(projects, specs);
        for spec in &unowned {
            warn!("no project owns {}, skipping", spec.display());
        }
        requests
    }

    /// Returns whether every run passed.
    async fn run(&self, args: RunArgs) -> Result<bool> {
        let cache = self.load_cache().await?;

        let requests = if !args.specs.is_empty() || args.failed {
            let specs: Vec<PathBuf> = if args.failed {
                self.last_failed(&cache)
            } else {
                args.specs
                    .iter()
                    .map(|s| absolutize(&self.root, &self.cwd, s))
                    .collect()
            };
            let projects = self.index().await.discover(&self.root).await;
            self.requests_for_specs(&projects, &specs)
        } else {
            let selection = match args.project {
                Some(name) => Selection::Project {
                    name,
                    changed_only: args.changed,
                },
                None if args.changed => Selection::AllChanged,
                None => eyre::bail!(
                    "Nothing to run: pass --project, --changed, --failed or spec paths"
                ),
            };
            let state = self.load_state(args.base, args.skip_fetch).await?;
            select_runs(&state, &selection)?
        };

        if requests.is_empty() {
            eprintln!("{} No specs to run", "->".blue().bold());
            return Ok(true);
        }

        let orchestrator = Orchestrator::new(
            self.root.clone(),
            Arc::new(Mutex::new(cache)),
            Arc::new(NxLauncher {
                coverage: args.coverage || self.config.coverage,
            }),
            OrchestratorOptions::from(&self.config),
        );

        let mut all_passed = true;
        for request in requests {
            eprintln!(
                "{} Running {} spec(s) in {}",
                "->".blue().bold(),
                request.specs.len(),
                request.project.cyan()
            );
            let (passed, cancelled) = self.run_one(&orchestrator, request).await?;
            all_passed &= passed;
            if cancelled {
                break;
            }
        }
        Ok(all_passed)
    }

    /// Returns (passed, cancelled).
    async fn run_one(&self, orchestrator: &Orchestrator, request: RunRequest) -> Result<(bool, bool)> {
        let mut events = orchestrator.subscribe();
        let handle = orchestrator.start_run(request)?;

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut cancelled = false;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(RunEvent::Started { command, .. }) => {
                        eprintln!("{} {}", "$".dimmed(), command.dimmed());
                    }
                    Ok(RunEvent::Output { stream: OutputStream::Stdout, line }) => println!("{line}"),
                    Ok(RunEvent::Output { stream: OutputStream::Stderr, line }) => eprintln!("{line}"),
                    Ok(RunEvent::Finished(_)) | Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "output fell behind, some lines were dropped");
                    }
                },
                _ = &mut ctrl_c, if !cancelled => {
                    cancelled = true;
                    eprintln!("\n{} Cancelling...", "!".yellow().bold());
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move { orchestrator.cancel().await });
                }
            }
        }

        let summary = handle.wait().await?;
        print!(
            "{}",
            output::render_run_summary(&summary, &self.root, self.verbose)
        );
        Ok((summary.succeeded(), cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_file_turns_on_verbose() {
        let quiet = Config::default();
        let loud = Config {
            verbose: true,
            ..Config::default()
        };
        assert!(!verbose_enabled(false, &quiet));
        assert!(verbose_enabled(true, &quiet));
        assert!(verbose_enabled(false, &loud));
    }
}
