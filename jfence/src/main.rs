use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use classfence::policy;
use classfence::Transformer;

/// Rewrites class files under the built-in capability policy, the same way
/// the agent does at load time. Mostly useful for inspecting and debugging
/// the rewriter's output with javap.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(value_name = "CLASSES", required = true)]
    class_files: Vec<PathBuf>,

    /// Caller module the classes are treated as belonging to
    #[arg(short, long, default_value = "app")]
    module: String,

    /// Use an empty rule set instead of the built-in catalog (round-trip
    /// verification: output must be byte-identical or absent)
    #[arg(long)]
    allow_all: bool,

    /// Skip the reflective-lookup rewrites
    #[arg(long)]
    no_reflection: bool,

    /// Directory for rewritten classes; defaults to `<name>.out.class` next
    /// to each input
    #[arg(short, long)]
    dump_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp(None)
        .format_target(false)
        .parse_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    let args = Args::parse();
    let modules: Vec<&str> = vec![&args.module];
    let rules = if args.allow_all {
        classfence::rules::RuleSet::default()
    } else {
        policy::default_policy(&modules, !args.no_reflection)
            .context("building the built-in rule set")?
    };
    let transformer =
        Transformer::new(Arc::new(rules)).reflection_rewrites(!args.no_reflection);

    let mut failed = 0usize;
    for path in &args.class_files {
        if let Err(error) = process(&transformer, &args, path) {
            log::error!("{}: {error:#}", path.display());
            failed += 1;
        }
    }
    if failed > 0 {
        anyhow::bail!("{failed} class file(s) failed");
    }
    Ok(())
}

fn process(transformer: &Transformer, args: &Args, path: &PathBuf) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    match transformer.transform(&args.module, &bytes) {
        Ok(None) => {
            log::info!("{}: unchanged", path.display());
            Ok(())
        }
        Ok(Some(rewritten)) => {
            let out = match &args.dump_dir {
                Some(dir) => {
                    fs::create_dir_all(dir)?;
                    dir.join(path.file_name().context("class file has no name")?)
                }
                None => path.with_extension("out.class"),
            };
            fs::write(&out, &rewritten)
                .with_context(|| format!("writing {}", out.display()))?;
            log::info!(
                "{}: rewritten ({} -> {} bytes) -> {}",
                path.display(),
                bytes.len(),
                rewritten.len(),
                out.display()
            );
            Ok(())
        }
        Err(error) if error.can_ignore() => {
            log::warn!(
                "{}: left untouched ({error})",
                path.display()
            );
            Ok(())
        }
        Err(error) => Err(error).context("transforming"),
    }
}
