//! Command line parsing

use anyhow::{Context, bail};
use serde_json::Value;
use stagecraft_core::pipeline::{IsolationOptions, OutputMap};
use std::path::PathBuf;

/// Parsed invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run(RunArgs),
    Resolve(ResolveArgs),
    Health,
    Help,
    Version,
}

/// `stagecraft run`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunArgs {
    pub command_file: PathBuf,
    pub inputs: OutputMap,
    /// `--only a,b`
    pub only: Option<Vec<String>>,
    pub mocks: OutputMap,
    pub skip_validation: bool,
    pub force_required: bool,
}

impl RunArgs {
    /// Whether any option asks for a partial run
    pub fn is_isolated(&self) -> bool {
        self.only.is_some() || !self.mocks.is_empty() || self.skip_validation || self.force_required
    }

    pub fn isolation_options(&self) -> IsolationOptions {
        IsolationOptions {
            stages: self.only.clone(),
            skip_validation: self.skip_validation,
            mock_inputs: self.mocks.clone(),
            force_required: self.force_required,
        }
    }
}

/// `stagecraft resolve`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolveArgs {
    pub description: String,
    pub files: Vec<String>,
    pub dependencies: Vec<String>,
    pub detailed: bool,
}

/// Parse `key=value`; the value is read as JSON when it parses, as a
/// plain string otherwise
fn parse_assignment(raw: &str, flag: &str) -> anyhow::Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("{} expects key=value, got '{}'", flag, raw))?;
    if key.is_empty() {
        bail!("{} expects key=value, got '{}'", flag, raw);
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn next_value<'a>(
    args: &mut impl Iterator<Item = &'a String>,
    flag: &str,
) -> anyhow::Result<&'a String> {
    args.next()
        .with_context(|| format!("{} requires a value", flag))
}

fn parse_run<'a>(mut args: impl Iterator<Item = &'a String>) -> anyhow::Result<RunArgs> {
    let mut run = RunArgs::default();
    let mut command_file = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--input" | "-i" => {
                let (key, value) = parse_assignment(next_value(&mut args, arg)?, arg)?;
                run.inputs.insert(key, value);
            }
            "--mock" => {
                let (key, value) = parse_assignment(next_value(&mut args, arg)?, arg)?;
                run.mocks.insert(key, value);
            }
            "--only" => {
                let stages: Vec<String> = next_value(&mut args, arg)?
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect();
                run.only.get_or_insert_with(Vec::new).extend(stages);
            }
            "--skip-validation" => run.skip_validation = true,
            "--force-required" => run.force_required = true,
            flag if flag.starts_with('-') => bail!("Unknown option for run: {}", flag),
            path if command_file.is_none() => command_file = Some(PathBuf::from(path)),
            extra => bail!("Unexpected argument: {}", extra),
        }
    }

    run.command_file = command_file.context("run requires a command file")?;
    Ok(run)
}

fn parse_resolve<'a>(mut args: impl Iterator<Item = &'a String>) -> anyhow::Result<ResolveArgs> {
    let mut resolve = ResolveArgs::default();
    let mut words = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--file" | "-f" => resolve.files.push(next_value(&mut args, arg)?.clone()),
            "--dep" | "-d" => resolve.dependencies.push(next_value(&mut args, arg)?.clone()),
            "--detailed" => resolve.detailed = true,
            flag if flag.starts_with('-') => bail!("Unknown option for resolve: {}", flag),
            word => words.push(word),
        }
    }

    if words.is_empty() {
        bail!("resolve requires a task description");
    }
    resolve.description = words.join(" ");
    Ok(resolve)
}

/// Parse arguments, excluding the program name
pub fn parse_args(args: &[String]) -> anyhow::Result<Command> {
    if args
        .iter()
        .any(|a| a == "--help" || a == "-h")
    {
        return Ok(Command::Help);
    }

    let mut iter = args.iter();
    match iter.next().map(String::as_str) {
        None => Ok(Command::Help),
        Some("--version" | "-v") => Ok(Command::Version),
        Some("run") => parse_run(iter).map(Command::Run),
        Some("resolve") => parse_resolve(iter).map(Command::Resolve),
        Some("health") => Ok(Command::Health),
        Some(other) => bail!("Unknown command: {}", other),
    }
}

/// Print help message
pub fn print_help() {
    println!("stagecraft - multi-stage LLM pipelines with dynamic agent selection");
    println!();
    println!("Usage:");
    println!("  stagecraft run <command-file> [options]   Run a command pipeline");
    println!("      --input, -i key=value                  Initial input (JSON or text)");
    println!("      --only a,b                             Run only these stages");
    println!("      --mock stage.key=value                 Output for a stage left out");
    println!("      --skip-validation                      Skip static pipeline checks");
    println!("      --force-required                       Keep required flags in partial runs");
    println!("  stagecraft resolve <description> [options] Pick an agent for a task");
    println!("      --file, -f path                        Affected file (repeatable)");
    println!("      --dep, -d name                         Dependency (repeatable)");
    println!("      --detailed                             Print the full analysis");
    println!("  stagecraft health                          Check resolver configuration");
    println!("  stagecraft --help                          Show this help message");
    println!("  stagecraft --version                       Show version");
    println!();
    println!("Configuration is read from ./stagecraft.toml when present.");
    println!("Cached stage outputs are kept in memory and last for one invocation.");
    println!();
    println!("Environment Variables:");
    println!("  LLM_API_KEY                  API key (required for run)");
    println!("  LLM_MODEL                    Model name");
    println!("  LLM_PROVIDER                 Provider: claude or openai (default: claude)");
    println!("  LLM_BASE_URL                 Custom API endpoint");
    println!("  STAGECRAFT_CONFIDENCE_FLOOR  Resolver confidence floor (default: 0.6)");
    println!("  STAGECRAFT_HARD_FLOOR        Resolver hard floor (default: 0.3)");
    println!("  STAGECRAFT_FALLBACK_AGENT    Fallback agent (default: general-purpose)");
    println!("  RUST_LOG                     Log filter (default: info)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_top_level() {
        assert_eq!(parse_args(&[]).unwrap(), Command::Help);
        assert_eq!(parse_args(&args("--version")).unwrap(), Command::Version);
        assert_eq!(parse_args(&args("health")).unwrap(), Command::Health);
        assert_eq!(parse_args(&args("run x.yaml --help")).unwrap(), Command::Help);
        assert!(parse_args(&args("deploy")).is_err());
    }

    #[test]
    fn test_run_args() {
        let parsed = parse_args(&args(
            "run review.yaml --input diff=patch --input count=3 --only analyze,report --mock fetch.page=\"cached\" --force-required",
        ))
        .unwrap();

        let Command::Run(run) = parsed else {
            panic!("expected run");
        };
        assert_eq!(run.command_file, PathBuf::from("review.yaml"));
        assert_eq!(run.inputs["diff"], json!("patch"));
        assert_eq!(run.inputs["count"], json!(3));
        assert_eq!(run.only, Some(vec!["analyze".to_string(), "report".to_string()]));
        assert_eq!(run.mocks["fetch.page"], json!("cached"));
        assert!(run.force_required);
        assert!(!run.skip_validation);
        assert!(run.is_isolated());
    }

    #[test]
    fn test_run_errors() {
        assert!(parse_args(&args("run")).is_err());
        assert!(parse_args(&args("run a.yaml b.yaml")).is_err());
        assert!(parse_args(&args("run a.yaml --input novalue")).is_err());
        assert!(parse_args(&args("run a.yaml --input")).is_err());
        assert!(parse_args(&args("run a.yaml --verbose")).is_err());

        let Command::Run(run) = parse_args(&args("run a.yaml")).unwrap() else {
            panic!("expected run");
        };
        assert!(!run.is_isolated());
    }

    #[test]
    fn test_resolve_args() {
        let Command::Resolve(resolve) = parse_args(&args(
            "resolve Add a Terraform module --file infra/main.tf --dep terraform --detailed",
        ))
        .unwrap() else {
            panic!("expected resolve");
        };

        assert_eq!(resolve.description, "Add a Terraform module");
        assert_eq!(resolve.files, vec!["infra/main.tf"]);
        assert_eq!(resolve.dependencies, vec!["terraform"]);
        assert!(resolve.detailed);

        assert!(parse_args(&args("resolve --detailed")).is_err());
    }
}
