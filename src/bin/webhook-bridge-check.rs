use std::process;
use std::sync::Arc;

use arrrg::CommandLine;
use arrrg_derive::CommandLine;

use webhook_bridge::cli_utils::exit_with_usage_error;
use webhook_bridge::{BridgeContext, Config, InMemorySink, compile_routes, create_bridge_router};

const USAGE: &str = "USAGE: webhook-bridge-check [--verbose] <file>...";

#[derive(CommandLine, Default, PartialEq, Eq)]
struct Options {
    #[arrrg(flag, "Enable verbose output showing pass/fail for each file")]
    verbose: bool,
}

/// Every problem found in one configuration file.
fn check(path: &str) -> Vec<String> {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => return vec![e.to_string()],
    };

    let (_, problems) = compile_routes(&config);
    let mut problems: Vec<String> = problems.iter().map(ToString::to_string).collect();

    let context = Arc::new(BridgeContext::new(config, Arc::new(InMemorySink::new())));
    if let Err(e) = create_bridge_router(context) {
        problems.push(e.to_string());
    }
    problems
}

fn main() {
    let (options, free) = Options::from_command_line(USAGE);

    if free.is_empty() {
        exit_with_usage_error("no configuration files given", USAGE);
    }

    let mut all_valid = true;

    for path in &free {
        let problems = check(path);
        if problems.is_empty() {
            if options.verbose {
                println!("{} pass", path);
            }
            continue;
        }
        all_valid = false;
        if options.verbose {
            println!("{} fail", path);
            for problem in &problems {
                println!("    {}", problem);
            }
        }
    }

    if all_valid {
        process::exit(0);
    } else {
        process::exit(1);
    }
}
