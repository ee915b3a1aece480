//! Command-line argument parsing for pbxwatch

/// Parsed command line flags
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Args {
    pub once: bool,
    pub validate: bool,
    pub debug: bool,
    pub dry_run: bool,
    pub help: bool,
    /// Flags we did not recognise, reported as warnings
    pub unknown: Vec<String>,
}

pub fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    parse_args_from(&args)
}

/// Parse an argv-style list; the first element is the program name.
pub fn parse_args_from(args: &[String]) -> Args {
    let mut result = Args::default();

    for arg in args.iter().skip(1) {
        match arg.as_str() {
            "--once" => result.once = true,
            "--validate" => result.validate = true,
            "--debug" | "-d" => result.debug = true,
            "--dry-run" => result.dry_run = true,
            "--help" | "-h" => result.help = true,
            other => result.unknown.push(other.to_string()),
        }
    }

    result
}

pub fn print_help() {
    println!("pbxwatch - MikoPBX extension and trunk watcher\n");
    println!("USAGE:");
    println!("    pbxwatch [OPTIONS]\n");
    println!("OPTIONS:");
    println!("    --once          Run a single poll cycle and exit");
    println!("    --validate      Validate configuration and exit");
    println!("    --debug, -d     Log every PBX request and response");
    println!("    --dry-run       Log notifications instead of posting to Discord");
    println!("    --help, -h      Show this help message\n");
    println!("ENVIRONMENT:");
    println!("    MIKOPBX_BASE_URL, MIKOPBX_LOGIN, MIKOPBX_PASSWORD");
    println!("    DISCORD_TOKEN, DISCORD_CHANNEL_ID, DISCORD_API_BASE");
    println!("    POLL_INTERVAL_SEC, FETCH_DEADLINE_SEC, HTTP_TIMEOUT_SEC");
    println!("    HEALTH_PORT, PBX_DEBUG");
}
