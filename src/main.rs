use clap::{Parser, Subcommand};
use colored::Colorize;
use runlet::config::Config;
use runlet::sandbox::stdlib;
use runlet::tools::default_registry;
use runlet::{respond, ExecutionHost, ExecutionRequest};
use std::io::Read;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runlet")]
#[command(about = "Run a script snippet in a private working directory and report what it produced.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a snippet and print the result envelope
    Run {
        /// File holding the snippet (stdin when omitted)
        file: Option<PathBuf>,
        /// Snippet given inline
        #[arg(short, long, conflicts_with = "file")]
        code: Option<String>,
        /// Base directory for persisted files
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Where produced files should be copied
        #[arg(short, long)]
        output_path: Option<String>,
        /// Pretty-print the envelope
        #[arg(long)]
        pretty: bool,
    },
    /// Call a tool with JSON arguments
    Call {
        name: String,
        /// Arguments as a JSON object
        args: String,
    },
    /// List available tools
    Tools,
    /// List script bindings and whether they are enabled
    Bindings,
    /// Show configuration
    Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("runlet=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn read_snippet(file: Option<PathBuf>, code: Option<String>) -> Result<String, String> {
    if let Some(code) = code {
        return Ok(code);
    }
    match file {
        Some(path) => std::fs::read_to_string(&path)
            .map_err(|e| format!("failed to read {}: {}", path.display(), e)),
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .map_err(|e| format!("failed to read stdin: {}", e))?;
            Ok(buffer)
        }
    }
}

fn run(
    file: Option<PathBuf>,
    code: Option<String>,
    output_dir: Option<PathBuf>,
    output_path: Option<String>,
    pretty: bool,
) -> ExitCode {
    let cfg = Config::load();
    let code = match read_snippet(file, code) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {}", "Error:".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let mut request = ExecutionRequest::new(code);
    if let Some(dir) = output_dir.or_else(|| cfg.output_base_dir()) {
        request = request.with_output_base_dir(dir);
    }
    if let Some(path) = output_path {
        request = request.with_output_path(path);
    }

    let host = ExecutionHost::from_config(&cfg);
    let result = respond(&host, &request);
    println!("{}", result.to_json_string(pretty));
    if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            code,
            output_dir,
            output_path,
            pretty,
        } => run(file, code, output_dir, output_path, pretty),
        Commands::Call { name, args } => {
            let cfg = Config::load();
            let args: serde_json::Value = match serde_json::from_str(&args) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("{} invalid JSON arguments: {}", "Error:".red(), e);
                    return ExitCode::FAILURE;
                }
            };
            match default_registry(&cfg).call(&name, args) {
                Ok(output) => {
                    println!("{}", output);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("{} {}", "Error:".red(), e);
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Tools => {
            let cfg = Config::load();
            let registry = default_registry(&cfg);
            println!("{}", "Available tools:".bold());
            println!();
            for tool in registry.list() {
                println!("  {} - {}", tool.name().cyan(), tool.description());
            }
            ExitCode::SUCCESS
        }
        Commands::Bindings => {
            let cfg = Config::load();
            let enabled = ExecutionHost::from_config(&cfg).capabilities().binding_names();
            let compiled = runlet::bindings::Capabilities::detect().binding_names();
            println!("{}", "Standard modules:".bold());
            for name in stdlib::MODULES {
                println!("  {}", name.cyan());
            }
            println!();
            println!("{}", "Libraries:".bold());
            for name in compiled {
                let state = if enabled.contains(&name) {
                    "enabled".green()
                } else {
                    "disabled".dimmed()
                };
                println!("  {} - {}", name.cyan(), state);
            }
            ExitCode::SUCCESS
        }
        Commands::Config => {
            let config = Config::load();
            println!("{}", "Current configuration:".bold());
            if let Some(path) = Config::default_path() {
                println!("{}", path.display().to_string().dimmed());
            }
            println!();
            match config.to_toml() {
                Ok(s) => println!("{}", s),
                Err(e) => eprintln!("Error serializing config: {}", e),
            }
            ExitCode::SUCCESS
        }
    }
}
