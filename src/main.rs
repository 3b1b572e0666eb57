use std::path::PathBuf;

use clap::{Parser, Subcommand};

use abc::commands;
use abc::commands::render::RenderOpts;
use abc::commands::upgrade::UpgradeOpts;

#[derive(Parser)]
#[command(
    name = "abc",
    about = "Render project templates and upgrade rendered installations"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a template into a destination directory
    Render {
        /// Template source (a local directory, possibly inside a git work tree)
        source: String,
        /// Destination directory (default: current directory)
        #[arg(long)]
        dest: Option<PathBuf>,
        /// Template input (KEY=VALUE); repeatable
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// YAML file of template inputs; repeatable, later files win
        #[arg(long = "input-file")]
        input_files: Vec<PathBuf>,
        /// Ask interactively for missing inputs
        #[arg(long)]
        prompt: bool,
        /// Accept unknown inputs and leave missing ones empty
        #[arg(long = "skip-input-validation")]
        skip_input_validation: bool,
        /// Keep temp directories for inspection
        #[arg(long = "keep-temp-dirs")]
        keep_temp_dirs: bool,
    },

    /// Upgrade every rendered installation under a directory
    Upgrade {
        /// Directory to crawl for installations (default: current directory)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Override the recorded template location for all installations
        #[arg(long = "template-location")]
        template_location: Option<String>,
        /// Protocol for git template sources
        #[arg(long = "git-protocol", default_value = "https")]
        git_protocol: String,
        /// Boolean expression selecting manifests (over their YAML fields)
        #[arg(long)]
        filter: Option<String>,
        /// Restart a halted run from this manifest
        #[arg(long = "resume-from")]
        resume_from: Option<PathBuf>,
        /// Reversal conflict you fixed by hand (relative path); repeatable
        #[arg(long = "already-resolved")]
        already_resolved: Vec<String>,
        /// Extra template input (KEY=VALUE); repeatable
        #[arg(long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,
        /// YAML file of template inputs; repeatable, later files win
        #[arg(long = "input-file")]
        input_files: Vec<PathBuf>,
        /// Ask interactively for inputs the new template version adds
        #[arg(long)]
        prompt: bool,
        /// Accept unknown inputs and leave missing ones empty
        #[arg(long = "skip-input-validation")]
        skip_input_validation: bool,
        /// Keep temp directories for inspection
        #[arg(long = "keep-temp-dirs")]
        keep_temp_dirs: bool,
        /// Request a specific template version instead of the upgrade channel
        #[arg(long)]
        version: Option<String>,
        /// Emit the report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Render {
            source,
            dest,
            inputs,
            input_files,
            prompt,
            skip_input_validation,
            keep_temp_dirs,
        } => commands::render::run(&RenderOpts {
            source,
            dest,
            inputs,
            input_files,
            prompt,
            skip_input_validation,
            keep_temp_dirs,
        })
        .map(|()| 0),

        Commands::Upgrade {
            cwd,
            template_location,
            git_protocol,
            filter,
            resume_from,
            already_resolved,
            inputs,
            input_files,
            prompt,
            skip_input_validation,
            keep_temp_dirs,
            version,
            json,
        } => commands::upgrade::run(&UpgradeOpts {
            cwd,
            template_location,
            git_protocol,
            filter,
            resume_from,
            already_resolved,
            inputs,
            input_files,
            prompt,
            skip_input_validation,
            keep_temp_dirs,
            version,
            json,
        }),
    };

    match exit_code {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
