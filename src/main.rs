use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell as CompletionShell;
use rootstrap::cloud::{GcpCloud, OperationPolicy, TerraformCloud, TERRAFORM_CLOUD_URL};
use rootstrap::config::{self, Layout, Prerequisites, Setup, ToolConfig};
use rootstrap::{Orchestrator, RunReport, SetupError, TemplateSet, VariableMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to tool config file (default: rootstrap.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the organization setup YAML (default: setup_file of the tool config)
    #[arg(long, global = true)]
    setup: Option<PathBuf>,

    /// YAML file overriding the built-in layout, key by key
    #[arg(long, global = true)]
    overrides: Option<PathBuf>,

    /// Domain of the organization, used for the Terraform Cloud audience
    #[arg(long, global = true, env = "ORGANIZATION_DOMAIN")]
    organization_domain: Option<String>,

    /// Terraform Cloud organization allowed to impersonate the builder
    #[arg(long, global = true, env = "TFC_ORGANIZATION")]
    tfc_organization: Option<String>,

    /// Terraform Cloud project holding the workspaces
    #[arg(long, global = true, env = "TFC_WORKSPACE_PROJECT")]
    tfc_workspace_project: Option<String>,

    /// Terraform Cloud API token, needed by `build` for the variable sets
    #[arg(long, global = true, env = "TFC_TOKEN", hide_env_values = true)]
    tfc_token: Option<String>,

    /// Terraform Cloud address
    #[arg(long, global = true, env = "TFC_URL", default_value = TERRAFORM_CLOUD_URL)]
    tfc_url: String,

    /// Enable debug output, including per-field diffs
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the configuration and print what would be reconciled
    Show,
    /// Set the organization IAM policy for the top-level groups
    Init,
    /// Reconcile the executive and builder custom roles
    Roles,
    /// Build the root project, federation, builder account, folder, tags and
    /// the Terraform Cloud variable sets
    Build,
    /// Generate shell completion script
    Completion {
        /// Shell to generate completions for: bash, zsh, fish, powershell
        shell: String,
        /// Install the completion script to the default location for the shell
        #[arg(long)]
        install: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(Commands::Completion { shell, install }) = &cli.command {
        return match run_completion(shell, *install) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("❌ {:#}", e);
                ExitCode::FAILURE
            }
        };
    }

    println!("rootstrap v{} (built {})", env!("CARGO_PKG_VERSION"), env!("BUILD_DATE"));
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("❌ {:#}", e);
            let code = e.downcast_ref::<SetupError>().map_or(1, SetupError::exit_code);
            ExitCode::from(code as u8)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose {
            "debug".to_string()
        } else {
            std::env::var("ROOTSTRAP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
        };
        EnvFilter::new(format!("rootstrap={},reqwest=warn,hyper=warn", level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Everything a command needs before the first remote call.
struct RunContext {
    tool: ToolConfig,
    layout: Layout,
    templates: TemplateSet,
    vars: VariableMap,
}

fn load_context(cli: &Cli) -> anyhow::Result<RunContext> {
    let tool = ToolConfig::load(cli.config.as_deref()).context("loading tool config")?;
    let setup_path = cli.setup.clone().unwrap_or_else(|| PathBuf::from(&tool.setup_file));
    let setup = load_setup(&setup_path)?;

    let prerequisites = Prerequisites {
        organization_domain: cli.organization_domain.clone(),
        tfc_organization: cli.tfc_organization.clone(),
        tfc_workspace_project: cli.tfc_workspace_project.clone(),
    }
    .resolve(&setup)?;

    let layout = Layout::load(cli.overrides.as_deref()).context("loading layout")?;
    let templates = TemplateSet::load(tool.template_dir.as_deref().map(Path::new)).context("loading templates")?;
    let vars = config::variables(&setup, &layout, &prerequisites);
    Ok(RunContext { tool, layout, templates, vars })
}

fn load_setup(path: &Path) -> anyhow::Result<Setup> {
    let content = fs::read_to_string(path).with_context(|| format!("failed to read setup file '{}'", path.display()))?;
    match Setup::parse(&content) {
        Ok(setup) => Ok(setup),
        Err(e) => {
            print_yaml_error_context(&content, e.inner());
            Err(config::setup_error(path, &e).into())
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(command) = &cli.command else {
        let _ = Cli::command().print_help();
        println!();
        return Ok(());
    };

    let ctx = load_context(&cli)?;
    if let Commands::Show = command {
        print_plan(&ctx);
        return Ok(());
    }

    let terraform = match command {
        Commands::Build => Some(connect_terraform(&cli, &ctx)?),
        _ => None,
    };
    let operations = OperationPolicy {
        period: ctx.tool.operation_period(),
        timeout: ctx.tool.operation_timeout(),
    };
    let cloud = GcpCloud::connect(ctx.tool.request_timeout(), operations).context("connecting to Google Cloud")?;
    let mut orchestrator = Orchestrator::new(&cloud, &ctx.templates, &ctx.layout);
    if let Some(terraform) = &terraform {
        orchestrator = orchestrator.with_terraform(terraform);
    }

    let report = match command {
        Commands::Init => orchestrator.init(ctx.vars).await.context("init failed")?,
        Commands::Roles => orchestrator.roles(ctx.vars).await.context("roles failed")?,
        Commands::Build => orchestrator.build(ctx.vars).await.context("build failed")?,
        Commands::Show | Commands::Completion { .. } => return Ok(()),
    };
    print_report(&report);
    Ok(())
}

fn connect_terraform(cli: &Cli, ctx: &RunContext) -> anyhow::Result<TerraformCloud> {
    let token = cli.tfc_token.as_deref().filter(|t| !t.is_empty()).ok_or_else(|| SetupError::MissingPrerequisite {
        names: vec!["TFC_TOKEN".to_string()],
    })?;
    let organization = ctx.vars.get_str(rootstrap::vars::TFC_ORGANIZATION).unwrap_or_default();
    TerraformCloud::connect(ctx.tool.request_timeout(), &cli.tfc_url, token, organization)
        .context("connecting to Terraform Cloud")
}

fn print_plan(ctx: &RunContext) {
    println!("\nResolved variables:");
    println!("--------------------------------------------------");
    for name in ctx.vars.names() {
        let value = ctx.vars.get(name).map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        });
        println!("  {:<28} {}", name, value.unwrap_or_default());
    }
    println!("--------------------------------------------------");
    println!("\nTemplates: {}", ctx.templates.names().collect::<Vec<_>>().join(", "));
    println!("\n`init` sets the organization IAM policy.");
    println!("`roles` reconciles {} and {}.", ctx.layout.executive_role.id, ctx.layout.builder_role.id);
    println!(
        "`build` reconciles project {}, pool {}, provider {}, account {}, folder {} and tag {}/{}.",
        ctx.vars.get_str(rootstrap::vars::ROOT_PROJECT_ID).unwrap_or_default(),
        ctx.layout.organization_pool.id,
        ctx.layout.terraform_provider.id,
        ctx.layout.builder_account.id,
        ctx.layout.workspace_folder.display_name,
        ctx.layout.root_tag.key,
        ctx.layout.root_tag.value,
    );
    println!(
        "        then variable sets {} and {} in Terraform Cloud.",
        ctx.layout.credentials_variable_set.name, ctx.layout.organization_variable_set.name,
    );
}

fn print_report(report: &RunReport) {
    println!("\n{:<28} {:<28} {}", "STEP", "KIND", "OUTCOME");
    for step in &report.steps {
        println!("{:<28} {:<28} {}", step.name, step.kind.as_str(), step.outcome);
    }
    println!("\n✅ Done.");
}

fn print_yaml_error_context(content: &str, err: &serde_yaml::Error) {
    if let Some(location) = err.location() {
        let line_idx = location.line().saturating_sub(1);
        let lines: Vec<&str> = content.lines().collect();

        if line_idx < lines.len() {
            eprintln!("\nError context (line {}):", line_idx + 1);
            eprintln!("--------------------------------------------------");

            let start = line_idx.saturating_sub(2);
            let end = usize::min(lines.len() - 1, line_idx + 2);

            for (i, line) in lines.iter().enumerate().take(end + 1).skip(start) {
                let marker = if i == line_idx { ">>" } else { "  " };
                eprintln!("{} {:4} | {}", marker, i + 1, line);
            }
            eprintln!("--------------------------------------------------\n");
        }
    }
}

fn run_completion(shell_str: &str, install: bool) -> anyhow::Result<()> {
    use clap_complete::generate;
    use std::str::FromStr;

    let shell = CompletionShell::from_str(shell_str)
        .map_err(|_| anyhow::anyhow!("Unknown shell '{}'. Supported shells: bash, zsh, fish, powershell", shell_str))?;

    let mut cmd = Cli::command();
    let bin_name = "rootstrap";

    if install {
        let (path, post_install_msg) = completion_install_path(shell)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        generate(shell, &mut cmd, bin_name, &mut file);
        println!("Completion script installed to: {}", path.display());
        if let Some(msg) = post_install_msg {
            println!("{}", msg);
        }
    } else {
        generate(shell, &mut cmd, bin_name, &mut std::io::stdout());
    }

    Ok(())
}

fn completion_install_path(shell: CompletionShell) -> anyhow::Result<(PathBuf, Option<String>)> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "~".to_string());
    let (path, msg): (PathBuf, Option<String>) = match shell {
        CompletionShell::Bash => (
            PathBuf::from(format!("{}/.local/share/bash-completion/completions/rootstrap", home)),
            Some("Ensure bash-completion is installed and sourced in your ~/.bashrc".to_string()),
        ),
        CompletionShell::Zsh => (
            PathBuf::from(format!("{}/.zsh/completions/_rootstrap", home)),
            Some("Add ~/.zsh/completions to your fpath in ~/.zshrc:\n  fpath=(~/.zsh/completions $fpath)\n  autoload -Uz compinit && compinit".to_string()),
        ),
        CompletionShell::Fish => (PathBuf::from(format!("{}/.config/fish/completions/rootstrap.fish", home)), None),
        CompletionShell::PowerShell => {
            let userprofile = std::env::var("USERPROFILE").unwrap_or_else(|_| home.clone());
            (
                PathBuf::from(format!(r"{}\Documents\PowerShell\Completions\rootstrap.ps1", userprofile)),
                Some("Add to your $PROFILE:\n  . \"$env:USERPROFILE\\Documents\\PowerShell\\Completions\\rootstrap.ps1\"".to_string()),
            )
        }
        _ => anyhow::bail!("Unsupported shell: {:?}", shell),
    };
    Ok((path, msg))
}
