use std::future::Future;
use std::io::IsTerminal;

use clap::Parser;
use facet::Facet;
use indicatif::ProgressBar;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use mockmox::cli::{
    Cli, Command, GroupCommand, ListTarget, TemplateArgs, TemplateCommand, VmCommand,
};
use mockmox::config::{self, Config};
use mockmox::error::MoxError;
use mockmox::flow::{CreateRequest, Orchestrator, ReconcileReport};
use mockmox::gateway::LibvirtGateway;
use mockmox::group::{Group, GroupRegistry};
use mockmox::instance::Instance;
use mockmox::logging;
use mockmox::paths::Layout;
use mockmox::registry::InstanceRegistry;
use mockmox::template::{Template, TemplateMetadata, TemplateRegistry};
use mockmox::vm_state::VmState;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let terminal_filter = if cli.verbose {
        EnvFilter::new("mockmox=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("mockmox=warn"))
    };
    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures mockmox=debug, discards until the base dir is known
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("mockmox=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let mut config = config::load_config(&cli.config)?;
    if let Some(uri) = cli.libvirtd.filter(|uri| !uri.trim().is_empty()) {
        config.libvirtd = uri;
    }
    let layout = Layout::new(config.base_dir());

    if matches!(cli.command, Command::Install) {
        layout.ensure()?;
        activate_file_log(&file_handle, &layout);
        tracing::info!(base = %layout.base().display(), "layout installed");
        link_script(&config);
        println!("Installed mockmox layout under {}", layout.base().display());
        return Ok(());
    }

    if !layout.base().is_dir() {
        let missing = MoxError::NotFound {
            kind: "base directory",
            name: layout.base().display().to_string(),
        };
        return Err(miette::Report::new(missing)
            .wrap_err("mockmox is not installed, run `mockmox install`"));
    }
    activate_file_log(&file_handle, &layout);

    let json = cli.json;
    match cli.command {
        Command::Install => unreachable!(),
        Command::Template { action } => run_template(action, &layout, json).await?,
        Command::Group { action } => run_group(action, &layout, json)?,
        Command::List {
            what: ListTarget::Templates,
        } => {
            let templates = TemplateRegistry::scan(layout)?;
            print_templates(&templates.list(), json);
        }
        Command::List {
            what: ListTarget::Groups,
        } => {
            let groups = GroupRegistry::open(layout)?;
            print_groups(&groups.list()?, json);
        }
        command => {
            let gateway = LibvirtGateway::new(config.libvirtd.clone());
            let orch = Orchestrator::new(config, gateway)?;
            let report = orch.reconcile().await?;
            if matches!(command, Command::Reconcile) {
                print_report(&report, json);
            } else {
                warn_about(&report);
                run_instance_command(command, &orch, json).await?;
            }
        }
    }

    Ok(())
}

/// Point `script_location` at this binary unless something is already there.
fn link_script(config: &Config) {
    let target = std::path::Path::new(&config.directories.script_location);
    if target.symlink_metadata().is_ok() {
        tracing::debug!(path = %target.display(), "script location already taken");
        return;
    }
    let linked = std::env::current_exe().and_then(|exe| std::os::unix::fs::symlink(exe, target));
    match linked {
        Ok(()) => tracing::info!(path = %target.display(), "linked control script"),
        Err(e) => tracing::warn!(path = %target.display(), "could not link control script: {e}"),
    }
}

fn activate_file_log(handle: &logging::DeferredFileHandle, layout: &Layout) {
    let path = layout.logs_dir().join(logging::LOG_FILE);
    if let Err(e) = handle.set_file(&path) {
        tracing::warn!(path = %path.display(), "file logging disabled: {e}");
    }
}

async fn run_template(action: TemplateCommand, layout: &Layout, json: bool) -> miette::Result<()> {
    let templates = TemplateRegistry::scan(layout.clone())?;
    match action {
        TemplateCommand::List => print_templates(&templates.list(), json),
        TemplateCommand::Import {
            name,
            disk,
            meta,
            disk_size,
        } => {
            let mut meta = metadata(meta);
            meta.disk_gb = disk_size;
            let template = with_spinner(
                json,
                format!("Importing {}...", disk.display()),
                templates.import(&name, &disk, meta),
            )
            .await?;
            print_templates(std::slice::from_ref(&template), json);
        }
        TemplateCommand::Create { name, disk, meta } => {
            let template = templates.create_blank(&name, disk, metadata(meta))?;
            print_templates(std::slice::from_ref(&template), json);
        }
        TemplateCommand::Delete { name } => {
            let instances = InstanceRegistry::open(layout.clone())?;
            let groups = GroupRegistry::open(layout.clone())?;
            templates.remove(&name, &instances, &groups).await?;
            if !json {
                println!("Template '{name}' deleted.");
            }
        }
        TemplateCommand::AddFile { name, source, slot } => {
            let dest = templates
                .add_file(&name, &source, slot.user, slot.kind)
                .await?;
            if !json {
                println!(
                    "Added {} '{}' to template '{name}' for {}.",
                    slot.kind.as_str(),
                    dest.display(),
                    slot.user.as_str()
                );
            }
        }
        TemplateCommand::RemoveFile { name, file, slot } => {
            templates
                .remove_file(&name, &file, slot.user, slot.kind)
                .await?;
            if !json {
                println!("Removed {} '{file}' from template '{name}'.", slot.kind.as_str());
            }
        }
        TemplateCommand::ListFiles { name, slot } => {
            let files: Vec<String> = templates
                .list_files(&name, slot.user, slot.kind)
                .await?
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            print_names(&files, json);
        }
        TemplateCommand::AddKey { name, key, user } => {
            templates.add_ssh_key(&name, &key, &user).await?;
            if !json {
                println!("Installed SSH key for '{user}' in template '{name}'.");
            }
        }
        TemplateCommand::RemoveKey { name, user } => {
            templates.remove_ssh_key(&name, &user).await?;
            if !json {
                println!("Removed SSH key for '{user}' from template '{name}'.");
            }
        }
        TemplateCommand::ListKeys { name } => {
            print_names(&templates.ssh_key_users(&name).await?, json);
        }
    }
    Ok(())
}

fn run_group(action: GroupCommand, layout: &Layout, json: bool) -> miette::Result<()> {
    let groups = GroupRegistry::open(layout.clone())?;
    match action {
        GroupCommand::Create { name } => print_group(&groups.create(&name)?, json),
        GroupCommand::Delete { name } => {
            groups.delete(&name)?;
            if !json {
                println!("Group '{name}' deleted.");
            }
        }
        GroupCommand::Add { template, group } => {
            let templates = TemplateRegistry::scan(layout.clone())?;
            print_group(&groups.add(&group, &template, &templates)?, json);
        }
        GroupCommand::Remove { template, group } => {
            print_group(&groups.remove(&group, &template)?, json);
        }
        GroupCommand::Show { name } => print_group(&groups.get(&name)?, json),
    }
    Ok(())
}

fn metadata(args: TemplateArgs) -> TemplateMetadata {
    TemplateMetadata {
        os: args.os,
        cpus: args.cpus,
        memory_mb: args.memory,
        disk_gb: None,
    }
}

async fn run_instance_command(
    command: Command,
    orch: &Orchestrator<LibvirtGateway>,
    json: bool,
) -> miette::Result<()> {
    match command {
        Command::Install
        | Command::Template { .. }
        | Command::Group { .. }
        | Command::Reconcile => unreachable!(),
        Command::List { what } => {
            let mut instances = orch.list().await?;
            if what == ListTarget::Suspended {
                instances.retain(|i| i.state == VmState::Suspended);
            }
            print_instances(&instances, json);
        }
        Command::Vm { action } => match action {
            VmCommand::Create {
                template,
                name,
                cpus,
                memory,
                disk,
            } => {
                let req = CreateRequest {
                    template,
                    name,
                    cpus,
                    memory_mb: memory,
                    disk_gb: disk,
                };
                let msg = format!("Provisioning '{}'...", req.name);
                let instance = with_spinner(json, msg, orch.create(req)).await?;
                print_instance(&instance, json);
            }
            VmCommand::Start { name } => {
                let msg = format!("Starting '{name}'...");
                print_instance(&with_spinner(json, msg, orch.start(&name)).await?, json);
            }
            VmCommand::Stop { name } => {
                let msg = format!("Waiting for '{name}' to shut down...");
                print_instance(&with_spinner(json, msg, orch.stop(&name)).await?, json);
            }
            VmCommand::Suspend { name } => {
                let msg = format!("Suspending '{name}'...");
                print_instance(&with_spinner(json, msg, orch.suspend(&name)).await?, json);
            }
            VmCommand::Resume { name } => {
                let msg = format!("Resuming '{name}'...");
                print_instance(&with_spinner(json, msg, orch.resume(&name)).await?, json);
            }
            VmCommand::Destroy { name } => {
                let msg = format!("Destroying '{name}'...");
                with_spinner(json, msg, orch.destroy(&name)).await?;
                if !json {
                    println!("Instance '{name}' destroyed.");
                }
            }
            VmCommand::Resolve { name } => print_instance(&orch.resolve(&name).await?, json),
            VmCommand::Show { name } => print_instance(&orch.get(&name).await?, json),
            VmCommand::Ip { name } => {
                let addresses = orch.addresses(&name).await?;
                if json {
                    println!("{}", facet_json::to_string(&addresses));
                } else if addresses.is_empty() {
                    println!("No DHCP lease for '{name}' yet.");
                } else {
                    for addr in &addresses {
                        println!("{addr}");
                    }
                }
            }
        },
    }
    Ok(())
}

/// Run `fut` behind a spinner on interactive terminals.
async fn with_spinner<T>(
    json: bool,
    message: String,
    fut: impl Future<Output = Result<T, MoxError>>,
) -> Result<T, MoxError> {
    if json || !std::io::stderr().is_terminal() {
        return fut.await;
    }
    let spinner = ProgressBar::new_spinner();
    spinner.set_message(message);
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));
    let result = fut.await;
    spinner.finish_and_clear();
    result
}

fn warn_about(report: &ReconcileReport) {
    if report.inconsistent.is_empty() {
        return;
    }
    eprintln!(
        "warning: inconsistent instances: {} (see `mockmox vm show`, then `mockmox vm resolve`)",
        report.inconsistent.join(", ")
    );
}

fn print_report(report: &ReconcileReport, json: bool) {
    if json {
        println!("{}", facet_json::to_string(report));
        return;
    }
    println!("Checked {} instance(s).", report.checked);
    for name in &report.settled {
        println!("  settled:      {name}");
    }
    for name in &report.inconsistent {
        println!("  inconsistent: {name}");
    }
    for name in &report.orphan_domains {
        println!("  unmanaged:    {name}");
    }
}

fn print_instance(instance: &Instance, json: bool) {
    if json {
        println!("{}", facet_json::to_string(instance));
        return;
    }
    println!("Instance '{}': {}", instance.name, instance.state);
    println!("  template: {}", instance.template);
    println!("  cpus:     {}", instance.cpus);
    println!("  memory:   {} MB", instance.memory_mb);
    println!("  disk:     {} ({} GB)", instance.disk_path, instance.disk_gb);
    if let Some(reason) = &instance.inconsistent {
        println!("  INCONSISTENT: {reason}");
    }
}

fn print_instances(instances: &[Instance], json: bool) {
    if json {
        println!("{}", facet_json::to_string(&instances.to_vec()));
        return;
    }
    if instances.is_empty() {
        println!("No instances.");
        return;
    }
    println!(
        "{:<24} {:<11} {:<16} {:>4} {:>8} {:>6}",
        "NAME", "STATE", "TEMPLATE", "CPUS", "MEMORY", "DISK"
    );
    for i in instances {
        let flag = if i.is_inconsistent() { " !" } else { "" };
        println!(
            "{:<24} {:<11} {:<16} {:>4} {:>6}MB {:>4}GB{flag}",
            i.name,
            i.state.as_str(),
            i.template,
            i.cpus,
            i.memory_mb,
            i.disk_gb
        );
    }
}

fn print_names(names: &[String], json: bool) {
    if json {
        println!("{}", facet_json::to_string(&names.to_vec()));
        return;
    }
    for name in names {
        println!("{name}");
    }
}

fn print_group(group: &Group, json: bool) {
    if json {
        println!("{}", facet_json::to_string(group));
        return;
    }
    println!("Group '{}'", group.name);
    if group.templates.is_empty() {
        println!("  (no templates)");
    }
    for template in &group.templates {
        println!("  {template}");
    }
}

fn print_groups(groups: &[Group], json: bool) {
    if json {
        println!("{}", facet_json::to_string(&groups.to_vec()));
        return;
    }
    if groups.is_empty() {
        println!("No groups.");
        return;
    }
    println!("{:<20} TEMPLATES", "NAME");
    for g in groups {
        let members = if g.templates.is_empty() {
            "-".to_string()
        } else {
            g.templates.join(", ")
        };
        println!("{:<20} {members}", g.name);
    }
}

#[derive(Facet)]
struct TemplateJson {
    name: String,
    disk: String,
    format: String,
    os: Option<String>,
    cpus: Option<u32>,
    memory_mb: Option<u64>,
    disk_gb: u64,
}

fn print_templates(templates: &[Template], json: bool) {
    if json {
        let views: Vec<TemplateJson> = templates
            .iter()
            .map(|t| TemplateJson {
                name: t.name.clone(),
                disk: t.disk.display().to_string(),
                format: t.format.driver().to_string(),
                os: t.os.clone(),
                cpus: t.cpus,
                memory_mb: t.memory_mb,
                disk_gb: t.disk_gb,
            })
            .collect();
        println!("{}", facet_json::to_string(&views));
        return;
    }
    if templates.is_empty() {
        println!("No templates.");
        return;
    }
    println!("{:<20} {:<7} {:>6} {:<16}", "NAME", "FORMAT", "DISK", "OS");
    for t in templates {
        println!(
            "{:<20} {:<7} {:>4}GB {:<16}",
            t.name,
            t.format.driver(),
            t.disk_gb,
            t.os.as_deref().unwrap_or("-")
        );
    }
}
