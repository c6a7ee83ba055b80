use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::DEFAULT_CONFIG_FILE;
use crate::template_files::{FileKind, FileOwner};
use crate::util::parse_disk_gb;

#[derive(Parser, Debug)]
#[command(
    name = "mockmox",
    version,
    about = "Templated KVM virtual machines on top of libvirt"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// libvirt connection URI (overrides config)
    #[arg(long, global = true)]
    pub libvirtd: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the directory layout under the base directory
    Install,

    /// Manage disk templates
    Template {
        #[command(subcommand)]
        action: TemplateCommand,
    },

    /// Manage groups of templates
    Group {
        #[command(subcommand)]
        action: GroupCommand,
    },

    /// Manage instances
    Vm {
        #[command(subcommand)]
        action: VmCommand,
    },

    /// List instances, suspended instances, templates or groups
    List {
        #[arg(value_enum, default_value_t = ListTarget::Instances)]
        what: ListTarget,
    },

    /// Check every instance record against the hypervisor
    Reconcile,
}

#[derive(Subcommand, Debug)]
pub enum TemplateCommand {
    /// List registered templates
    List,

    /// Copy an existing disk image in as a template
    Import {
        name: String,
        /// Disk image to copy (qcow2 or raw)
        disk: PathBuf,
        #[command(flatten)]
        meta: TemplateArgs,
        /// Smallest disk instances may have, e.g. 20 or 20G
        #[arg(long, value_parser = parse_disk_gb)]
        disk_size: Option<u64>,
    },

    /// Register an empty qcow2 image as a template
    Create {
        name: String,
        /// Size of the blank disk, e.g. 32 or 32G
        #[arg(long, value_parser = parse_disk_gb)]
        disk: u64,
        #[command(flatten)]
        meta: TemplateArgs,
    },

    /// Remove a template no instance or group uses
    Delete { name: String },

    /// Copy a file or executable into a template
    AddFile {
        name: String,
        source: PathBuf,
        #[command(flatten)]
        slot: FileSlot,
    },

    /// Remove a file or executable from a template
    RemoveFile {
        name: String,
        /// File name as shown by `list-files`
        file: String,
        #[command(flatten)]
        slot: FileSlot,
    },

    /// List a template's files of one owner and type
    ListFiles {
        name: String,
        #[command(flatten)]
        slot: FileSlot,
    },

    /// Install an SSH key for a guest user
    AddKey {
        name: String,
        key: PathBuf,
        #[arg(short, long)]
        user: String,
    },

    /// Remove a guest user's SSH key
    RemoveKey {
        name: String,
        #[arg(short, long)]
        user: String,
    },

    /// List guest users with an SSH key
    ListKeys { name: String },
}

/// Which of a template's file directories to act on.
#[derive(Args, Debug, Clone, Copy)]
pub struct FileSlot {
    /// Guest account the file belongs to
    #[arg(short, long, value_enum)]
    pub user: FileOwner,

    /// Plain file or executable
    #[arg(short = 't', long = "type", value_enum)]
    pub kind: FileKind,
}

#[derive(Subcommand, Debug)]
pub enum GroupCommand {
    /// Create an empty group
    Create { name: String },
    /// Delete a group (its templates stay registered)
    Delete { name: String },
    /// Add a template to a group
    Add { template: String, group: String },
    /// Remove a template from a group
    Remove { template: String, group: String },
    /// Show one group
    Show { name: String },
}

#[derive(Args, Debug, Clone)]
pub struct TemplateArgs {
    /// Operating system label
    #[arg(long)]
    pub os: Option<String>,

    /// Default vCPU count for instances
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Default memory for instances, in MB
    #[arg(long)]
    pub memory: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum VmCommand {
    /// Provision a new instance from a template
    Create {
        template: String,
        name: String,
        #[arg(long)]
        cpus: Option<u32>,
        /// Memory in MB
        #[arg(long)]
        memory: Option<u64>,
        /// Disk size, e.g. 64 or 64G
        #[arg(long, value_parser = parse_disk_gb)]
        disk: Option<u64>,
    },
    /// Boot an instance
    Start { name: String },
    /// Shut an instance down (ACPI first, forced after the timeout)
    Stop { name: String },
    /// Save guest state and park the disk
    Suspend { name: String },
    /// Restore a suspended instance
    Resume { name: String },
    /// Remove an instance, its domain and its disk
    Destroy { name: String },
    /// Clear an inconsistency flag once the instance has been checked
    Resolve { name: String },
    /// Show one instance
    Show { name: String },
    /// Show guest IP addresses
    Ip { name: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTarget {
    Instances,
    Suspended,
    Templates,
    Groups,
}
