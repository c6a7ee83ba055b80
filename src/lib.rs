#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod config;
pub mod disk;
pub mod domain_xml;
pub mod error;
pub mod flow;
pub mod gateway;
pub mod group;
pub mod instance;
pub mod lockfile;
pub mod logging;
pub mod paths;
pub mod qcow2;
pub mod registry;
pub mod template;
pub mod template_files;
pub mod util;
pub mod vm_state;
