//! Groups: named sets of templates under `<base>/groups`.
//!
//! Adding a template to a group mirrors the template's directory into the
//! group. Disk images are symlinked, never copied, since they are large and
//! immutable; everything else (metadata, files, keys) is copied so a group
//! can carry its own variant of them.
//!
//! ```text
//! groups/web/templates/ubuntu/ubuntu.qcow2 -> templates/ubuntu/ubuntu.qcow2
//! groups/web/templates/ubuntu/ubuntu.yaml
//! groups/web/templates/ubuntu/root_executables/setup.sh
//! ```

use std::path::{Path, PathBuf};

use facet::Facet;

use crate::config::validate_name;
use crate::error::MoxError;
use crate::paths::Layout;
use crate::template::TemplateRegistry;

const MEMBERS_DIR: &str = "templates";

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct Group {
    pub name: String,
    /// Member templates, sorted.
    pub templates: Vec<String>,
}

pub struct GroupRegistry {
    layout: Layout,
}

impl GroupRegistry {
    pub fn open(layout: Layout) -> Result<Self, MoxError> {
        let dir = layout.groups_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| MoxError::io(format!("creating directory {}", dir.display()), e))?;
        Ok(Self { layout })
    }

    fn members_dir(&self, group: &str) -> PathBuf {
        self.layout.group_dir(group).join(MEMBERS_DIR)
    }

    fn require(&self, name: &str) -> Result<(), MoxError> {
        validate_name(name)?;
        if self.layout.group_dir(name).is_dir() {
            Ok(())
        } else {
            Err(MoxError::NotFound {
                kind: "group",
                name: name.to_string(),
            })
        }
    }

    pub fn create(&self, name: &str) -> Result<Group, MoxError> {
        validate_name(name)?;
        let dir = self.layout.group_dir(name);
        match std::fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(MoxError::NameTaken {
                    kind: "group",
                    name: name.to_string(),
                });
            }
            Err(e) => return Err(MoxError::io(format!("creating {}", dir.display()), e)),
        }
        let members = self.members_dir(name);
        std::fs::create_dir(&members)
            .map_err(|e| MoxError::io(format!("creating {}", members.display()), e))?;
        tracing::info!(group = name, "group created");
        Ok(Group {
            name: name.to_string(),
            templates: Vec::new(),
        })
    }

    /// Delete a group and its mirrored templates. The templates themselves stay.
    pub fn delete(&self, name: &str) -> Result<(), MoxError> {
        self.require(name)?;
        let dir = self.layout.group_dir(name);
        std::fs::remove_dir_all(&dir)
            .map_err(|e| MoxError::io(format!("removing {}", dir.display()), e))?;
        tracing::info!(group = name, "group deleted");
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Group, MoxError> {
        self.require(name)?;
        Ok(Group {
            name: name.to_string(),
            templates: dir_names(&self.members_dir(name))?,
        })
    }

    /// Every group, sorted by name.
    pub fn list(&self) -> Result<Vec<Group>, MoxError> {
        dir_names(&self.layout.groups_dir())?
            .iter()
            .map(|name| self.get(name))
            .collect()
    }

    /// Groups that have `template` as a member.
    pub fn containing(&self, template: &str) -> Result<Vec<String>, MoxError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|g| g.templates.iter().any(|t| t == template))
            .map(|g| g.name)
            .collect())
    }

    /// Mirror `template` into `group`.
    pub fn add(
        &self,
        group: &str,
        template: &str,
        templates: &TemplateRegistry,
    ) -> Result<Group, MoxError> {
        self.require(group)?;
        let source = templates.resolve(template)?;
        let dest = self.members_dir(group).join(template);
        if dest.exists() {
            return Err(MoxError::NameTaken {
                kind: "group member",
                name: format!("{group}/{template}"),
            });
        }

        let src_dir = self.layout.template_dir(template);
        if let Err(e) = mirror(&src_dir, &dest, &source.disk) {
            let _ = std::fs::remove_dir_all(&dest);
            return Err(e);
        }
        tracing::info!(group, template, "template added to group");
        self.get(group)
    }

    pub fn remove(&self, group: &str, template: &str) -> Result<Group, MoxError> {
        self.require(group)?;
        validate_name(template)?;
        let dest = self.members_dir(group).join(template);
        if !dest.is_dir() {
            return Err(MoxError::NotFound {
                kind: "group member",
                name: format!("{group}/{template}"),
            });
        }
        std::fs::remove_dir_all(&dest)
            .map_err(|e| MoxError::io(format!("removing {}", dest.display()), e))?;
        tracing::info!(group, template, "template removed from group");
        self.get(group)
    }
}

/// Copy the tree at `src` to `dest`, symlinking `disk` instead of copying it.
fn mirror(src: &Path, dest: &Path, disk: &Path) -> Result<(), MoxError> {
    std::fs::create_dir_all(dest)
        .map_err(|e| MoxError::io(format!("creating directory {}", dest.display()), e))?;
    let entries =
        std::fs::read_dir(src).map_err(|e| MoxError::io(format!("reading {}", src.display()), e))?;

    for entry in entries {
        let entry = entry.map_err(|e| MoxError::io(format!("reading {}", src.display()), e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            mirror(&from, &to, disk)?;
        } else if from == disk {
            std::os::unix::fs::symlink(&from, &to)
                .map_err(|e| MoxError::io(format!("linking {}", to.display()), e))?;
        } else if from.is_file() {
            std::fs::copy(&from, &to).map_err(|e| {
                MoxError::io(format!("copying {} to {}", from.display(), to.display()), e)
            })?;
        }
    }
    Ok(())
}

/// Names of the directories directly under `dir`, sorted. Missing means none.
fn dir_names(dir: &Path) -> Result<Vec<String>, MoxError> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(MoxError::io(format!("reading {}", dir.display()), e)),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .collect();
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateMetadata;
    use crate::template_files::{FileKind, FileOwner};

    struct Fixture {
        dir: tempfile::TempDir,
        layout: Layout,
        templates: TemplateRegistry,
        groups: GroupRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().join("base"));
        layout.ensure().unwrap();
        let templates = TemplateRegistry::scan(layout.clone()).unwrap();
        templates
            .create_blank("ubuntu", 1, TemplateMetadata::default())
            .unwrap();
        templates
            .create_blank("debian", 1, TemplateMetadata::default())
            .unwrap();
        let groups = GroupRegistry::open(layout.clone()).unwrap();
        Fixture {
            dir,
            layout,
            templates,
            groups,
        }
    }

    #[test]
    fn create_list_delete() {
        let f = fixture();
        f.groups.create("web").unwrap();
        f.groups.create("db").unwrap();
        assert!(matches!(
            f.groups.create("web"),
            Err(MoxError::NameTaken { kind: "group", .. })
        ));

        let names: Vec<_> = f.groups.list().unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["db", "web"]);

        f.groups.delete("web").unwrap();
        assert!(!f.layout.group_dir("web").exists());
        assert!(matches!(
            f.groups.delete("web"),
            Err(MoxError::NotFound { kind: "group", .. })
        ));
    }

    #[tokio::test]
    async fn members_mirror_the_template() {
        let f = fixture();
        let script = f.dir.path().join("setup.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        f.templates
            .add_file("ubuntu", &script, FileOwner::Root, FileKind::Executable)
            .await
            .unwrap();
        f.groups.create("web").unwrap();

        let group = f.groups.add("web", "ubuntu", &f.templates).unwrap();
        assert_eq!(group.templates, vec!["ubuntu"]);

        let member = f.layout.group_dir("web").join("templates/ubuntu");
        let disk = member.join("ubuntu.qcow2");
        assert!(disk.symlink_metadata().unwrap().file_type().is_symlink());
        assert_eq!(
            std::fs::read_link(&disk).unwrap(),
            f.layout.template_dir("ubuntu").join("ubuntu.qcow2")
        );
        assert!(member.join("ubuntu.yaml").is_file());
        assert!(member.join("root_executables/setup.sh").is_file());

        assert!(matches!(
            f.groups.add("web", "ubuntu", &f.templates),
            Err(MoxError::NameTaken { kind: "group member", .. })
        ));
        assert_eq!(f.groups.containing("ubuntu").unwrap(), vec!["web"]);
        assert!(f.groups.containing("debian").unwrap().is_empty());
    }

    #[test]
    fn remove_member_keeps_the_template() {
        let f = fixture();
        f.groups.create("web").unwrap();
        f.groups.add("web", "ubuntu", &f.templates).unwrap();
        f.groups.add("web", "debian", &f.templates).unwrap();

        let group = f.groups.remove("web", "ubuntu").unwrap();
        assert_eq!(group.templates, vec!["debian"]);
        assert!(f.templates.resolve("ubuntu").unwrap().disk.is_file());
        assert!(matches!(
            f.groups.remove("web", "ubuntu"),
            Err(MoxError::NotFound { kind: "group member", .. })
        ));
    }

    #[test]
    fn unknown_groups_and_templates() {
        let f = fixture();
        assert!(matches!(
            f.groups.add("nope", "ubuntu", &f.templates),
            Err(MoxError::NotFound { kind: "group", .. })
        ));
        f.groups.create("web").unwrap();
        assert!(matches!(
            f.groups.add("web", "arch", &f.templates),
            Err(MoxError::NotFound { kind: "template", .. })
        ));
        assert!(f.groups.get("web").unwrap().templates.is_empty());
        assert!(matches!(
            f.groups.get("../etc"),
            Err(MoxError::Validation { .. })
        ));
    }
}
