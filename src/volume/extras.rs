//! Hypervisor extras contributed by volumes.
//!
//! A volume mounted into a VM does not become a bind mount. It becomes
//! a side process (the virtio-fs daemon), a handful of hypervisor
//! arguments wiring its socket into the guest, and kernel command line
//! options that mount the shared filesystem inside the unikernel:
//!
//! ```text
//!   virtiofsd ──socket──▶ qemu -chardev ... -device vhost-user-fs-pci
//!                                   │
//!                                   ▼
//!                guest: --mount-fs=virtiofs,/dev/virtiofs0,/data
//! ```
//!
//! Arguments and options may reference the mount ordinal and the mount
//! path through `{index}` and `{mount_path}`; [`Extras::expand`] renders
//! them once the volume is attached to a specific mount.

use crate::config::VirtiofsSettings;
use crate::constants::VIRTIOFS_QUEUE_SIZE;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Extra processes, arguments and options a VM needs for its volumes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extras {
    /// Processes spawned before the VM, each as `[program, args...]`.
    pub side_processes: Vec<Vec<String>>,
    /// Arguments appended to the hypervisor command line.
    pub hypervisor_args: Vec<String>,
    /// Options prepended to the guest command line.
    pub templated_options: Vec<String>,
    /// Size of the shared memory backend, when one is required.
    pub shared_memory: Option<String>,
}

impl Extras {
    /// Extras for a virtio-fs share of `shared_dir` exposed under `tag`.
    pub fn virtiofs(
        socket: &Path,
        shared_dir: &Path,
        tag: &str,
        settings: &VirtiofsSettings,
    ) -> Self {
        let socket = socket.display().to_string();
        let escaped_socket = escape(&socket);

        Self {
            side_processes: vec![vec![
                settings.daemon.clone(),
                "--socket-path".to_string(),
                socket.clone(),
                "--shared-dir".to_string(),
                shared_dir.display().to_string(),
                "--no-announce-submounts".to_string(),
            ]],
            hypervisor_args: vec![
                "-chardev".to_string(),
                format!("socket,id=char{{index}},path={}", escaped_socket),
                "-device".to_string(),
                format!(
                    "vhost-user-fs-pci,queue-size={},chardev=char{{index}},tag={}",
                    VIRTIOFS_QUEUE_SIZE,
                    escape(tag)
                ),
            ],
            templated_options: vec![
                "--rootfs=zfs".to_string(),
                "--mount-fs=virtiofs,/dev/virtiofs{index},{mount_path}".to_string(),
            ],
            shared_memory: Some(settings.shared_memory.clone()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.side_processes.is_empty()
            && self.hypervisor_args.is_empty()
            && self.templated_options.is_empty()
            && self.shared_memory.is_none()
    }

    /// Appends `other` after `self`. The first shared memory size wins.
    pub fn extend(&mut self, other: Extras) {
        self.side_processes.extend(other.side_processes);
        self.hypervisor_args.extend(other.hypervisor_args);
        self.templated_options.extend(other.templated_options);
        if self.shared_memory.is_none() {
            self.shared_memory = other.shared_memory;
        }
    }

    /// Renders every templated string for mount number `index` at
    /// `mount_path`, returning a new value.
    pub fn expand(&self, index: usize, mount_path: &str) -> Result<Extras> {
        let vars = TemplateVars { index, mount_path };
        let render_all = |items: &[String]| -> Result<Vec<String>> {
            items.iter().map(|s| render(s, &vars)).collect()
        };

        Ok(Extras {
            side_processes: self.side_processes.clone(),
            hypervisor_args: render_all(&self.hypervisor_args)?,
            templated_options: render_all(&self.templated_options)?,
            shared_memory: self.shared_memory.clone(),
        })
    }

    /// Hypervisor arguments for the shared memory backend, rendered once
    /// per VM regardless of how many volumes asked for it.
    pub fn shared_memory_args(&self) -> Vec<String> {
        match &self.shared_memory {
            Some(size) => vec![
                "-object".to_string(),
                format!(
                    "memory-backend-file,id=mem,size={},mem-path=/dev/shm,share=on",
                    size
                ),
                "-numa".to_string(),
                "node,memdev=mem".to_string(),
            ],
            None => Vec::new(),
        }
    }
}

// =============================================================================
// Templates
// =============================================================================

/// Values available to templated strings.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub index: usize,
    pub mount_path: &'a str,
}

/// Substitutes `{index}` and `{mount_path}` in `template`.
///
/// `{{` and `}}` produce literal braces. Any other placeholder is an
/// error, as is an unmatched brace.
pub fn render(template: &str, vars: &TemplateVars<'_>) -> Result<String> {
    let invalid = |reason: String| Error::InvalidTemplate {
        template: template.to_string(),
        reason,
    };

    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => name.push(c),
                        None => return Err(invalid(format!("unterminated placeholder '{{{}'", name))),
                    }
                }
                match name.trim() {
                    "index" => out.push_str(&vars.index.to_string()),
                    "mount_path" => out.push_str(vars.mount_path),
                    other => return Err(invalid(format!("unknown placeholder '{}'", other))),
                }
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => return Err(invalid("unmatched '}'".to_string())),
            c => out.push(c),
        }
    }
    Ok(out)
}

/// Escapes braces so `value` survives [`render`] unchanged.
pub fn escape(value: &str) -> String {
    value.replace('{', "{{").replace('}', "}}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: TemplateVars<'static> = TemplateVars {
        index: 2,
        mount_path: "/data",
    };

    #[test]
    fn test_render() {
        assert_eq!(
            render("/dev/virtiofs{index},{mount_path}", &VARS).unwrap(),
            "/dev/virtiofs2,/data"
        );
        assert_eq!(render("{{literal}}", &VARS).unwrap(), "{literal}");
        assert_eq!(render("plain", &VARS).unwrap(), "plain");
    }

    #[test]
    fn test_render_rejects_unknown() {
        assert!(matches!(
            render("{volume}", &VARS),
            Err(Error::InvalidTemplate { .. })
        ));
        assert!(render("{index", &VARS).is_err());
        assert!(render("oops}", &VARS).is_err());
    }

    #[test]
    fn test_virtiofs_expand() {
        let settings = VirtiofsSettings::default();
        let extras = Extras::virtiofs(
            Path::new("/run/v{1}.sock"),
            Path::new("/srv/data"),
            "data",
            &settings,
        );
        let expanded = extras.expand(0, "/mnt").unwrap();

        assert_eq!(expanded.hypervisor_args[1], "socket,id=char0,path=/run/v{1}.sock");
        assert_eq!(
            expanded.hypervisor_args[3],
            "vhost-user-fs-pci,queue-size=1024,chardev=char0,tag=data"
        );
        assert_eq!(
            expanded.templated_options,
            vec!["--rootfs=zfs", "--mount-fs=virtiofs,/dev/virtiofs0,/mnt"]
        );
        assert_eq!(expanded.side_processes[0][0], "virtiofsd");
    }

    #[test]
    fn test_extend_keeps_order_and_single_shared_memory() {
        let settings = VirtiofsSettings::default();
        let mut merged = Extras::default();
        assert!(merged.is_empty());

        for (i, name) in ["a", "b"].iter().enumerate() {
            let extras = Extras::virtiofs(
                Path::new(&format!("/run/{}.sock", name)),
                Path::new("/srv"),
                name,
                &settings,
            );
            merged.extend(extras.expand(i, &format!("/{}", name)).unwrap());
        }

        assert_eq!(merged.side_processes.len(), 2);
        assert!(merged.side_processes[0].contains(&"/run/a.sock".to_string()));
        assert_eq!(merged.shared_memory_args().len(), 4);
        assert!(merged.shared_memory_args()[1].contains("size=1G"));
    }
}
