//! SSH shell launching
//!
//! The dispatcher suspends the terminal UI, runs the external process in
//! the foreground, and resumes when it exits.

use std::io;
use std::process::{Command, ExitStatus};

/// External shell launcher capability
pub trait ShellLauncher {
    fn open_node_shell(&self, user: &str, ip: &str) -> io::Result<ExitStatus>;
    fn open_lxc_shell(&self, user: &str, node_ip: &str, vmid: u32) -> io::Result<ExitStatus>;
    fn open_qemu_shell(&self, user: &str, vm_ip: &str) -> io::Result<ExitStatus>;
    fn open_qemu_guest_agent_shell(
        &self,
        user: &str,
        node_ip: &str,
        vmid: u32,
    ) -> io::Result<ExitStatus>;
}

/// Launcher that execs the system `ssh`
pub struct SshLauncher;

impl SshLauncher {
    fn ssh(&self, user: &str, host: &str, remote_command: Option<String>) -> io::Result<ExitStatus> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-t").arg(format!("{user}@{host}"));
        if let Some(remote) = remote_command {
            cmd.arg(remote);
        }
        cmd.status()
    }
}

impl ShellLauncher for SshLauncher {
    fn open_node_shell(&self, user: &str, ip: &str) -> io::Result<ExitStatus> {
        self.ssh(user, ip, None)
    }

    /// Containers have no SSH of their own; enter through the node.
    fn open_lxc_shell(&self, user: &str, node_ip: &str, vmid: u32) -> io::Result<ExitStatus> {
        self.ssh(user, node_ip, Some(format!("pct enter {vmid}")))
    }

    fn open_qemu_shell(&self, user: &str, vm_ip: &str) -> io::Result<ExitStatus> {
        self.ssh(user, vm_ip, None)
    }

    /// Serial-over-agent terminal via the node.
    fn open_qemu_guest_agent_shell(
        &self,
        user: &str,
        node_ip: &str,
        vmid: u32,
    ) -> io::Result<ExitStatus> {
        self.ssh(user, node_ip, Some(format!("qm terminal {vmid}")))
    }
}
