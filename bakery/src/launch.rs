use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Child, Command};

use tracing::debug;

use crate::config::BakeryConfig;
use crate::customer::Customer;
use crate::errors::Result;
use crate::protocol::ChannelIds;

/// Worker roles, as command-line subcommands of the simulation binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Manager,
    Seller(u32),
    Chef(u32),
    Supply,
}

/// Spawns worker processes with the encoded configuration and channel ids.
/// Children re-attach to shared memory by name; nothing mapped is inherited.
#[derive(Debug, Clone)]
pub struct Launcher {
    exe: PathBuf,
    config: String,
    channels: ChannelIds,
}

impl Launcher {
    pub fn new(exe: PathBuf, cfg: &BakeryConfig, channels: ChannelIds) -> Result<Launcher> {
        Ok(Launcher { exe, config: cfg.encode()?, channels })
    }

    /// Rebuilds a launcher from the arguments a worker was started with.
    pub fn from_encoded(exe: PathBuf, config: String, channels: ChannelIds) -> Launcher {
        Launcher { exe, config, channels }
    }

    fn command(&self, subcommand: &str, extra: Vec<OsString>) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.arg(subcommand)
            .arg("--config")
            .arg(&self.config)
            .arg("--channels")
            .arg(self.channels.to_string())
            .args(extra);
        cmd
    }

    pub fn worker_args(role: Role) -> (&'static str, Vec<OsString>) {
        match role {
            Role::Manager => ("manager", vec![]),
            Role::Seller(id) => ("seller", vec!["--id".into(), id.to_string().into()]),
            Role::Chef(id) => ("chef", vec!["--id".into(), id.to_string().into()]),
            Role::Supply => ("supply", vec![]),
        }
    }

    pub fn spawn(&self, role: Role) -> Result<Child> {
        let (subcommand, extra) = Launcher::worker_args(role);
        let child = self.command(subcommand, extra).spawn()?;
        debug!(?role, pid = child.id(), "worker spawned");
        Ok(child)
    }

    pub fn spawn_customer(&self, record: &Customer, manager_pid: i32) -> Result<Child> {
        let extra = vec![
            "--manager-pid".into(),
            manager_pid.to_string().into(),
            "--record".into(),
            record.encode().into(),
        ];
        let child = self.command("customer", extra).spawn()?;
        debug!(id = record.id, pid = child.id(), "customer spawned");
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_arguments() {
        assert_eq!(Launcher::worker_args(Role::Supply).0, "supply");
        let (name, extra) = Launcher::worker_args(Role::Chef(3));
        assert_eq!(name, "chef");
        assert_eq!(extra, vec![OsString::from("--id"), OsString::from("3")]);
    }

    #[test]
    fn commands_carry_config_and_channels() {
        let ids: ChannelIds = "q1:1,2,3,4,5".parse().unwrap();
        let launcher = Launcher::new(PathBuf::from("/bin/true"), &BakeryConfig::default(), ids).unwrap();
        let cmd = launcher.command("seller", vec!["--id".into(), "0".into()]);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0], "seller");
        assert_eq!(args[1], "--config");
        assert_eq!(BakeryConfig::decode(&args[2]).unwrap(), BakeryConfig::default());
        assert_eq!(&args[3..], &["--channels", "q1:1,2,3,4,5", "--id", "0"]);
    }
}
