//! Host primitives (C1): network namespaces, veth pairs, and running
//! commands inside a node's namespace.
//!
//! Namespace bookkeeping follows the teacher's bind-mount-under-a-base-dir
//! approach (`/var/run/netns/<name>`-style files holding a namespace
//! reference), and veth/MTU/up-state management mirrors its rtnetlink
//! usage. Process execution inside a namespace is new: nodes run
//! unmodified user programs, so `run_in_node` forks a child that enters
//! the target namespace via `setns` before exec, rather than shelling out
//! to `ip netns exec`.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::mount::{mount, umount, MsFlags};
use nix::sched::{setns, CloneFlags};
use nix::unistd::getpid;
use rtnetlink::{new_connection, Handle};
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetNsError {
    #[error("failed to create netns directory: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to create netns file: {0}")]
    CreateFile(std::io::Error),

    #[error("failed to mount namespace: {0}")]
    Mount(nix::Error),

    #[error("failed to enter namespace: {0}")]
    SetNs(nix::Error),

    #[error("failed to open namespace file: {0}")]
    OpenNs(std::io::Error),

    #[error("namespace '{0}' not found")]
    NotFound(String),

    #[error("namespace '{0}' already exists")]
    AlreadyExists(String),

    #[error("insufficient permissions (CAP_NET_ADMIN/CAP_SYS_ADMIN required)")]
    Permission,

    #[error("command exec failed: {0}")]
    Exec(std::io::Error),
}

#[derive(Error, Debug)]
pub enum VethError {
    #[error("netlink connection failed: {0}")]
    Connection(std::io::Error),

    #[error("interface '{0}' not found")]
    NotFound(String),

    #[error("interface '{0}' already exists")]
    AlreadyExists(String),

    #[error("failed to create veth pair: {0}")]
    CreateFailed(rtnetlink::Error),

    #[error("failed to move interface to namespace: {0}")]
    MoveFailed(rtnetlink::Error),

    #[error("failed to bring interface up: {0}")]
    SetUpFailed(rtnetlink::Error),

    #[error("failed to set mtu: {0}")]
    SetMtuFailed(rtnetlink::Error),

    #[error("failed to set hardware address: {0}")]
    SetMacFailed(rtnetlink::Error),

    #[error("failed to add ip address: {0}")]
    AddAddressFailed(rtnetlink::Error),

    #[error("failed to delete interface: {0}")]
    DeleteFailed(rtnetlink::Error),

    #[error("namespace error: {0}")]
    NetNs(#[from] NetNsError),

    #[error("invalid interface name: {0}")]
    InvalidName(String),
}

/// What running a command inside a node produced.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    /// `wait=false`: the process was started and left running.
    Pid(i32),
    /// `wait=true`: the process ran to completion.
    Exited {
        exit_code: Option<i32>,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

/// Network namespace manager. Namespaces are tracked by name; each is
/// backed by a bind-mounted file under `base_dir` holding a reference to
/// the namespace, so it survives after the creating process exits.
pub struct NamespaceManager {
    namespaces: HashMap<String, File>,
    base_dir: PathBuf,
}

impl NamespaceManager {
    pub fn new(base_dir: PathBuf) -> Result<Self, NetNsError> {
        std::fs::create_dir_all(&base_dir).map_err(NetNsError::CreateDir)?;
        Ok(Self {
            namespaces: HashMap::new(),
            base_dir,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub async fn create_namespace(&mut self, name: &str) -> Result<(), NetNsError> {
        if self.namespaces.contains_key(name) {
            return Err(NetNsError::AlreadyExists(name.to_string()));
        }

        let ns_path = self.base_dir.join(name);
        if ns_path.exists() {
            return Err(NetNsError::AlreadyExists(name.to_string()));
        }

        debug!("creating namespace: {}", name);

        tokio::fs::File::create(&ns_path)
            .await
            .map_err(NetNsError::CreateFile)?;

        let result = tokio::task::spawn_blocking({
            let ns_path = ns_path.clone();
            let name = name.to_string();
            move || -> Result<(), NetNsError> {
                nix::sched::unshare(CloneFlags::CLONE_NEWNET).map_err(|_| NetNsError::Permission)?;

                let new_ns_path = format!("/proc/{}/ns/net", getpid());
                mount(
                    Some(new_ns_path.as_str()),
                    &ns_path,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
                .map_err(NetNsError::Mount)?;

                debug!("successfully created namespace: {}", name);
                Ok(())
            }
        })
        .await
        .map_err(|e| NetNsError::CreateFile(std::io::Error::other(e)))?;

        result?;

        let file = OpenOptions::new()
            .read(true)
            .open(&ns_path)
            .map_err(NetNsError::OpenNs)?;

        self.namespaces.insert(name.to_string(), file);
        info!("created namespace: {}", name);
        Ok(())
    }

    pub async fn delete_namespace(&mut self, name: &str) -> Result<(), NetNsError> {
        let ns_path = self.base_dir.join(name);
        self.namespaces.remove(name);

        if !ns_path.exists() {
            return Ok(());
        }

        if let Err(e) = umount(&ns_path) {
            warn!("failed to unmount namespace {}: {}", name, e);
        }
        if let Err(e) = tokio::fs::remove_file(&ns_path).await {
            warn!("failed to remove namespace file {}: {}", name, e);
        }

        info!("deleted namespace: {}", name);
        Ok(())
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.namespaces.contains_key(name)
    }

    pub fn get_namespace_fd(&self, name: &str) -> Result<RawFd, NetNsError> {
        self.namespaces
            .get(name)
            .map(|f| f.as_raw_fd())
            .ok_or_else(|| NetNsError::NotFound(name.to_string()))
    }

    /// Run a closure with the calling OS thread temporarily moved into
    /// `name`'s namespace, restoring the original namespace on return.
    pub fn exec_in_namespace<F, T>(&self, name: &str, f: F) -> Result<T, NetNsError>
    where
        F: FnOnce() -> T,
    {
        let file = self
            .namespaces
            .get(name)
            .ok_or_else(|| NetNsError::NotFound(name.to_string()))?;

        let original_ns = OpenOptions::new()
            .read(true)
            .open("/proc/self/ns/net")
            .map_err(NetNsError::OpenNs)?;

        setns(file, CloneFlags::CLONE_NEWNET).map_err(NetNsError::SetNs)?;
        let result = f();
        if let Err(e) = setns(&original_ns, CloneFlags::CLONE_NEWNET) {
            warn!("failed to restore original namespace from {}: {}", name, e);
        }
        Ok(result)
    }

    /// Run a program inside a node's namespace. Mirrors the node lifecycle
    /// contract in spec §4.2: cwd defaults to `cwd`, `wait=false` returns
    /// the pid immediately, `wait=true` waits and returns the exit status
    /// plus captured output. `deadline` enforces the cancellation/timeout
    /// semantics in spec §5 (TERM, then KILL after a 2s grace period).
    pub async fn run_in_node(
        &self,
        name: &str,
        argv: &[String],
        cwd: &Path,
        wait: bool,
        deadline: Option<Duration>,
    ) -> Result<CommandOutcome, NetNsError> {
        let ns_fd = self.get_namespace_fd(name)?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| NetNsError::Exec(std::io::Error::other("empty argv")))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        unsafe {
            cmd.pre_exec(move || {
                let fd = std::os::fd::BorrowedFd::borrow_raw(ns_fd);
                nix::sched::setns(fd, CloneFlags::CLONE_NEWNET)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(NetNsError::Exec)?;

        if !wait {
            let pid = child.id().ok_or_else(|| NetNsError::Exec(std::io::Error::other("no pid")))? as i32;
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Ok(CommandOutcome::Pid(pid));
        }

        let pid = child.id().map(|p| p as i32);
        let output = match deadline {
            Some(d) => match timeout(d, child.wait_with_output()).await {
                Ok(res) => res.map_err(NetNsError::Exec)?,
                Err(_) => {
                    if let Some(pid) = pid {
                        terminate_with_grace(pid).await;
                    }
                    return Err(NetNsError::Exec(std::io::Error::other("command timed out")));
                }
            },
            None => child.wait_with_output().await.map_err(NetNsError::Exec)?,
        };

        Ok(CommandOutcome::Exited {
            exit_code: output.status.code().or_else(|| output.status.signal().map(|s| -s)),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Signal a process with TERM, then KILL after a grace period, per the
/// cancellation semantics in spec §5.
async fn terminate_with_grace(pid: i32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

#[derive(Clone, Debug)]
pub struct VethInfo {
    pub name: String,
    pub index: u32,
    pub namespace: Option<String>,
}

#[derive(Clone, Debug)]
pub struct VethPair {
    pub left: VethInfo,
    pub right: VethInfo,
}

/// Veth pair manager, backed by a single netlink handle in the host's
/// default namespace (new handles are created on demand for namespaced
/// operations — see `create_ns_handle`).
pub struct VethManager {
    handle: Handle,
    pairs: HashMap<String, VethPair>,
}

impl VethManager {
    pub async fn new() -> Result<Self, VethError> {
        let (connection, handle, _) = new_connection().map_err(VethError::Connection)?;
        tokio::spawn(connection);
        Ok(Self {
            handle,
            pairs: HashMap::new(),
        })
    }

    pub async fn create_pair(&mut self, left: &str, right: &str) -> Result<VethPair, VethError> {
        if self.pairs.contains_key(left) || self.pairs.contains_key(right) {
            return Err(VethError::AlreadyExists(format!("{left}/{right}")));
        }
        if !is_valid_interface_name(left) {
            return Err(VethError::InvalidName(left.to_string()));
        }
        if !is_valid_interface_name(right) {
            return Err(VethError::InvalidName(right.to_string()));
        }

        debug!("creating veth pair: {} <-> {}", left, right);

        self.handle
            .link()
            .add()
            .veth(left.to_string(), right.to_string())
            .execute()
            .await
            .map_err(VethError::CreateFailed)?;

        let left_index = self.find_interface_index(&self.handle, left).await?;
        let right_index = self.find_interface_index(&self.handle, right).await?;

        let pair = VethPair {
            left: VethInfo {
                name: left.to_string(),
                index: left_index,
                namespace: None,
            },
            right: VethInfo {
                name: right.to_string(),
                index: right_index,
                namespace: None,
            },
        };

        self.pairs.insert(left.to_string(), pair.clone());
        self.pairs.insert(right.to_string(), pair.clone());
        info!("created veth pair: {} <-> {}", left, right);
        Ok(pair)
    }

    pub async fn move_to_namespace(
        &mut self,
        iface: &str,
        target_ns: &str,
        ns_manager: &NamespaceManager,
    ) -> Result<(), VethError> {
        let index = self.find_interface_index(&self.handle, iface).await?;
        let ns_fd = ns_manager.get_namespace_fd(target_ns)?;

        self.handle
            .link()
            .set(index)
            .setns_by_fd(ns_fd)
            .execute()
            .await
            .map_err(VethError::MoveFailed)?;

        if let Some(pair) = self.pairs.get_mut(iface) {
            if pair.left.name == iface {
                pair.left.namespace = Some(target_ns.to_string());
            } else {
                pair.right.namespace = Some(target_ns.to_string());
            }
        }
        info!("moved interface {} to namespace {}", iface, target_ns);
        Ok(())
    }

    /// Rename an interface that has just been moved into a node's
    /// namespace, to the node-visible name (e.g. `eth0`).
    pub async fn rename_in_namespace(
        &self,
        old_name: &str,
        new_name: &str,
        namespace: &str,
        ns_manager: &NamespaceManager,
    ) -> Result<(), VethError> {
        let handle = self.ns_handle(ns_manager, namespace).await?;
        let index = self.find_interface_index(&handle, old_name).await?;
        handle
            .link()
            .set(index)
            .name(new_name.to_string())
            .execute()
            .await
            .map_err(VethError::SetUpFailed)?;
        Ok(())
    }

    /// Program the generated MAC onto an interface already moved into
    /// `namespace` (spec §4.2: attachInterface "assigns MAC and
    /// addresses").
    pub async fn set_address(
        &self,
        iface: &str,
        mac: [u8; 6],
        namespace: &str,
        ns_manager: &NamespaceManager,
    ) -> Result<(), VethError> {
        let handle = self.ns_handle(ns_manager, namespace).await?;
        let index = self.find_interface_index(&handle, iface).await?;
        handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(VethError::SetMacFailed)?;
        Ok(())
    }

    /// `ip addr add <addr>/<prefix> dev <iface>` inside `namespace`.
    pub async fn add_address(
        &self,
        iface: &str,
        addr: IpAddr,
        prefix_len: u8,
        namespace: &str,
        ns_manager: &NamespaceManager,
    ) -> Result<(), VethError> {
        let handle = self.ns_handle(ns_manager, namespace).await?;
        let index = self.find_interface_index(&handle, iface).await?;
        handle
            .address()
            .add(index, addr, prefix_len)
            .execute()
            .await
            .map_err(VethError::AddAddressFailed)?;
        Ok(())
    }

    pub async fn set_up(&self, iface: &str, ns_manager: Option<&NamespaceManager>) -> Result<(), VethError> {
        let handle = self.handle_for(iface, ns_manager).await?;
        let index = self.find_interface_index(&handle, iface).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(VethError::SetUpFailed)?;
        Ok(())
    }

    pub async fn set_mtu(&mut self, iface: &str, mtu: u32, ns_manager: Option<&NamespaceManager>) -> Result<(), VethError> {
        let handle = self.handle_for(iface, ns_manager).await?;
        let index = self.find_interface_index(&handle, iface).await?;
        handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(VethError::SetMtuFailed)?;
        Ok(())
    }

    pub async fn delete_pair(&mut self, iface: &str) -> Result<(), VethError> {
        let pair = match self.pairs.remove(iface) {
            Some(p) => p,
            None => return Ok(()),
        };
        let other = if pair.left.name == iface {
            &pair.right.name
        } else {
            &pair.left.name
        };
        self.pairs.remove(other);

        if let Ok(index) = self.find_interface_index(&self.handle, iface).await {
            self.handle
                .link()
                .del(index)
                .execute()
                .await
                .map_err(VethError::DeleteFailed)?;
        }
        info!("deleted veth pair: {} <-> {}", pair.left.name, pair.right.name);
        Ok(())
    }

    /// Best-effort delete used during teardown/cleanup, where the
    /// interface may already be gone.
    pub async fn delete_if_exists(&mut self, iface: &str) -> Result<(), VethError> {
        let _ = self.delete_pair(iface).await;
        Ok(())
    }

    async fn handle_for(&self, iface: &str, ns_manager: Option<&NamespaceManager>) -> Result<Handle, VethError> {
        if let Some(pair) = self.pairs.get(iface) {
            let info = if pair.left.name == iface { &pair.left } else { &pair.right };
            if let Some(ns) = &info.namespace {
                let mgr = ns_manager.ok_or_else(|| VethError::NetNs(NetNsError::NotFound(ns.clone())))?;
                return self.ns_handle(mgr, ns).await;
            }
        }
        Ok(self.handle.clone())
    }

    async fn ns_handle(&self, ns_manager: &NamespaceManager, namespace: &str) -> Result<Handle, VethError> {
        ns_manager.exec_in_namespace(namespace, || {
            tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(async {
                    let (connection, handle, _) = new_connection().map_err(VethError::Connection)?;
                    tokio::spawn(connection);
                    Ok::<Handle, VethError>(handle)
                })
            })
        })?
    }

    async fn find_interface_index(&self, handle: &Handle, name: &str) -> Result<u32, VethError> {
        use futures::TryStreamExt;
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        if let Some(link) = links.try_next().await.map_err(|e| VethError::CreateFailed(e))? {
            Ok(link.header.index)
        } else {
            Err(VethError::NotFound(name.to_string()))
        }
    }
}

/// Linux interface name rules: non-empty, <=15 bytes, no leading dash.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 15
        && name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !name.starts_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_validation() {
        assert!(is_valid_interface_name("eth0"));
        assert!(is_valid_interface_name("veth-test"));
        assert!(!is_valid_interface_name(""));
        assert!(!is_valid_interface_name("this-name-is-way-too-long-for-linux"));
        assert!(!is_valid_interface_name("-invalid"));
        assert!(!is_valid_interface_name("invalid@name"));
    }

    #[tokio::test]
    #[cfg(feature = "sudo-tests")]
    async fn namespace_lifecycle() -> Result<(), NetNsError> {
        let dir = tempfile::tempdir().unwrap();
        let mut mgr = NamespaceManager::new(dir.path().to_path_buf())?;
        mgr.create_namespace("test-ns").await?;
        assert!(mgr.namespace_exists("test-ns"));
        assert!(mgr.create_namespace("test-ns").await.is_err());
        mgr.delete_namespace("test-ns").await?;
        assert!(!mgr.namespace_exists("test-ns"));
        Ok(())
    }
}
