//! The VM lifecycle manager (§4.5): owns the state machine driving each VM
//! through `booting -> running -> {paused, stopping -> stopped}`, and
//! coordinates the network fabric, the hypervisor adapter, and the
//! callback fabric around it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use vmfleet_net::{IpAllocator, NetworkFabric, PortForwardManager};
use vmfleet_proto::{CallbackRequest, CallbackResponse};

use crate::adapter::{CreateVmSpec, HypervisorAdapter};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::session::SessionRegistry;
use crate::state::{EntryPoint, PortForwardRecord, RootSource, VmRecord, VmState, validate_vm_name};

const READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Everything needed to create and boot a new VM.
#[derive(Debug, Clone)]
pub struct CreateVmRequest {
    /// Unique name for the new VM.
    pub vm_name: String,
    /// Virtual CPU count; defaults to 1 if unset.
    pub vcpus: Option<u8>,
    /// Memory budget in MiB; defaults to the configured percentage of host RAM if unset.
    pub memory_mib: Option<u64>,
    /// Guest boot command.
    pub entry_point: EntryPoint,
    /// Root filesystem source; defaults to the configured NFS export if unset.
    pub root_source: Option<RootSource>,
    /// Per-VM port forwards; defaults to the configured static ranges (§6) when empty.
    pub port_forwards: Vec<vmfleet_net::PortRange>,
    /// Direct-HTTP callback destination, baked into the kernel command line.
    pub callback_url: Option<String>,
}

struct ManagedVm {
    record: VmRecord,
    adapter: Option<HypervisorAdapter>,
    transport_handle: Option<tokio::task::JoinHandle<()>>,
}

/// Orchestrates the full fleet: guest IPs, host ports, bridge taps, the
/// hypervisor adapter, and the callback fabric, all keyed by VM name.
pub struct VmManager {
    config: Config,
    net: NetworkFabric,
    ip_allocator: Mutex<IpAllocator>,
    ports: Mutex<PortForwardManager>,
    vms: RwLock<HashMap<String, Arc<Mutex<ManagedVm>>>>,
    sessions: Arc<SessionRegistry>,
    next_cid: AtomicU32,
}

impl VmManager {
    /// Builds a manager from `config`, bringing up the shared bridge and
    /// its NAT chain. Does not load any persisted VM records; call
    /// [`VmManager::restore_from_disk`] afterwards for that.
    pub fn new(config: Config) -> Result<Self> {
        let (subnet, prefix_len) = config.bridge_subnet();
        let net = NetworkFabric::new(&config.bridge_name, config.bridge_ip, config.bridge_cidr, &config.bridge_subnet_cidr);
        net.ensure_bridge()?;

        let ip_allocator = IpAllocator::new(subnet, prefix_len, config.bridge_ip);
        let ports = PortForwardManager::new(&config.bridge_name);
        ports.ensure_chain()?;

        let sessions = Arc::new(SessionRegistry::new());

        Ok(Self {
            config,
            net,
            ip_allocator: Mutex::new(ip_allocator),
            ports: Mutex::new(ports),
            vms: RwLock::new(HashMap::new()),
            sessions,
            next_cid: AtomicU32::new(3),
        })
    }

    /// Shared handle to the callback fabric, for the HTTP surface to wire
    /// WebSocket sessions into.
    #[must_use]
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        self.sessions.clone()
    }

    /// Loads every persisted VM record under the configured state directory,
    /// seeding the IP allocator and port-forward manager so already-leased
    /// resources are never handed out twice.
    pub async fn restore_from_disk(&self) -> Result<()> {
        let records = VmRecord::load_all(&self.config.state_dir)?;
        let mut ip_allocator = self.ip_allocator.lock().await;
        let mut ports = self.ports.lock().await;
        let mut vms = self.vms.write().await;

        for record in records {
            ip_allocator.seed([record.guest_ip]);
            ports.seed(record.port_forwards.iter().map(|f| f.host_port));
            info!(vm_name = %record.vm_name, state = ?record.state, "restored VM record from disk");
            vms.insert(
                record.vm_name.clone(),
                Arc::new(Mutex::new(ManagedVm {
                    record,
                    adapter: None,
                    transport_handle: None,
                })),
            );
        }
        Ok(())
    }

    /// Returns a snapshot of every known VM record.
    pub async fn list(&self) -> Vec<VmRecord> {
        let vms = self.vms.read().await;
        let mut out = Vec::with_capacity(vms.len());
        for entry in vms.values() {
            out.push(entry.lock().await.record.clone());
        }
        out
    }

    /// Returns a single VM's record.
    pub async fn get(&self, vm_name: &str) -> Result<VmRecord> {
        let entry = self.find(vm_name).await?;
        Ok(entry.lock().await.record.clone())
    }

    async fn find(&self, vm_name: &str) -> Result<Arc<Mutex<ManagedVm>>> {
        self.vms
            .read()
            .await
            .get(vm_name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no VM named {vm_name}")))
    }

    /// Creates, boots, and registers a new VM. Every resource claimed along
    /// the way (IP, ports, tap, disk, hypervisor child) is released if a
    /// later step fails.
    pub async fn create(&self, req: CreateVmRequest) -> Result<VmRecord> {
        validate_vm_name(&req.vm_name)?;
        {
            let vms = self.vms.read().await;
            if vms.contains_key(&req.vm_name) {
                return Err(Error::Conflict(format!("VM {} already exists", req.vm_name)));
            }
        }

        let guest_ip = self.ip_allocator.lock().await.allocate()?;
        if let Err(e) = self.try_create(&req, guest_ip).await {
            self.ip_allocator.lock().await.release(guest_ip);
            return Err(e);
        }
        self.get(&req.vm_name).await
    }

    async fn try_create(&self, req: &CreateVmRequest, guest_ip: Ipv4Addr) -> Result<()> {
        let tap_device = self.net.create_tap(&req.vm_name)?;

        let forward_ranges: Vec<vmfleet_net::PortRange> = if req.port_forwards.is_empty() {
            self.config.port_forwards.iter().map(Into::into).collect()
        } else {
            req.port_forwards.clone()
        };
        let forwards = if forward_ranges.is_empty() {
            Vec::new()
        } else {
            self.ports.lock().await.reserve(&forward_ranges)?
        };
        let install_result: Result<()> = async {
            let ports = self.ports.lock().await;
            for fwd in &forwards {
                ports.install(fwd.host_port, guest_ip, fwd.guest_port)?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = install_result {
            self.teardown_tap_and_ports(&tap_device, &forwards).await;
            return Err(e);
        }

        let state_dir = self.config.state_dir.join(&req.vm_name);
        let stateful_disk_path = state_dir.join("stateful.img");
        if let Err(e) = create_stateful_disk(&stateful_disk_path, self.config.stateful_size_in_mb).await {
            self.teardown_tap_and_ports(&tap_device, &forwards).await;
            return Err(e);
        }

        let control_socket_path = state_dir.join("chv-api.sock");
        let vsock_socket_path = state_dir.join("vsock.sock");
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);

        let root_source = req.root_source.clone().unwrap_or_else(|| RootSource {
            server: self.config.nfs_server.clone().unwrap_or_default(),
            port: self.config.nfs_port.unwrap_or(2049),
            path: self.config.nfs_path.clone().unwrap_or_default(),
        });

        let record = VmRecord {
            vm_name: req.vm_name.clone(),
            guest_ip,
            tap_device: tap_device.clone(),
            control_socket_path: control_socket_path.clone(),
            state: VmState::Booting,
            stateful_disk_path: stateful_disk_path.clone(),
            port_forwards: forwards
                .iter()
                .map(|f| PortForwardRecord {
                    host_port: f.host_port,
                    guest_port: f.guest_port,
                    description: f.description.clone(),
                })
                .collect(),
            root_source: root_source.clone(),
            entry_point: req.entry_point.clone(),
            hypervisor_pid: None,
        };
        record.save(&self.config.state_dir)?;

        let boot_result = self.boot(req, &record, &vsock_socket_path, cid, &root_source).await;
        match boot_result {
            Ok((adapter, transport_handle)) => {
                let mut record = record;
                record.state = VmState::Running;
                record.hypervisor_pid = adapter.pid();
                record.save(&self.config.state_dir)?;

                self.vms.write().await.insert(
                    req.vm_name.clone(),
                    Arc::new(Mutex::new(ManagedVm {
                        record,
                        adapter: Some(adapter),
                        transport_handle: Some(transport_handle),
                    })),
                );
                Ok(())
            }
            Err(e) => {
                let _ = VmRecord::delete(&self.config.state_dir, &req.vm_name);
                self.teardown_tap_and_ports(&tap_device, &forwards).await;
                Err(e)
            }
        }
    }

    async fn boot(
        &self,
        req: &CreateVmRequest,
        record: &VmRecord,
        vsock_socket_path: &std::path::Path,
        cid: u32,
        root_source: &RootSource,
    ) -> Result<(HypervisorAdapter, tokio::task::JoinHandle<()>)> {
        let adapter = HypervisorAdapter::spawn(&self.config.chv_bin, &record.vm_name, &record.control_socket_path).await?;
        adapter.wait_ready(READY_TIMEOUT).await?;

        let cmdline = build_cmdline(
            root_source,
            self.config.bridge_ip,
            record.guest_ip,
            &record.vm_name,
            req.callback_url.as_deref(),
        );

        let memory_mib = req.memory_mib.unwrap_or_else(|| default_memory_mib(self.config.guest_mem_percentage));
        let spec = CreateVmSpec {
            vcpus: req.vcpus.unwrap_or(1),
            memory_mib,
            kernel: self.config.kernel.clone(),
            initramfs: self.config.initramfs.clone(),
            cmdline,
            tap_device: record.tap_device.clone(),
            guest_mac: mac_for(&record.vm_name),
            stateful_disk_path: record.stateful_disk_path.clone(),
            vsock_socket_path: vsock_socket_path.to_path_buf(),
            vsock_cid: cid,
        };
        adapter.create_vm(&spec).await?;
        adapter.boot_vm().await?;

        let bridge = crate::transport::TransportBridge::bind(vsock_socket_path, CALLBACK_VSOCK_PORT, &record.vm_name).await?;
        let sessions = self.sessions.clone();
        let transport_handle = tokio::spawn(bridge.run(sessions));

        Ok((adapter, transport_handle))
    }

    /// Pauses a running VM.
    pub async fn pause(&self, vm_name: &str) -> Result<VmRecord> {
        let entry = self.find(vm_name).await?;
        let mut guard = entry.lock().await;
        if guard.record.state != VmState::Running {
            return Err(Error::Conflict(format!("{vm_name} is not running")));
        }
        let adapter = guard.adapter.as_ref().ok_or_else(|| Error::Internal("missing adapter handle".into()))?;
        adapter.pause_vm().await?;
        guard.record.state = VmState::Paused;
        guard.record.save(&self.config.state_dir)?;
        Ok(guard.record.clone())
    }

    /// Resumes a paused VM.
    pub async fn resume(&self, vm_name: &str) -> Result<VmRecord> {
        let entry = self.find(vm_name).await?;
        let mut guard = entry.lock().await;
        if guard.record.state != VmState::Paused {
            return Err(Error::Conflict(format!("{vm_name} is not paused")));
        }
        let adapter = guard.adapter.as_ref().ok_or_else(|| Error::Internal("missing adapter handle".into()))?;
        adapter.resume_vm().await?;
        guard.record.state = VmState::Running;
        guard.record.save(&self.config.state_dir)?;
        Ok(guard.record.clone())
    }

    /// Gracefully shuts the guest down, keeping its record (and reserved
    /// resources) around for a future [`VmManager::destroy`].
    pub async fn stop(&self, vm_name: &str) -> Result<VmRecord> {
        let entry = self.find(vm_name).await?;
        let mut guard = entry.lock().await;
        if matches!(guard.record.state, VmState::Stopped) {
            return Ok(guard.record.clone());
        }
        guard.record.state = VmState::Stopping;
        guard.record.save(&self.config.state_dir)?;

        if let Some(handle) = guard.transport_handle.take() {
            handle.abort();
        }
        if let Some(adapter) = guard.adapter.take() {
            if let Err(e) = adapter.shutdown_vm().await {
                warn!(vm_name, error = %e, "graceful shutdown failed, forcing destroy");
            }
            adapter.destroy().await?;
        }

        guard.record.state = VmState::Stopped;
        guard.record.hypervisor_pid = None;
        guard.record.save(&self.config.state_dir)?;
        Ok(guard.record.clone())
    }

    /// Stops (if needed) and permanently removes a VM, releasing its IP,
    /// ports, tap device, and persisted record.
    pub async fn destroy(&self, vm_name: &str) -> Result<()> {
        self.stop(vm_name).await?;
        let entry = self.find(vm_name).await?;
        let record = entry.lock().await.record.clone();

        self.net.destroy_tap(&record.tap_device)?;
        {
            let ports = self.ports.lock().await;
            for fwd in &record.port_forwards {
                let _ = ports.uninstall(fwd.host_port, record.guest_ip, fwd.guest_port);
            }
        }
        let mut ports = self.ports.lock().await;
        for fwd in &record.port_forwards {
            ports.release(fwd.host_port);
        }
        drop(ports);
        self.ip_allocator.lock().await.release(record.guest_ip);
        VmRecord::delete(&self.config.state_dir, vm_name)?;
        self.vms.write().await.remove(vm_name);
        Ok(())
    }

    /// Destroys every known VM. Best-effort: a failure destroying one VM is
    /// logged and does not stop the sweep from reaching the rest.
    pub async fn destroy_all(&self) -> Result<()> {
        let names: Vec<String> = self.vms.read().await.keys().cloned().collect();
        for name in names {
            if let Err(e) = self.destroy(&name).await {
                warn!(vm_name = %name, error = %e, "failed to destroy VM during destroy_all");
            }
        }
        Ok(())
    }

    /// Asks the hypervisor to snapshot a running VM.
    pub async fn snapshot(&self, vm_name: &str, snapshot_id: &str) -> Result<()> {
        let entry = self.find(vm_name).await?;
        let guard = entry.lock().await;
        let adapter = guard.adapter.as_ref().ok_or_else(|| Error::Conflict(format!("{vm_name} is not running")))?;
        let dest = self.config.state_dir.join(vm_name).join("snapshots").join(snapshot_id);
        adapter.snapshot_vm(&dest).await
    }

    /// Routes a guest callback to the VM's current client session.
    pub async fn route_callback(&self, vm_name: &str, request: CallbackRequest) -> Result<CallbackResponse> {
        self.find(vm_name).await?;
        self.sessions.dispatch(vm_name, request).await
    }

    async fn teardown_tap_and_ports(&self, tap_device: &str, forwards: &[vmfleet_net::Forward]) {
        let _ = self.net.destroy_tap(tap_device);
        let mut ports = self.ports.lock().await;
        for fwd in forwards {
            ports.release(fwd.host_port);
        }
    }
}

/// Callback port every guest connects to on the multiplexed vsock socket.
const CALLBACK_VSOCK_PORT: u16 = 9999;

/// Builds the bit-exact kernel command line from §4.5. Pure and
/// deterministic: identical inputs always produce an identical string.
fn build_cmdline(
    root_source: &RootSource,
    gateway: Ipv4Addr,
    guest_ip: Ipv4Addr,
    vm_name: &str,
    callback_url: Option<&str>,
) -> String {
    let mut cmdline = format!(
        "console=ttyS0 root=/dev/nfs nfsroot={}:{},nfsvers=3,tcp,nolock,port={} ip=dhcp rw gateway_ip=\"{gateway}\" guest_ip=\"{guest_ip}\" vm_name=\"{vm_name}\"",
        root_source.server, root_source.path, root_source.port,
    );
    if let Some(url) = callback_url {
        cmdline.push_str(&format!(" callback_url=\"{url}\""));
    }
    cmdline
}

/// Reads total host RAM from `/proc/meminfo` and returns `percentage` of it,
/// in MiB. Falls back to a conservative 512 MiB if the file is unreadable.
fn default_memory_mib(percentage: u8) -> u64 {
    let total_kb = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|text| {
            text.lines().find_map(|line| {
                line.strip_prefix("MemTotal:")
                    .and_then(|rest| rest.trim().split_whitespace().next())
                    .and_then(|kb| kb.parse::<u64>().ok())
            })
        });
    match total_kb {
        Some(kb) => (kb / 1024) * u64::from(percentage) / 100,
        None => 512,
    }
}

fn mac_for(vm_name: &str) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    vm_name.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    format!("02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2], bytes[3], bytes[4])
}

async fn create_stateful_disk(path: &std::path::Path, size_mb: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = tokio::fs::File::create(path).await?;
    file.set_len(size_mb * 1024 * 1024).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_for_is_deterministic_and_locally_administered() {
        let a = mac_for("alpha");
        let b = mac_for("alpha");
        assert_eq!(a, b);
        assert!(a.starts_with("02:"));
    }

    fn sample_root_source() -> RootSource {
        RootSource {
            server: "127.0.0.1".into(),
            port: 11111,
            path: "/export/root".into(),
        }
    }

    #[test]
    fn cmdline_is_bit_exact_and_deterministic() {
        let gateway = Ipv4Addr::new(10, 20, 1, 1);
        let guest_ip = Ipv4Addr::new(10, 20, 1, 2);
        let first = build_cmdline(&sample_root_source(), gateway, guest_ip, "alpha", None);
        let second = build_cmdline(&sample_root_source(), gateway, guest_ip, "alpha", None);
        assert_eq!(first, second);
        assert_eq!(
            first,
            "console=ttyS0 root=/dev/nfs nfsroot=127.0.0.1:/export/root,nfsvers=3,tcp,nolock,port=11111 ip=dhcp rw gateway_ip=\"10.20.1.1\" guest_ip=\"10.20.1.2\" vm_name=\"alpha\""
        );
    }

    #[test]
    fn cmdline_appends_callback_url_when_present() {
        let gateway = Ipv4Addr::new(10, 20, 1, 1);
        let guest_ip = Ipv4Addr::new(10, 20, 1, 2);
        let cmdline = build_cmdline(&sample_root_source(), gateway, guest_ip, "alpha", Some("http://1.2.3.4:9000/cb"));
        assert!(cmdline.ends_with(" callback_url=\"http://1.2.3.4:9000/cb\""));
    }
}
