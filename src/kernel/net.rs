/// Network setup inside the sandbox network namespace
/// Interface configuration goes through ioctl on a datagram socket; packet
/// filters, IPv6 addresses, routes and ARP probing are delegated to the
/// standard host tools.
use crate::config::types::{
    BridgeConfig, JailError, MacAddr, NetworkConfig, NetworkMode, Result, SoftWarning,
};
use std::io::Write;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const NETNS_RUN_DIR: &str = "/var/run/netns";
const ARPHRD_ETHER: libc::sa_family_t = 1;

/// Client filter used when packet filtering is enabled without a rules file
pub const DEFAULT_CLIENT_FILTER: &str = "*filter
:INPUT DROP [0:0]
:FORWARD DROP [0:0]
:OUTPUT ACCEPT [0:0]
-A INPUT -i lo -j ACCEPT
-A INPUT -m state --state RELATED,ESTABLISHED -j ACCEPT
-A INPUT -p icmp --icmp-type destination-unreachable -j ACCEPT
-A INPUT -p icmp --icmp-type time-exceeded -j ACCEPT
-A INPUT -p icmp --icmp-type echo-request -j ACCEPT
COMMIT
";

/// Network collaborator driven by the bootstrap
pub trait NetworkEngine {
    /// Load iptables (or ip6tables when `ipv6`) rules.
    fn install_netfilter(&mut self, rules: &str, ipv6: bool) -> Result<()>;
    fn interface_up(&mut self, device: &str) -> Result<()>;
    fn set_mac(&mut self, device: &str, mac: MacAddr) -> Result<()>;
    fn configure_interface(
        &mut self,
        device: &str,
        address: Ipv4Addr,
        mask: Ipv4Addr,
        mtu: Option<u32>,
    ) -> Result<()>;
    /// True when another host already answers for `address`.
    fn address_in_use(&mut self, device: &str, address: Ipv4Addr) -> Result<bool>;
    fn announce(&mut self, device: &str, address: Ipv4Addr) -> Result<()>;
    fn add_ipv6(&mut self, device: &str, address: &str) -> Result<()>;
    fn add_default_route(&mut self, gateway: Ipv4Addr) -> Result<()>;
    fn join_namespace(&mut self, name: &str) -> Result<()>;
}

/// Outcome of the network step
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetworkReport {
    /// Sandbox addresses configured per device
    pub addresses: Vec<(String, Ipv4Addr)>,
    pub gateway_failed: bool,
    pub warnings: Vec<SoftWarning>,
}

/// Read packet filter rules, falling back to the built-in client filter.
pub fn netfilter_rules(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            JailError::Network(format!("cannot read netfilter file {}: {}", path.display(), e))
        }),
        None => Ok(DEFAULT_CLIENT_FILTER.to_string()),
    }
}

/// Packet filters are only built when a bridge is attached.
pub fn build_netfilter(engine: &mut dyn NetworkEngine, config: &NetworkConfig) -> Result<()> {
    if !config.any_bridge() {
        return Ok(());
    }
    if config.enable_netfilter || config.netfilter.is_some() {
        let rules = netfilter_rules(config.netfilter.as_deref())?;
        engine.install_netfilter(&rules, false)?;
        log::debug!("Installed IPv4 packet filter");
    }
    if let Some(path) = &config.netfilter6 {
        let rules = netfilter_rules(Some(path))?;
        engine.install_netfilter(&rules, true)?;
        log::debug!("Installed IPv6 packet filter");
    }
    Ok(())
}

/// Hosts of the bridge network, excluding network and broadcast addresses.
pub fn subnet_hosts(host_ip: Ipv4Addr, mask: Ipv4Addr) -> impl Iterator<Item = Ipv4Addr> {
    let mask = u32::from(mask);
    let network = u32::from(host_ip) & mask;
    let broadcast = network | !mask;
    let first = network.saturating_add(1);
    (first..broadcast).map(Ipv4Addr::from)
}

/// First free address of the bridge network, probed over ARP.
pub fn arp_assign(engine: &mut dyn NetworkEngine, bridge: &BridgeConfig) -> Result<Ipv4Addr> {
    for candidate in subnet_hosts(bridge.host_ip, bridge.mask) {
        if candidate == bridge.host_ip {
            continue;
        }
        if !engine.address_in_use(&bridge.sandbox_device, candidate)? {
            log::debug!(
                "Assigned {} to {} by ARP scan",
                candidate,
                bridge.sandbox_device
            );
            return Ok(candidate);
        }
    }
    Err(JailError::Network(format!(
        "no free address on the network of {}",
        bridge.host_device
    )))
}

fn reject_host_address(bridge: &BridgeConfig, address: Ipv4Addr) -> Result<()> {
    if address == bridge.host_ip {
        return Err(JailError::Network(format!(
            "{} is interface {} address",
            address, bridge.host_device
        )));
    }
    Ok(())
}

fn bridge_up(engine: &mut dyn NetworkEngine, bridge: &BridgeConfig) -> Result<Option<Ipv4Addr>> {
    let dev = bridge.sandbox_device.as_str();
    engine.interface_up(dev)?;

    let address = if bridge.no_ip {
        None
    } else if !bridge.macvlan {
        let address = bridge.sandbox_ip.ok_or_else(|| {
            JailError::Network(format!("no address configured for {}", dev))
        })?;
        reject_host_address(bridge, address)?;
        Some(address)
    } else {
        match bridge.sandbox_ip {
            None => Some(arp_assign(engine, bridge)?),
            Some(address) => {
                reject_host_address(bridge, address)?;
                if engine.address_in_use(dev, address)? {
                    return Err(JailError::Network(format!(
                        "the address {} is already in use",
                        address
                    )));
                }
                Some(address)
            }
        }
    };

    if let Some(address) = address {
        log::debug!("Configuring {} address on interface {}", address, dev);
        engine.configure_interface(dev, address, bridge.mask, bridge.mtu)?;
        if let Err(e) = engine.announce(dev, address) {
            log::warn!("ARP announce for {} failed: {}", address, e);
        }
    }

    if let Some(ipv6) = &bridge.ipv6 {
        engine.add_ipv6(dev, ipv6)?;
    }
    Ok(address)
}

/// Bring up the sandbox side of the network according to its mode.
pub fn configure_network(
    engine: &mut dyn NetworkEngine,
    config: &NetworkConfig,
) -> Result<NetworkReport> {
    let mut report = NetworkReport::default();

    match &config.mode {
        NetworkMode::Host => {}
        NetworkMode::None => {
            engine.interface_up("lo")?;
            log::debug!("Network namespace enabled, only loopback interface available");
        }
        NetworkMode::Namespace(name) => {
            engine.join_namespace(name)?;
            log::debug!("Network namespace '{}' activated", name);
        }
        NetworkMode::Bridged => {
            engine.interface_up("lo")?;
            for bridge in &config.bridges {
                if let Some(mac) = bridge.mac {
                    if mac != MacAddr([0; 6]) {
                        engine.set_mac(&bridge.sandbox_device, mac)?;
                    }
                }
                if let Some(address) = bridge_up(engine, bridge)? {
                    report
                        .addresses
                        .push((bridge.sandbox_device.clone(), address));
                }
            }

            // Moving an interface into the namespace resets its configuration.
            for iface in &config.interfaces {
                if let Some(address) = iface.address {
                    let mask = iface.mask.unwrap_or(Ipv4Addr::new(255, 255, 255, 0));
                    engine.configure_interface(&iface.device, address, mask, iface.mtu)?;
                    report.addresses.push((iface.device.clone(), address));
                }
            }

            if let Some(gateway) = config.default_gateway {
                if let Err(e) = engine.add_default_route(gateway) {
                    let warning = SoftWarning::DefaultRouteFailed(e.to_string());
                    log::warn!("{}", warning);
                    report.gateway_failed = true;
                    report.warnings.push(warning);
                }
            }
            log::debug!("Network namespace enabled");
        }
    }

    print_network(config, &report);
    Ok(report)
}

fn print_network(config: &NetworkConfig, report: &NetworkReport) {
    for (device, address) in &report.addresses {
        log::info!("Interface {} {}", device, address);
    }
    if let Some(gateway) = config.default_gateway {
        if report.gateway_failed {
            log::info!("Default gateway configuration failed");
        } else {
            log::info!("Default gateway {}", gateway);
        }
    }
    for server in &config.dns {
        log::info!("DNS server {}", server);
    }
}

/// Engine acting on the current network namespace
#[derive(Debug, Default)]
pub struct KernelNetwork;

impl KernelNetwork {
    pub fn new() -> Self {
        KernelNetwork
    }
}

/// Datagram socket used as an ioctl handle, closed on drop
struct IoctlSocket(libc::c_int);

impl IoctlSocket {
    fn open() -> Result<Self> {
        // SAFETY: plain socket(2) call, the fd is owned by the returned value.
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM | libc::SOCK_CLOEXEC, 0) };
        if sock < 0 {
            return Err(JailError::Network(format!(
                "Failed to open socket for interface setup: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(IoctlSocket(sock))
    }

    fn ioctl(&self, request: libc::c_ulong, ifr: &mut libc::ifreq, what: &str) -> Result<()> {
        // SAFETY: ifr is a valid, initialized ifreq for the duration of the call.
        let rc = unsafe { libc::ioctl(self.0, request as _, ifr as *mut libc::ifreq) };
        if rc != 0 {
            return Err(JailError::Network(format!(
                "{}: {}",
                what,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

impl Drop for IoctlSocket {
    fn drop(&mut self) {
        // SAFETY: the fd was returned by socket(2) and is closed once.
        if unsafe { libc::close(self.0) } != 0 {
            log::warn!(
                "Failed to close interface setup socket cleanly: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

fn ifreq_for(device: &str) -> Result<libc::ifreq> {
    // SAFETY: ifreq is plain old data, all-zero is a valid value.
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let name = device.as_bytes();
    if name.is_empty() || name.len() >= ifr.ifr_name.len() || name.contains(&0) {
        return Err(JailError::Network(format!("invalid interface name {:?}", device)));
    }
    for (idx, b) in name.iter().enumerate() {
        ifr.ifr_name[idx] = *b as libc::c_char;
    }
    Ok(ifr)
}

fn inet_sockaddr(address: Ipv4Addr) -> libc::sockaddr {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: 0,
        sin_addr: libc::in_addr {
            s_addr: u32::from(address).to_be(),
        },
        sin_zero: [0; 8],
    };
    // SAFETY: both are plain old data and sockaddr_in is no larger than
    // sockaddr, so the copy stays inside `addr`.
    unsafe {
        let mut addr: libc::sockaddr = std::mem::zeroed();
        std::ptr::copy_nonoverlapping(
            &sin as *const libc::sockaddr_in as *const u8,
            &mut addr as *mut libc::sockaddr as *mut u8,
            std::mem::size_of::<libc::sockaddr_in>(),
        );
        addr
    }
}

fn run_tool(program: &str, args: &[&str], stdin: Option<&str>) -> Result<std::process::ExitStatus> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::null())
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

    let mut child = command
        .spawn()
        .map_err(|e| JailError::Network(format!("cannot run {}: {}", program, e)))?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes())?;
    }
    Ok(child.wait()?)
}

fn run_checked(program: &str, args: &[&str], stdin: Option<&str>) -> Result<()> {
    let status = run_tool(program, args, stdin)?;
    if !status.success() {
        return Err(JailError::Network(format!(
            "{} {} failed with {}",
            program,
            args.join(" "),
            status
        )));
    }
    Ok(())
}

impl NetworkEngine for KernelNetwork {
    fn install_netfilter(&mut self, rules: &str, ipv6: bool) -> Result<()> {
        let tool = if ipv6 { "ip6tables-restore" } else { "iptables-restore" };
        run_checked(tool, &[], Some(rules))
    }

    fn interface_up(&mut self, device: &str) -> Result<()> {
        let sock = IoctlSocket::open()?;
        let mut ifr = ifreq_for(device)?;
        sock.ioctl(
            libc::SIOCGIFFLAGS as libc::c_ulong,
            &mut ifr,
            &format!("Failed to query {} flags", device),
        )?;

        // SAFETY: SIOCGIFFLAGS filled the flags member of the union.
        let current_flags = unsafe { ifr.ifr_ifru.ifru_flags } as libc::c_int;
        ifr.ifr_ifru.ifru_flags = (current_flags | libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        sock.ioctl(
            libc::SIOCSIFFLAGS as libc::c_ulong,
            &mut ifr,
            &format!("Failed to bring up {}", device),
        )?;

        log::debug!("Interface {} up", device);
        Ok(())
    }

    fn set_mac(&mut self, device: &str, mac: MacAddr) -> Result<()> {
        let sock = IoctlSocket::open()?;
        let mut ifr = ifreq_for(device)?;
        // SAFETY: writing plain data into the hwaddr member of the union.
        unsafe {
            ifr.ifr_ifru.ifru_hwaddr.sa_family = ARPHRD_ETHER;
            for (idx, b) in mac.0.iter().enumerate() {
                ifr.ifr_ifru.ifru_hwaddr.sa_data[idx] = *b as libc::c_char;
            }
        }
        sock.ioctl(
            libc::SIOCSIFHWADDR as libc::c_ulong,
            &mut ifr,
            &format!("Failed to set MAC address of {}", device),
        )?;
        log::debug!("MAC address {} set on {}", mac, device);
        Ok(())
    }

    fn configure_interface(
        &mut self,
        device: &str,
        address: Ipv4Addr,
        mask: Ipv4Addr,
        mtu: Option<u32>,
    ) -> Result<()> {
        let sock = IoctlSocket::open()?;

        let mut ifr = ifreq_for(device)?;
        ifr.ifr_ifru.ifru_addr = inet_sockaddr(address);
        sock.ioctl(
            libc::SIOCSIFADDR as libc::c_ulong,
            &mut ifr,
            &format!("Failed to set address of {}", device),
        )?;

        let mut ifr = ifreq_for(device)?;
        ifr.ifr_ifru.ifru_netmask = inet_sockaddr(mask);
        sock.ioctl(
            libc::SIOCSIFNETMASK as libc::c_ulong,
            &mut ifr,
            &format!("Failed to set netmask of {}", device),
        )?;

        if let Some(mtu) = mtu {
            let mut ifr = ifreq_for(device)?;
            ifr.ifr_ifru.ifru_mtu = mtu as libc::c_int;
            sock.ioctl(
                libc::SIOCSIFMTU as libc::c_ulong,
                &mut ifr,
                &format!("Failed to set MTU of {}", device),
            )?;
        }
        drop(sock);

        self.interface_up(device)
    }

    fn address_in_use(&mut self, device: &str, address: Ipv4Addr) -> Result<bool> {
        // Duplicate address detection: success means nobody answered.
        let address = address.to_string();
        let status = run_tool("arping", &["-D", "-q", "-c", "2", "-I", device, &address], None)?;
        Ok(!status.success())
    }

    fn announce(&mut self, device: &str, address: Ipv4Addr) -> Result<()> {
        let address = address.to_string();
        run_checked("arping", &["-U", "-q", "-c", "1", "-I", device, &address], None)
    }

    fn add_ipv6(&mut self, device: &str, address: &str) -> Result<()> {
        run_checked("ip", &["-6", "addr", "add", address, "dev", device], None)
    }

    fn add_default_route(&mut self, gateway: Ipv4Addr) -> Result<()> {
        let gateway = gateway.to_string();
        run_checked("ip", &["route", "add", "default", "via", &gateway], None)
    }

    fn join_namespace(&mut self, name: &str) -> Result<()> {
        if name.is_empty() || name.contains('/') {
            return Err(JailError::Network(format!("invalid network namespace {:?}", name)));
        }
        let path: PathBuf = Path::new(NETNS_RUN_DIR).join(name);
        let file = std::fs::File::open(&path).map_err(|e| {
            JailError::Network(format!("cannot open network namespace {}: {}", path.display(), e))
        })?;
        // SAFETY: the fd stays open for the duration of the call.
        if unsafe { libc::setns(file.as_raw_fd(), libc::CLONE_NEWNET) } != 0 {
            return Err(JailError::Network(format!(
                "cannot join network namespace {}: {}",
                name,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}
