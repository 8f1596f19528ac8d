/// Each transition consumes the previous state

use rustjail::exec::bootstrap::{Collaborators, KernelHost, Sandbox};
use rustjail::exec::handshake::HandshakeChannel;
use rustjail::kernel::mount::MountFilesystem;
use rustjail::kernel::net::KernelNetwork;
use rustjail::kernel::privilege::{EffectivePolicy, KernelBackend, PrivilegeEngine};
use rustjail::kernel::seccomp::HelperCompiler;
use rustjail::safety::run_files::RunFiles;
use rustjail::SessionConfig;

fn main() {
    let config = SessionConfig::default();
    let (_controller, child) = HandshakeChannel::open().unwrap().split();
    let privileges = PrivilegeEngine::new(
        EffectivePolicy::from_config(&config),
        config.user,
        Box::new(KernelBackend),
        RunFiles::new("/tmp/rustjail-mnt"),
    );
    let mut host = KernelHost;
    let mut fs = MountFilesystem::new("/tmp/rustjail-mnt");
    let mut net = KernelNetwork::new();
    let mut compiler = HelperCompiler::new(&config.filter_helper, config.user);
    let deps = Collaborators {
        host: &mut host,
        fs: &mut fs,
        net: &mut net,
        compiler: &mut compiler,
    };
    let sandbox = Sandbox::new(&config, child, privileges, deps);

    let ready = sandbox.await_namespaces();
    let _again = sandbox.await_namespaces();
    drop(ready);
}
