// ABOUTME: Shared helpers for integration tests: a shell-scripted kernel kind and service wiring

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kernelpool::auto_exit::AutoExit;
use kernelpool::runtime::ProcessKernelFactory;
use kernelpool::{KernelPool, KernelService, KernelSpec, PoolConfig};

/// Kind name of the scripted shell kernel
pub const SH_KIND: &str = "sh";

/// A kernel written in sh speaking the line protocol
///
/// Every request produces busy, execute_input, one stream line and idle.
/// A request containing `crash` makes the kernel exit mid-execution.
/// SIGINT is ignored so interrupts leave it running.
const SH_KERNEL: &str = r#"
count=0
trap '' INT
while IFS= read -r line; do
  count=$((count + 1))
  printf '%s\n' '{"msg_type":"status","content":{"execution_state":"busy"}}'
  printf '{"msg_type":"execute_input","content":{"code":"echo","execution_count":%d}}\n' "$count"
  case "$line" in
    *crash*) exit 3 ;;
  esac
  printf '{"msg_type":"stream","content":{"name":"stdout","text":"ran %d\\n"}}\n' "$count"
  printf '%s\n' '{"msg_type":"status","content":{"execution_state":"idle"}}'
done
"#;

pub fn sh_spec() -> KernelSpec {
    KernelSpec {
        command: "sh".to_string(),
        args: vec!["-c".to_string(), SH_KERNEL.to_string()],
        env: HashMap::new(),
        cwd: None,
    }
}

/// Default configuration with the sh kernel as default kind
pub fn sh_config() -> PoolConfig {
    let mut kernels = HashMap::new();
    kernels.insert(SH_KIND.to_string(), sh_spec());
    kernels.insert("python3".to_string(), KernelSpec::builtin_python());

    PoolConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        default_kind: SH_KIND.to_string(),
        shutdown_grace: Duration::from_secs(1),
        kernels,
        ..PoolConfig::default()
    }
}

pub fn pool(config: &PoolConfig) -> Arc<KernelPool> {
    Arc::new(KernelPool::new(Arc::new(ProcessKernelFactory::from_config(
        config,
    ))))
}

pub fn service(config: &PoolConfig) -> Arc<KernelService> {
    Arc::new(KernelService::new(
        pool(config),
        Arc::new(AutoExit::from_config(config)),
        &config.default_kind,
    ))
}

pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
