//! Host system facts for the optional "system context" block.
//!
//! [`HostSystemInfo`] combines two sources:
//!
//! - the vendor SDK (`libkysysinfo.so`), loaded at runtime with `libloading`.
//!   Every `kdk_system_*` symbol is probed on its own, so a partial SDK
//!   still yields the facts it does export.
//! - `/proc` files and a handful of commands (`df`, `lsusb`, `lspci`, `ip`,
//!   `ps`).
//!
//! Every fact in [`SystemReport`] is an `Option`; a missing library, file or
//! command only leaves its field empty. The parsers are pure functions over
//! the raw text so they can be tested without the host.

use std::ffi::{c_char, c_int, CStr};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Local;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SystemInfoConfig;

pub trait SystemInfoProvider: Send + Sync {
    fn report(&self) -> SystemReport;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub size: String,
    pub used: String,
    pub available: String,
    pub use_percent: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetInterface {
    pub name: String,
    pub ipv4: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemReport {
    pub collected_at: String,
    pub architecture: Option<String>,
    pub system_name: Option<String>,
    pub version: Option<String>,
    pub host_name: Option<String>,
    pub word_size: Option<u32>,
    pub kernel: Option<String>,
    pub cpu_model: Option<String>,
    pub hardware_platform: Option<String>,
    pub total_memory_kb: Option<u64>,
    pub root_fs: Option<DiskUsage>,
    pub uptime_secs: Option<u64>,
    pub usb_devices: Option<usize>,
    pub pci_devices: Option<usize>,
    pub network_interfaces: Option<Vec<NetInterface>>,
    pub process_count: Option<usize>,
    pub load_average: Option<String>,
    pub is_kylin: bool,
}

impl SystemReport {
    /// Flatten to `key: value` lines, skipping absent facts.
    pub fn to_context_text(&self) -> String {
        let mut lines = vec![format!("获取时间: {}", self.collected_at)];
        let mut push = |label: &str, value: Option<String>| {
            if let Some(v) = value {
                lines.push(format!("{}: {}", label, v));
            }
        };

        push("系统架构", self.architecture.clone());
        push("系统名称", self.system_name.clone());
        push("系统版本", self.version.clone());
        push("主机名", self.host_name.clone());
        push("系统位数", self.word_size.map(|w| format!("{}位", w)));
        push("内核版本", self.kernel.clone());
        push("CPU型号", self.cpu_model.clone());
        push("硬件平台", self.hardware_platform.clone());
        push("总内存", self.total_memory_kb.map(format_memory));
        if let Some(fs) = &self.root_fs {
            push("根分区大小", Some(fs.size.clone()));
            push("根分区已用", Some(fs.used.clone()));
            push("根分区可用", Some(fs.available.clone()));
            push("根分区使用率", Some(fs.use_percent.clone()));
        }
        push("系统运行时间", self.uptime_secs.map(format_uptime));
        push("USB设备数量", self.usb_devices.map(|n| n.to_string()));
        push("PCI设备数量", self.pci_devices.map(|n| n.to_string()));
        push(
            "网络接口",
            self.network_interfaces.as_ref().map(|ifaces| {
                ifaces
                    .iter()
                    .map(|i| match &i.ipv4 {
                        Some(ip) => format!("{} ({})", i.name, ip),
                        None => i.name.clone(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ")
            }),
        );
        push("进程总数", self.process_count.map(|n| n.to_string()));
        push("系统负载", self.load_average.clone());
        push(
            "是否麒麟系统",
            Some(if self.is_kylin { "是" } else { "否" }.to_string()),
        );

        lines.join("\n")
    }
}

fn format_memory(kb: u64) -> String {
    format!("{:.2} GB", kb as f64 / 1024.0 / 1024.0)
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;
    format!("{}天 {}小时 {}分钟", days, hours, minutes)
}

// ============ Vendor SDK ============

type StringFn = unsafe extern "C" fn() -> *const c_char;
type IntFn = unsafe extern "C" fn() -> c_int;

#[derive(Debug, Default)]
struct SdkFacts {
    architecture: Option<String>,
    system_name: Option<String>,
    version: Option<String>,
    host_name: Option<String>,
    word_size: Option<u32>,
}

struct KylinSdk {
    path: PathBuf,
    library: libloading::Library,
}

impl KylinSdk {
    fn load(candidates: &[PathBuf]) -> Option<Self> {
        for path in candidates.iter().filter(|p| p.exists()) {
            // SAFETY: loading runs the library's initialisers; the vendor
            // SDK is a plain C library without unusual constructors.
            match unsafe { libloading::Library::new(path) } {
                Ok(library) => {
                    info!(path = %path.display(), "loaded system SDK");
                    return Some(Self {
                        path: path.clone(),
                        library,
                    });
                }
                Err(e) => debug!(path = %path.display(), error = %e, "cannot load system SDK"),
            }
        }
        None
    }

    fn string(&self, symbol: &[u8]) -> Option<String> {
        // SAFETY: the kdk_system_* string getters take no arguments and
        // return a NUL-terminated string or NULL.
        unsafe {
            let f = self.library.get::<StringFn>(symbol).ok()?;
            let ptr = f();
            if ptr.is_null() {
                return None;
            }
            let s = CStr::from_ptr(ptr).to_string_lossy().trim().to_string();
            (!s.is_empty()).then_some(s)
        }
    }

    fn int(&self, symbol: &[u8]) -> Option<i32> {
        // SAFETY: the kdk_system_* integer getters take no arguments.
        unsafe {
            let f = self.library.get::<IntFn>(symbol).ok()?;
            Some(f())
        }
    }

    fn facts(&self) -> SdkFacts {
        SdkFacts {
            architecture: self.string(b"kdk_system_get_architecture\0"),
            system_name: self.string(b"kdk_system_get_systemName\0"),
            version: self.string(b"kdk_system_get_version\0"),
            host_name: self.string(b"kdk_system_get_hostName\0"),
            word_size: self
                .int(b"kdk_system_get_word\0")
                .filter(|w| *w > 0)
                .map(|w| w as u32),
        }
    }
}

// ============ Host provider ============

pub struct HostSystemInfo {
    sdk: Option<KylinSdk>,
}

impl HostSystemInfo {
    pub fn new(config: &SystemInfoConfig) -> Self {
        Self {
            sdk: KylinSdk::load(&config.sdk_library_paths),
        }
    }

    pub fn sdk_path(&self) -> Option<&Path> {
        self.sdk.as_ref().map(|s| s.path.as_path())
    }
}

impl SystemInfoProvider for HostSystemInfo {
    fn report(&self) -> SystemReport {
        let sdk = self.sdk.as_ref().map(KylinSdk::facts).unwrap_or_default();
        let (cpu_model, hardware_platform) = read_file("/proc/cpuinfo")
            .map(|s| parse_cpuinfo(&s))
            .unwrap_or((None, None));

        let kernel = read_file("/proc/sys/kernel/osrelease")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| run(&["uname", "-r"]).map(|s| s.trim().to_string()));

        let release_mentions_kylin = ["/etc/kylin-release", "/etc/os-release"]
            .iter()
            .filter_map(|p| read_file(p))
            .any(|content| mentions_kylin(&content));

        SystemReport {
            collected_at: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            architecture: sdk.architecture,
            system_name: sdk.system_name,
            version: sdk.version,
            host_name: sdk.host_name,
            word_size: sdk.word_size,
            kernel,
            cpu_model,
            hardware_platform,
            total_memory_kb: read_file("/proc/meminfo").and_then(|s| parse_meminfo(&s)),
            root_fs: run(&["df", "-h", "/"]).and_then(|s| parse_df(&s)),
            uptime_secs: read_file("/proc/uptime").and_then(|s| parse_uptime(&s)),
            usb_devices: run(&["lsusb"]).map(|s| count_lines(&s)),
            pci_devices: run(&["lspci"]).map(|s| count_lines(&s)),
            network_interfaces: run(&["ip", "addr", "show"]).map(|s| parse_ip_addr(&s)),
            process_count: run(&["ps", "aux"]).map(|s| count_lines(&s).saturating_sub(1)),
            load_average: read_file("/proc/loadavg").and_then(|s| parse_loadavg(&s)),
            is_kylin: release_mentions_kylin || self.sdk.is_some(),
        }
    }
}

fn read_file(path: &str) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Some(s),
        Err(e) => {
            debug!(path, error = %e, "system fact unavailable");
            None
        }
    }
}

fn run(argv: &[&str]) -> Option<String> {
    let (program, args) = argv.split_first()?;
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            debug!(command = *program, status = %out.status, "system command failed");
            None
        }
        Err(e) => {
            debug!(command = *program, error = %e, "system command unavailable");
            None
        }
    }
}

// ============ Parsers ============

/// `(model name, Hardware)` from `/proc/cpuinfo`. ARM kernels report the
/// SoC under `Hardware` instead of `model name`.
pub fn parse_cpuinfo(text: &str) -> (Option<String>, Option<String>) {
    let field = |key: &str| {
        text.lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    (field("model name"), field("Hardware"))
}

/// `MemTotal` in kB.
pub fn parse_meminfo(text: &str) -> Option<u64> {
    text.lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

/// Second line of `df -h /`.
pub fn parse_df(text: &str) -> Option<DiskUsage> {
    let parts: Vec<&str> = text.lines().nth(1)?.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }
    Some(DiskUsage {
        size: parts[1].to_string(),
        used: parts[2].to_string(),
        available: parts[3].to_string(),
        use_percent: parts[4].to_string(),
    })
}

pub fn parse_uptime(text: &str) -> Option<u64> {
    let secs: f64 = text.split_whitespace().next()?.parse().ok()?;
    (secs >= 0.0).then_some(secs as u64)
}

pub fn parse_loadavg(text: &str) -> Option<String> {
    let parts: Vec<&str> = text.split_whitespace().take(3).collect();
    (parts.len() == 3).then(|| parts.join(" "))
}

pub fn count_lines(text: &str) -> usize {
    text.lines().filter(|l| !l.trim().is_empty()).count()
}

/// Interfaces and their first IPv4 address from `ip addr show`.
pub fn parse_ip_addr(text: &str) -> Vec<NetInterface> {
    let mut interfaces: Vec<NetInterface> = Vec::new();
    for line in text.lines() {
        if !line.starts_with(char::is_whitespace) {
            // "2: eth0@if5: <BROADCAST,...> mtu 1500 ..."
            let mut fields = line.splitn(3, ':');
            let (Some(_), Some(name)) = (fields.next(), fields.next()) else {
                continue;
            };
            let name = name.trim().split('@').next().unwrap_or_default();
            if !name.is_empty() {
                interfaces.push(NetInterface {
                    name: name.to_string(),
                    ipv4: None,
                });
            }
        } else if let Some(rest) = line.trim_start().strip_prefix("inet ") {
            if let Some(current) = interfaces.last_mut() {
                if current.ipv4.is_none() {
                    current.ipv4 = rest
                        .split_whitespace()
                        .next()
                        .and_then(|cidr| cidr.split('/').next())
                        .map(str::to_string);
                }
            }
        }
    }
    interfaces
}

pub fn mentions_kylin(release: &str) -> bool {
    release.to_lowercase().contains("kylin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_x86_and_arm_cpuinfo() {
        let x86 = "processor\t: 0\nmodel name\t: Intel(R) Core(TM) i7\nflags\t: fpu\n";
        assert_eq!(parse_cpuinfo(x86), (Some("Intel(R) Core(TM) i7".to_string()), None));

        let arm = "processor\t: 0\nBogoMIPS\t: 100.00\nHardware\t: Phytium FT-2000/4\n";
        assert_eq!(parse_cpuinfo(arm), (None, Some("Phytium FT-2000/4".to_string())));
    }

    #[test]
    fn parses_meminfo_and_formats() {
        let text = "MemTotal:       16303428 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo(text), Some(16_303_428));
        assert_eq!(format_memory(16_303_428), "15.55 GB");
        assert_eq!(parse_meminfo("garbage"), None);
    }

    #[test]
    fn parses_df_output() {
        let text = "Filesystem      Size  Used Avail Use% Mounted on\n/dev/sda2       98G   41G   52G  45% /\n";
        let usage = parse_df(text).unwrap();
        assert_eq!(usage.size, "98G");
        assert_eq!(usage.use_percent, "45%");
        assert!(parse_df("Filesystem only\n").is_none());
    }

    #[test]
    fn parses_uptime_and_loadavg() {
        assert_eq!(parse_uptime("93784.52 180000.10\n"), Some(93_784));
        assert_eq!(format_uptime(93_784), "1天 2小时 3分钟");
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/389 12345\n").as_deref(), Some("0.52 0.58 0.59"));
        assert_eq!(parse_loadavg(""), None);
    }

    #[test]
    fn parses_ip_addr_show() {
        let text = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN
    link/loopback 00:00:00:00:00:00 brd 00:00:00:00:00:00
    inet 127.0.0.1/8 scope host lo
2: eth0@if7: <BROADCAST,MULTICAST,UP> mtu 1500 qdisc noqueue state UP
    link/ether 02:42:ac:11:00:02 brd ff:ff:ff:ff:ff:ff
    inet 172.17.0.2/16 brd 172.17.255.255 scope global eth0
    inet6 fe80::42:acff:fe11:2/64 scope link
3: wlan0: <BROADCAST,MULTICAST> mtu 1500 state DOWN
";
        let ifaces = parse_ip_addr(text);
        assert_eq!(ifaces.len(), 3);
        assert_eq!(ifaces[0].ipv4.as_deref(), Some("127.0.0.1"));
        assert_eq!(ifaces[1].name, "eth0");
        assert_eq!(ifaces[1].ipv4.as_deref(), Some("172.17.0.2"));
        assert_eq!(ifaces[2].ipv4, None);
    }

    #[test]
    fn context_text_skips_absent_facts() {
        let report = SystemReport {
            collected_at: "2026-01-01 00:00:00".to_string(),
            kernel: Some("5.10.0-8-generic".to_string()),
            word_size: Some(64),
            is_kylin: true,
            ..SystemReport::default()
        };
        let text = report.to_context_text();
        assert!(text.contains("内核版本: 5.10.0-8-generic"));
        assert!(text.contains("系统位数: 64位"));
        assert!(text.contains("是否麒麟系统: 是"));
        assert!(!text.contains("CPU型号"));
    }

    #[test]
    fn kylin_detection_is_case_insensitive() {
        assert!(mentions_kylin("NAME=\"Kylin\"\nVERSION=\"V10 (SP1)\""));
        assert!(!mentions_kylin("NAME=\"Ubuntu\""));
    }

    #[test]
    fn missing_sdk_still_reports() {
        let provider = HostSystemInfo::new(&SystemInfoConfig {
            enabled: true,
            sdk_library_paths: vec![PathBuf::from("/nonexistent/libkysysinfo.so")],
        });
        assert!(provider.sdk_path().is_none());
        let report = provider.report();
        assert!(report.architecture.is_none());
        assert!(!report.collected_at.is_empty());
    }
}
