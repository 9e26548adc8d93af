//! Runtime configuration.
//!
//! A [`Config`] is a plain value parsed at startup and passed down to the
//! components that need it. Every key has a default; a TOML file and
//! `IBFABRIC_*` environment variables may override them.

use std::env;
use std::io::prelude::*;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Number of scatter/gather entries per work request.
pub const MAX_SGE: u32 = 1;

/// Length of the global routing header prepended to UD receives.
pub const UD_GRH_SIZE: usize = 40;

/// Fixed operand size of RDMA atomics, in bytes.
pub const ATOMICS_SIZE: usize = 8;

/// Largest RC message posted inline.
pub const MAX_RC_INLINE_SEND: u32 = 220;

/// Largest UD message posted inline.
pub const MAX_UD_INLINE_SEND: u32 = 188;

/// Sleep interval while waiting for control-plane readiness.
pub const SLEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Runtime configuration values.
///
/// The field names follow the configuration keys they are set from
/// (`RDMA_MEMSIZE` becomes `memsize`, and so on).
#[derive(Debug, Clone)]
pub struct Config {
    /// Default memory region size in bytes (`RDMA_MEMSIZE`).
    pub memsize: usize,

    /// NUMA node for host memory regions (`RDMA_NUMAREGION`).
    pub numa_region: u32,

    /// HCA port index (`RDMA_IBPORT`).
    pub ib_port: u8,

    /// Comma-separated default targets (`RDMA_SERVER_ADDRESSES`).
    pub server_addresses: Vec<String>,

    /// Control-plane TCP port (`RDMA_PORT`).
    pub port: u16,

    /// Maximum outstanding work requests per QP (`RDMA_MAX_WR`).
    pub max_wr: u32,

    /// UD path MTU (`RDMA_UD_MTU`).
    pub ud_mtu: u32,

    /// Sequencer address (`SEQUENCER_IP`, `SEQUENCER_PORT`).
    pub sequencer_ip: String,
    pub sequencer_port: u16,

    /// Network interface used for address lookup (`RDMA_INTERFACE`).
    pub interface: String,

    /// Retry budget for node-id directory lookups
    /// (`RDMA_GET_NODE_ID_RETRIES`).
    pub get_node_id_retries: u32,

    /// GID table index to use, if the fabric requires global routing.
    pub gid_index: Option<u8>,

    /// RDMA device name pattern; the first matching device is used.
    pub device_name: Option<String>,

    /// Exported into the environment to disable the HCA driver's queue
    /// spinlocks (`MLX5_SINGLE_THREADED`).
    pub mlx5_single_threaded: u32,

    /// Connect/send/receive timeouts of control-plane sockets.
    pub proto_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memsize: 8 << 30,
            numa_region: 1,
            ib_port: 1,
            server_addresses: Vec::new(),
            port: 5200,
            max_wr: 4096,
            ud_mtu: 4096,
            sequencer_ip: "127.0.0.1".to_owned(),
            sequencer_port: 5600,
            interface: "ib1".to_owned(),
            get_node_id_retries: 5,
            gid_index: None,
            device_name: None,
            mlx5_single_threaded: 1,
            proto_timeout: Duration::from_millis(50),
        }
    }
}

impl Config {
    /// Build a configuration from the defaults, then the given TOML file
    /// (if any), then the process environment, each layer overriding the
    /// previous one. Also exports `MLX5_SINGLE_THREADED`.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut config = Config::default();
        if let Some(path) = config_file {
            config.apply_file(path)?;
        }
        config.apply_env();
        env::set_var(
            "MLX5_SINGLE_THREADED",
            config.mlx5_single_threaded.to_string(),
        );
        Ok(config)
    }

    /// The sequencer's `ip:port` address string.
    pub fn sequencer_addr(&self) -> String {
        format!("{}:{}", self.sequencer_ip, self.sequencer_port)
    }

    fn apply_file(&mut self, path: &str) -> Result<()> {
        let mut file = std::fs::File::open(path)?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;
        self.apply_toml(&toml_str)
    }

    fn apply_toml(&mut self, toml_str: &str) -> Result<()> {
        let toml: toml::Value = toml::from_str(toml_str)
            .map_err(|e| Error::InvalidArg(format!("bad configuration file: {}", e)))?;
        let Some(table) = toml.get("ibfabric").and_then(|v| v.as_table()) else {
            return Err(Error::InvalidArg(
                "ibfabric configuration table not found".to_owned(),
            ));
        };

        for (key, value) in table {
            match key.as_str() {
                "memsize" => self.memsize = int_value(value)? as usize,
                "numa_region" => self.numa_region = int_value(value)? as u32,
                "ib_port" => self.ib_port = int_value(value)? as u8,
                "server_addresses" => {
                    self.server_addresses = str_value(value)?
                        .split(',')
                        .map(|s| s.trim().to_owned())
                        .filter(|s| !s.is_empty())
                        .collect()
                }
                "port" => self.port = int_value(value)? as u16,
                "max_wr" => self.max_wr = int_value(value)? as u32,
                "ud_mtu" => self.ud_mtu = int_value(value)? as u32,
                "sequencer_ip" => self.sequencer_ip = str_value(value)?.to_owned(),
                "sequencer_port" => self.sequencer_port = int_value(value)? as u16,
                "interface" => self.interface = str_value(value)?.to_owned(),
                "get_node_id_retries" => self.get_node_id_retries = int_value(value)? as u32,
                "gid_index" => self.gid_index = Some(int_value(value)? as u8),
                "device_name" => self.device_name = Some(str_value(value)?.to_owned()),
                "mlx5_single_threaded" => self.mlx5_single_threaded = int_value(value)? as u32,
                other => {
                    log::warn!("unknown configuration key '{}'", other);
                }
            }
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        fn env_parse<T: std::str::FromStr>(key: &str, into: &mut T) {
            if let Ok(value) = env::var(key) {
                match value.parse() {
                    Ok(v) => *into = v,
                    Err(_) => log::warn!("ignoring unparsable {}='{}'", key, value),
                }
            }
        }

        env_parse("IBFABRIC_MEMSIZE", &mut self.memsize);
        env_parse("IBFABRIC_NUMAREGION", &mut self.numa_region);
        env_parse("IBFABRIC_IBPORT", &mut self.ib_port);
        env_parse("IBFABRIC_PORT", &mut self.port);
        env_parse("IBFABRIC_MAX_WR", &mut self.max_wr);
        env_parse("IBFABRIC_UD_MTU", &mut self.ud_mtu);
        env_parse("IBFABRIC_SEQUENCER_IP", &mut self.sequencer_ip);
        env_parse("IBFABRIC_SEQUENCER_PORT", &mut self.sequencer_port);
        env_parse("IBFABRIC_INTERFACE", &mut self.interface);
        env_parse(
            "IBFABRIC_GET_NODE_ID_RETRIES",
            &mut self.get_node_id_retries,
        );
        if let Ok(value) = env::var("IBFABRIC_GID_INDEX") {
            match value.parse() {
                Ok(v) => self.gid_index = Some(v),
                Err(_) => log::warn!("ignoring unparsable IBFABRIC_GID_INDEX='{}'", value),
            }
        }
        if let Ok(value) = env::var("IBFABRIC_SERVER_ADDRESSES") {
            self.server_addresses = value
                .split(',')
                .map(|s| s.trim().to_owned())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// Look up the first IPv4 address assigned to the given network
    /// interface.
    pub fn interface_ip(interface: &str) -> Result<Ipv4Addr> {
        // SAFETY: FFI; `ifap` is only read back after a successful call and
        // released with `freeifaddrs`.
        unsafe {
            let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
            if libc::getifaddrs(&mut ifap) != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }

            let mut cur = ifap;
            let mut found = None;
            while !cur.is_null() {
                let entry = &*cur;
                cur = entry.ifa_next;

                if entry.ifa_addr.is_null() {
                    continue;
                }
                if (*entry.ifa_addr).sa_family != libc::AF_INET as libc::sa_family_t {
                    continue;
                }
                let name = std::ffi::CStr::from_ptr(entry.ifa_name);
                if name.to_string_lossy() != interface {
                    continue;
                }
                let addr_in = entry.ifa_addr as *const libc::sockaddr_in;
                found = Some(Ipv4Addr::from(u32::from_be((*addr_in).sin_addr.s_addr)));
                break;
            }
            libc::freeifaddrs(ifap);

            found.ok_or_else(|| {
                Error::InvalidArg(format!("interface '{}' has no IPv4 address", interface))
            })
        }
    }
}

fn int_value(value: &toml::Value) -> Result<i64> {
    value
        .as_integer()
        .ok_or_else(|| Error::InvalidArg(format!("expected integer, got '{}'", value)))
}

fn str_value(value: &toml::Value) -> Result<&str> {
    value
        .as_str()
        .ok_or_else(|| Error::InvalidArg(format!("expected string, got '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.memsize, 8 << 30);
        assert_eq!(config.port, 5200);
        assert_eq!(config.max_wr, 4096);
        assert_eq!(config.sequencer_port, 5600);
        assert_eq!(config.interface, "ib1");
        assert_eq!(config.get_node_id_retries, 5);
    }

    #[test]
    fn toml_overrides() {
        let mut config = Config::default();
        config
            .apply_toml(
                r#"
                [ibfabric]
                memsize = 1048576
                port = 6200
                server_addresses = "10.0.0.1:6200, 10.0.0.2:6200"
                gid_index = 3
                "#,
            )
            .unwrap();
        assert_eq!(config.memsize, 1048576);
        assert_eq!(config.port, 6200);
        assert_eq!(
            config.server_addresses,
            vec!["10.0.0.1:6200".to_owned(), "10.0.0.2:6200".to_owned()]
        );
        assert_eq!(config.gid_index, Some(3));
        // Untouched keys keep their defaults.
        assert_eq!(config.max_wr, 4096);
    }

    #[test]
    fn toml_without_table_is_rejected() {
        let mut config = Config::default();
        assert!(config.apply_toml("memsize = 4096").is_err());
    }

    #[test]
    fn loopback_interface_lookup() {
        assert_eq!(
            Config::interface_ip("lo").unwrap(),
            Ipv4Addr::new(127, 0, 0, 1)
        );
    }
}
