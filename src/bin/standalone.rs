use connect_tunnel::config::{EngineConfig, ProxyConfig, DEFAULT_MTU};
use connect_tunnel::logger::{self, BreadcrumbFlags, LogLevel, StderrSink};
use connect_tunnel::status::{EngineStatus, StatusSink};
use connect_tunnel::TunnelEngine;
use std::env;
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    let settings = Settings::parse()?;
    logger::install_sink(
        Some(Arc::new(StderrSink)),
        settings.log_level,
        BreadcrumbFlags::ALL,
    );

    let tun = tun::open(&settings.tun_name)?;
    eprintln!(
        "[standalone] opened {} (mtu={}). Configure it (as root) via:\n  ip addr add 10.8.0.2/24 dev {name}\n  ip link set dev {name} mtu {} up\n  ip route add 0.0.0.0/0 dev {name}\nand keep a more specific route to the proxy ({}:{}) on your uplink.",
        tun.name,
        settings.mtu,
        settings.mtu,
        settings.proxy.host,
        settings.proxy.port,
        name = tun.name,
    );

    let config = EngineConfig::new(settings.proxy.clone()).with_mtu(settings.mtu);
    let engine = TunnelEngine::new(config)?;
    let (status_tx, statuses) = crossbeam_channel::unbounded::<EngineStatus>();
    let status: Arc<dyn StatusSink> = Arc::new(status_tx);
    engine.start_fd(tun.fd, status, None)?;

    println!("[standalone] engine running. Press Ctrl+C to terminate.");
    // The engine reports once when it starts and once when the session ends.
    for report in statuses.iter() {
        if report.connected {
            continue;
        }
        engine.stop();
        return match report.error {
            Some(error) => Err(anyhow::anyhow!("engine stopped: {error}")),
            None => Ok(()),
        };
    }
    Ok(())
}

#[derive(Debug)]
struct Settings {
    proxy: ProxyConfig,
    mtu: usize,
    tun_name: String,
    log_level: LogLevel,
}

impl Settings {
    fn parse() -> anyhow::Result<Self> {
        let mut proxy = None;
        let mut username = None;
        let mut password = None;
        let mut mtu = DEFAULT_MTU;
        let mut tun_name = "tun0".to_string();
        let mut log_level = LogLevel::Info;
        let mut args = env::args().skip(1);
        while let Some(arg) = args.next() {
            let mut value = || {
                args.next()
                    .ok_or_else(|| anyhow::anyhow!("{arg} requires a value"))
            };
            match arg.as_str() {
                "--proxy" => proxy = Some(parse_proxy(&value()?)?),
                "--user" => username = Some(value()?),
                "--pass" => password = Some(value()?),
                "--mtu" => {
                    mtu = value()?
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid mtu"))?;
                }
                "--tun" => tun_name = value()?,
                "--log-level" => log_level = LogLevel::from_str(&value()?),
                _ => {
                    anyhow::bail!(
                        "unknown argument '{}'. Supported flags: --proxy <host:port>, --user <name>, --pass <secret>, --mtu <value>, --tun <name>, --log-level <level>",
                        arg
                    );
                }
            }
        }

        let mut proxy = proxy.ok_or_else(|| anyhow::anyhow!("--proxy <host:port> is required"))?;
        proxy.username = username;
        proxy.password = password;
        proxy.validate()?;
        Ok(Self {
            proxy,
            mtu,
            tun_name,
            log_level,
        })
    }
}

fn parse_proxy(value: &str) -> anyhow::Result<ProxyConfig> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("proxy must be host:port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = port
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid proxy port '{port}'"))?;
    Ok(ProxyConfig::new(host, port))
}

#[cfg(target_os = "linux")]
mod tun {
    use std::ffi::c_char;
    use std::fs::OpenOptions;
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};

    const IFF_TUN: i16 = 0x0001;
    const IFF_NO_PI: i16 = 0x1000;
    const TUNSETIFF: u64 = 0x4004_54ca;

    /// `struct ifreq` with only the name and flags members used.
    #[repr(C)]
    struct IfReq {
        name: [c_char; libc::IFNAMSIZ],
        flags: i16,
        _pad: [u8; 22],
    }

    pub struct Tun {
        pub fd: OwnedFd,
        pub name: String,
    }

    pub fn open(name: &str) -> io::Result<Tun> {
        if name.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        let mut request = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 22],
        };
        for (slot, byte) in request.name.iter_mut().zip(name.bytes()) {
            *slot = byte as c_char;
        }
        let status = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut request) };
        if status < 0 {
            return Err(io::Error::last_os_error());
        }

        let assigned: Vec<u8> = request
            .name
            .iter()
            .take_while(|byte| **byte != 0)
            .map(|byte| *byte as u8)
            .collect();
        Ok(Tun {
            fd: OwnedFd::from(file),
            name: String::from_utf8_lossy(&assigned).into_owned(),
        })
    }
}

#[cfg(not(target_os = "linux"))]
mod tun {
    use std::io;

    pub struct Tun {
        pub fd: std::os::fd::OwnedFd,
        pub name: String,
    }

    pub fn open(_name: &str) -> io::Result<Tun> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "standalone runner currently supports only Linux",
        ))
    }
}
