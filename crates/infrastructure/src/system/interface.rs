use ferrous_forward_domain::DomainError;
use tokio::fs;
use tracing::debug;

/// Reads interface facts the DHCP probe needs from procfs and sysfs.
pub struct LinuxInterfaceReader {
    route_path: String,
    sysfs_net: String,
}

impl LinuxInterfaceReader {
    pub fn new() -> Self {
        Self {
            route_path: "/proc/net/route".to_string(),
            sysfs_net: "/sys/class/net".to_string(),
        }
    }

    pub fn with_paths(route_path: impl Into<String>, sysfs_net: impl Into<String>) -> Self {
        Self {
            route_path: route_path.into(),
            sysfs_net: sysfs_net.into(),
        }
    }

    /// Interface carrying the IPv4 default route.
    pub async fn default_route_interface(&self) -> Result<String, DomainError> {
        let content = fs::read_to_string(&self.route_path).await.map_err(|e| {
            DomainError::IoError(format!("Failed to read {}: {}", self.route_path, e))
        })?;
        let interface = parse_default_route(&content).ok_or_else(|| {
            DomainError::NoUpstreamAvailable("no default route interface".to_string())
        })?;
        debug!(interface = %interface, "Default route interface");
        Ok(interface)
    }

    pub async fn mac_address(&self, interface: &str) -> Result<[u8; 6], DomainError> {
        let path = format!("{}/{}/address", self.sysfs_net, interface);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| DomainError::IoError(format!("Failed to read {}: {}", path, e)))?;
        parse_mac(content.trim()).ok_or_else(|| {
            DomainError::IoError(format!("Invalid MAC address for {}: {}", interface, content.trim()))
        })
    }
}

impl Default for LinuxInterfaceReader {
    fn default() -> Self {
        Self::new()
    }
}

// Format of /proc/net/route:
// Iface  Destination  Gateway   Flags  RefCnt  Use  Metric  Mask      MTU  Window  IRTT
// eth0   00000000     0101A8C0  0003   0       0    100     00000000  0    0       0
fn parse_default_route(content: &str) -> Option<String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let up = u16::from_str_radix(fields[3], 16).ok()? & 0x1 != 0;
            let metric: u32 = fields[6].parse().ok()?;
            (fields[1] == "00000000" && fields[7] == "00000000" && up)
                .then(|| (metric, fields[0].to_string()))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface)
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const ROUTES: &str = "Iface\tDestination\tGateway \tFlags\tRefCnt\tUse\tMetric\tMask\t\tMTU\tWindow\tIRTT
wlan0\t00000000\t0101A8C0\t0003\t0\t0\t600\t00000000\t0\t0\t0
eth0\t00000000\t0100000A\t0003\t0\t0\t100\t00000000\t0\t0\t0
eth0\t0000000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\t0\t0\t0
";

    #[test]
    fn test_default_route_lowest_metric() {
        assert_eq!(parse_default_route(ROUTES), Some("eth0".to_string()));
    }

    #[test]
    fn test_no_default_route() {
        let content = "Iface\tDestination\tGateway\tFlags\tRefCnt\tUse\tMetric\tMask\n\
                       eth0\t0000000A\t00000000\t0001\t0\t0\t100\t00FFFFFF\n";
        assert_eq!(parse_default_route(content), None);
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:00:11:ff"),
            Some([0xaa, 0xbb, 0xcc, 0x00, 0x11, 0xff])
        );
        assert_eq!(parse_mac("aa:bb:cc"), None);
        assert_eq!(parse_mac("aa:bb:cc:00:11:ff:00"), None);
        assert_eq!(parse_mac("zz:bb:cc:00:11:ff"), None);
    }

    #[tokio::test]
    async fn test_reads_from_files() {
        let mut routes = NamedTempFile::new().unwrap();
        routes.write_all(ROUTES.as_bytes()).unwrap();

        let sysfs = tempfile::tempdir().unwrap();
        std::fs::create_dir(sysfs.path().join("eth0")).unwrap();
        std::fs::write(sysfs.path().join("eth0/address"), "02:42:ac:11:00:02\n").unwrap();

        let reader = LinuxInterfaceReader::with_paths(
            routes.path().to_str().unwrap(),
            sysfs.path().to_str().unwrap(),
        );
        let iface = reader.default_route_interface().await.unwrap();
        assert_eq!(iface, "eth0");
        assert_eq!(
            reader.mac_address(&iface).await.unwrap(),
            [0x02, 0x42, 0xac, 0x11, 0x00, 0x02]
        );
    }

    #[tokio::test]
    async fn test_missing_route_file() {
        let reader = LinuxInterfaceReader::with_paths("/nonexistent/route", "/nonexistent");
        assert!(reader.default_route_interface().await.is_err());
    }
}
