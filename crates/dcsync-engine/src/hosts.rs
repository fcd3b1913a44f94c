use std::path::Path;

use dcsync_domain::Subcloud;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Regenerate the dnsmasq-style additional hosts file mapping each
/// subcloud's management address to its region name.
///
/// The new content is written to a sibling temp file and atomically renamed
/// over the old one only when the content actually changed. Returns whether
/// the file changed, so the caller knows to signal the DNS daemon.
pub fn write_addn_hosts(path: &Path, subclouds: &[Subcloud]) -> Result<bool, EngineError> {
    let mut entries: Vec<(&str, &str)> = subclouds
        .iter()
        .map(|sc| (sc.management_start_ip.as_str(), sc.region_name.as_str()))
        .collect();
    entries.sort_by_key(|(_, name)| *name);

    // An empty file (rather than a missing one) keeps dnsmasq quiet when the
    // last subcloud is deleted.
    let mut content = String::new();
    for (ip, name) in entries {
        content.push_str(ip);
        content.push(' ');
        content.push_str(name);
        content.push('\n');
    }

    let existing = std::fs::read_to_string(path).unwrap_or_default();
    if existing == content {
        debug!(path = %path.display(), "hosts file unchanged");
        return Ok(false);
    }

    let temp_path = path.with_extension("temp");
    std::fs::write(&temp_path, &content)?;
    std::fs::rename(&temp_path, path)?;
    info!(path = %path.display(), entries = subclouds.len(), "hosts file updated");
    Ok(true)
}

/// Tell the local DNS daemon to re-read the hosts file.
pub fn reload_dns_daemon() {
    match std::process::Command::new("pkill")
        .args(["-HUP", "dnsmasq"])
        .status()
    {
        Ok(_) => debug!("signalled dnsmasq"),
        Err(e) => warn!(error = %e, "could not signal dnsmasq"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dcsync_domain::{Availability, ManagementState, RegionName};
    use tempfile::TempDir;

    fn subcloud(region: &str, ip: &str) -> Subcloud {
        Subcloud {
            region_name: RegionName::new(region),
            software_version: "24.03".into(),
            management_state: ManagementState::Managed,
            availability: Availability::Online,
            management_subnet: "192.168.101.0/24".into(),
            management_start_ip: ip.into(),
            management_end_ip: "192.168.101.50".into(),
            systemcontroller_gateway_ip: "192.168.204.101".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn writes_sorted_entries() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("addn_hosts_dc");
        let subclouds = [
            subcloud("subcloud-2", "192.168.102.2"),
            subcloud("subcloud-1", "192.168.101.2"),
        ];

        let changed = write_addn_hosts(&path, &subclouds).unwrap();
        assert!(changed);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "192.168.101.2 subcloud-1\n192.168.102.2 subcloud-2\n"
        );
    }

    #[test]
    fn rewrite_with_same_content_reports_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("addn_hosts_dc");
        let subclouds = [subcloud("subcloud-1", "192.168.101.2")];

        assert!(write_addn_hosts(&path, &subclouds).unwrap());
        assert!(!write_addn_hosts(&path, &subclouds).unwrap());
    }

    #[test]
    fn empty_list_leaves_an_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("addn_hosts_dc");
        write_addn_hosts(&path, &[subcloud("subcloud-1", "192.168.101.2")]).unwrap();

        let changed = write_addn_hosts(&path, &[]).unwrap();
        assert!(changed);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
