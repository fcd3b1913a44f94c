use std::path::Path;
use std::time::Duration;

use dcsync_config::load_config;

#[test]
fn load_valid_fixture() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/dcsync.yml");
    let config = load_config(&path).expect("should load without error");

    assert_eq!(config.master.dbsync_url, "http://192.168.204.2:8219/v1.0");
    assert_eq!(config.credentials.username, "dcsync");
    assert_eq!(config.credentials.project, "services");
    assert_eq!(config.audit_interval, Duration::from_secs(120));
    assert_eq!(config.backoff_initial, Duration::from_secs(30));
    assert_eq!(config.backoff_max, Duration::from_secs(900));
    assert_eq!(config.key_rotation_interval, Duration::from_secs(12 * 3600));
    assert_eq!(
        config.hosts_file.as_deref(),
        Some(Path::new("/etc/dnsmasq.addn_hosts_dc"))
    );

    // Overridden roles list replaces the default, users keep theirs.
    assert_eq!(config.exclusions.roles.len(), 2);
    assert!(config.exclusions.users.contains(&"dcorch".to_string()));

    // Unspecified templates fall back to the defaults.
    assert!(config.subcloud_templates.dbsync_url.contains("{host}"));
}

#[test]
fn missing_file_returns_error() {
    let path = Path::new("/nonexistent/dcsync.yml");
    assert!(load_config(path).is_err());
}

#[test]
fn rejects_non_http_master_url() {
    let dir = tempdir();
    let path = dir.join("bad.yml");
    std::fs::write(
        &path,
        r#"
master:
  dbsync_url: ftp://192.168.204.2/v1.0
  identity_url: http://192.168.204.2:5000/v3
  platform_url: http://192.168.204.2:6385/v1
credentials:
  username: dcsync
  password: pw
"#,
    )
    .unwrap();
    assert!(load_config(&path).is_err());
    std::fs::remove_file(&path).ok();
}

#[test]
fn rejects_inverted_backoff_bounds() {
    let dir = tempdir();
    let path = dir.join("backoff.yml");
    std::fs::write(
        &path,
        r#"
master:
  dbsync_url: http://192.168.204.2:8219/v1.0
  identity_url: http://192.168.204.2:5000/v3
  platform_url: http://192.168.204.2:6385/v1
credentials:
  username: dcsync
  password: pw
engine:
  backoff_initial_secs: 900
  backoff_max_secs: 30
"#,
    )
    .unwrap();
    assert!(load_config(&path).is_err());
    std::fs::remove_file(&path).ok();
}

fn tempdir() -> std::path::PathBuf {
    let dir = std::env::temp_dir().join("dcsync-config-tests");
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
