//! Device → forwarded port assignments.
//!
//! Ports come from whatever set up the forwarding: `[[devices]]` entries in
//! the config file, and `--device ID=PORT` on the command line. The command
//! line wins for an identifier given in both.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use farm_core::DeviceId;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DeviceFileInput {
    devices: Vec<DeviceEntryInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DeviceEntryInput {
    id: String,
    port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    pub id: DeviceId,
    pub port: u16,
}

/// `[[devices]]` entries from a config document. Other tables are ignored.
pub fn from_toml_str(input: &str) -> anyhow::Result<Vec<DeviceEntry>> {
    let parsed: DeviceFileInput = toml::from_str(input).context("invalid [[devices]] table")?;
    let mut out = Vec::with_capacity(parsed.devices.len());
    for (idx, entry) in parsed.devices.into_iter().enumerate() {
        let id = entry.id.trim();
        if id.is_empty() {
            anyhow::bail!("devices[{idx}]: missing id");
        }
        let port = entry
            .port
            .with_context(|| format!("devices[{idx}] ({id}): missing port"))?;
        if port == 0 {
            anyhow::bail!("devices[{idx}] ({id}): port must be non-zero");
        }
        out.push(DeviceEntry {
            id: DeviceId::from(id),
            port,
        });
    }
    Ok(out)
}

pub fn load(path: &Path) -> anyhow::Result<Vec<DeviceEntry>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    from_toml_str(&text)
}

/// Parse `ID=PORT`. The split is on the last `=`.
pub fn parse_device_arg(arg: &str) -> anyhow::Result<DeviceEntry> {
    let (id, port) = arg
        .rsplit_once('=')
        .with_context(|| format!("expected ID=PORT, got {arg:?}"))?;
    let id = id.trim();
    if id.is_empty() {
        anyhow::bail!("empty device id in {arg:?}");
    }
    let port: u16 = port
        .trim()
        .parse()
        .with_context(|| format!("invalid port in {arg:?}"))?;
    if port == 0 {
        anyhow::bail!("port must be non-zero in {arg:?}");
    }
    Ok(DeviceEntry {
        id: DeviceId::from(id),
        port,
    })
}

/// Overlay `overrides` on `base`, keeping first-seen order.
pub fn merge(base: Vec<DeviceEntry>, overrides: Vec<DeviceEntry>) -> Vec<DeviceEntry> {
    let mut out = base;
    for entry in overrides {
        match out.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => existing.port = entry.port,
            None => out.push(entry),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_devices_table() {
        let toml = r#"
            version = 1
            [pool]
            max_connections = 10

            [[devices]]
            id = "emulator-5554"
            port = 27183

            [[devices]]
            id = "192.168.1.20:5555"
            port = 27184
        "#;
        let devices = from_toml_str(toml).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id.as_str(), "emulator-5554");
        assert_eq!(devices[1].id.as_str(), "192.168.1.20:5555");
        assert_eq!(devices[1].port, 27184);
    }

    #[test]
    fn no_devices_table_is_empty() {
        assert!(from_toml_str("[pool]\nmax_connections = 3\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_incomplete_entries() {
        assert!(from_toml_str("[[devices]]\nport = 1\n").is_err());
        assert!(from_toml_str("[[devices]]\nid = \"a\"\n").is_err());
        assert!(from_toml_str("[[devices]]\nid = \"a\"\nport = 0\n").is_err());
    }

    #[test]
    fn device_arg() {
        let e = parse_device_arg("10.0.0.5:5555=27200").unwrap();
        assert_eq!(e.id.as_str(), "10.0.0.5:5555");
        assert_eq!(e.port, 27200);
        assert!(parse_device_arg("no-port").is_err());
        assert!(parse_device_arg("=27200").is_err());
        assert!(parse_device_arg("a=99999").is_err());
    }

    #[test]
    fn cli_overrides_file() {
        let base = vec![
            parse_device_arg("a=1").unwrap(),
            parse_device_arg("b=2").unwrap(),
        ];
        let merged = merge(
            base,
            vec![parse_device_arg("b=20").unwrap(), parse_device_arg("c=3").unwrap()],
        );
        let flat: Vec<(String, u16)> = merged.iter().map(|e| (e.id.to_string(), e.port)).collect();
        assert_eq!(
            flat,
            vec![("a".into(), 1), ("b".into(), 20), ("c".into(), 3)]
        );
    }
}
