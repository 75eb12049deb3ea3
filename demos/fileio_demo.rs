//! FILEIO backend demo
//!
//! Loads a device list from a TOML file (default: `demos/fileio.toml`),
//! activates every device, pushes a FUA write and a read-back through the
//! operation table, flushes, and tears everything down again.
//!
//! ```text
//! RUST_LOG=debug cargo run --example fileio_demo -- demos/fileio.toml
//! ```

use scsi_fileio::scsi::scsi_status;
use scsi_fileio::{
    BackendCommand, FileIoBackend, ScatterGatherList, SubsystemApi, SubsystemRegistry,
};
use std::sync::Arc;

struct DeviceConfig {
    name: String,
    params: String,
}

fn load_config(path: &str) -> Result<(u32, Vec<DeviceConfig>), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config = contents.parse::<toml::Value>()?;

    let host_id = config
        .get("host")
        .and_then(|h| h.get("id"))
        .and_then(|id| id.as_integer())
        .unwrap_or(0);

    let devices = config
        .get("device")
        .and_then(|d| d.as_array())
        .ok_or("missing [[device]] entries")?
        .iter()
        .map(|entry| -> Result<DeviceConfig, &str> {
            let name = entry
                .get("name")
                .and_then(|n| n.as_str())
                .ok_or("device entry without name")?;
            let params = entry
                .get("params")
                .and_then(|p| p.as_str())
                .ok_or("device entry without params")?;
            Ok(DeviceConfig {
                name: name.to_string(),
                params: params.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((u32::try_from(host_id)?, devices))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/fileio.toml".to_string());
    let (host_id, configs) = load_config(&path)?;

    let registry = SubsystemRegistry::new();
    let backend = Arc::new(FileIoBackend::new());
    registry.register(backend.clone())?;

    let host = backend.attach_hba(host_id)?;
    let mut devices = Vec::new();

    for config in &configs {
        let mut dev = backend.allocate_virtdevice(&host, &config.name)?;
        backend.set_dev_params(&mut dev, &config.params)?;
        backend.check_dev_params(&dev)?;
        let dev = backend.create_virtdevice(&registry, dev)?;

        print!("{}: {}", config.name, backend.show_dev_params(&dev));
        println!(
            "  {} blocks of {} bytes, queue depth {}",
            backend.get_blocks(&dev)?,
            dev.block_size(),
            dev.queue_depth()
        );
        devices.push(dev);
    }

    for dev in &devices {
        let payload: Vec<u8> = (0..8 * dev.block_size()).map(|i| (i % 255) as u8).collect();

        let mut write = BackendCommand::write(1, ScatterGatherList::from_bytes(&payload, 4096))
            .with_fua(true);
        backend.execute_rw(dev, &mut write)?;

        let mut read = BackendCommand::read(
            1,
            ScatterGatherList::with_lengths(&[payload.len() / 2, payload.len() / 2]),
        );
        backend.execute_rw(dev, &mut read)?;
        if read.sgl.to_vec() != payload {
            return Err(format!("device {} returned different data", dev.dev_id()).into());
        }

        let mut sync = BackendCommand::sync_cache(0, 0);
        backend.execute_sync_cache(dev, &mut sync)?;
        let status = sync.status().unwrap_or(scsi_status::CHECK_CONDITION);
        println!(
            "device {}: write/read verified, SYNCHRONIZE CACHE status {:#04x}",
            dev.dev_id(),
            status
        );
    }

    for dev in devices {
        backend.free_device(&registry, dev);
    }
    backend.detach_hba(host);
    registry.unregister("fileio")?;

    Ok(())
}
