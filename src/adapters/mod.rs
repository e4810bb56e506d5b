use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::core::remote::RemoteCommandChannel;
use crate::core::storage::ObjectStore;

mod kubectl;
mod memory;
mod s3;
mod simulated;

pub use kubectl::KubectlChannel;
pub use memory::{MemoryStore, StoredObject};
pub use s3::S3Store;
pub use simulated::{CallRecord, RemoteUpload, Response, SimulatedChannel};

pub fn get_channel(config: &AppConfig) -> Arc<dyn RemoteCommandChannel> {
    if config.simulation {
        info!("Using simulated exec channel");
        let channel = SimulatedChannel::new();
        seed_simulation(&channel, config);
        return Arc::new(channel);
    }
    Arc::new(KubectlChannel::from_config(config))
}

pub async fn get_store(config: &AppConfig) -> Result<Arc<dyn ObjectStore>> {
    if config.simulation {
        info!("Using in-memory object store");
        let mut store = MemoryStore::new();
        if let Some(base) = &config.storage.public_url_base {
            store = store.with_url_base(base.clone());
        }
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(S3Store::from_config(&config.storage).await?))
}

/// Give every simulated container a small data directory and a flush
/// command so a dry run exercises the whole pipeline. A configured restore
/// archive is placed in the bucket, holding the same files.
fn seed_simulation(channel: &SimulatedChannel, config: &AppConfig) {
    let data_dir = config.data_dir.trim_end_matches('/');
    let mut seeded = Vec::new();
    for pod in &config.pods {
        for container in &config.containers {
            let target = crate::core::models::Target::new(&config.namespace, pod, container);
            for (i, size) in [3 * config.chunk_size + 17, config.chunk_size / 2].iter().enumerate() {
                let contents: Vec<u8> = (0..*size).map(|b| (b % 251) as u8).collect();
                let path = format!("{data_dir}/sequence/{pod}-{i}.tsfile");
                channel.put_file(&target, &path, contents.clone());
                seeded.push((path, contents));
            }
        }
    }
    if let Some(archive) = &config.restore.archive {
        let uri = format!("oss://{}/{archive}", config.storage.bucket);
        channel.put_archive_object(&uri, seeded);
    }
    if let Some(program) = config.restore.load.command.first() {
        channel.script(program, [Response::ok()]);
    }
    if let Some(program) = config.flush.command.first() {
        channel.script(program, [Response::ok()]);
    }
    if let Some(program) = config.flush.check.as_ref().and_then(|p| p.first()) {
        channel.script(program, [Response::ok()]);
    }
}
