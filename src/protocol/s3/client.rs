use std::sync::Arc;

use tracing::{debug, warn};

use super::{ObjectStore, PROTOCOL, S3Message};
use crate::payload::Payload;
use crate::protocol::{
    ProtocolClient, ProtocolMessage, PublishHandler, PublishJob, enqueue_publish, publish_queue,
};
use crate::queue::JobQueue;
use crate::utils::{BrokerError, Result};

pub struct S3Client {
    store: Arc<dyn ObjectStore>,
    queue: JobQueue<PublishJob, bool>,
}

impl S3Client {
    pub fn new(region: &str, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let worker_store = Arc::clone(&store);
        let queue = publish_queue(&format!("s3-{region}"), move |message| {
            upload(worker_store.as_ref(), message)
        });
        queue.start()?;
        Ok(Self { store, queue })
    }
}

impl ProtocolClient for S3Client {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn publish(&self, message: &ProtocolMessage) -> Result<()> {
        upload(self.store.as_ref(), message)
    }

    fn publish_async(&self, message: ProtocolMessage, handler: Arc<dyn PublishHandler>) {
        enqueue_publish(&self.queue, PROTOCOL, message, handler);
    }
}

fn upload(store: &dyn ObjectStore, message: &ProtocolMessage) -> Result<()> {
    let ProtocolMessage::S3(message) = message else {
        return Err(message.mismatch(PROTOCOL));
    };

    if !(message.batch_payload_expansion && message.payload.is_batch()) {
        return put_object(store, message, &message.payload, &[]);
    }

    let mut failed = Vec::new();
    for (index, item) in message.payload.batch_items().iter().enumerate() {
        let extras = [("index", index.to_string())];
        if let Err(e) = put_object(store, message, item, &extras) {
            warn!("Upload of batch item {index} failed: {e}");
            failed.push(index.to_string());
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(BrokerError::transport(format!(
            "upload failed for batch item(s) {}",
            failed.join(", ")
        )))
    }
}

fn put_object(
    store: &dyn ObjectStore,
    message: &S3Message,
    payload: &Payload,
    extras: &[(&str, String)],
) -> Result<()> {
    let bucket = payload.expand_with(&message.bucket, extras);
    let key = payload.expand_with(&message.key, extras);
    if bucket.is_empty() || key.is_empty() {
        return Err(BrokerError::config("s3 bucket or key expanded to an empty string"));
    }

    if !message.overwrite && store.exists(&bucket, &key)? {
        debug!("s3://{bucket}/{key} exists, skipping upload");
        return Ok(());
    }
    store.put(&bucket, &key, &payload.content_bytes()?, &message.content_type)
}
