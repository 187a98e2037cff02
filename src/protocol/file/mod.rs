//! Local file protocol. Publish-only.
//!
//! Each publish writes the payload to `<root>/<path>`, where `path` is a
//! macro template from the destination's message options. With `append` the
//! payload is added as one line instead of replacing the file.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::credentials::CredentialProvider;
use super::factory::{ProtocolFactory, parse_options};
use super::{
    ProtocolClient, ProtocolMessage, PublishHandler, PublishJob, enqueue_publish, publish_queue,
};
use crate::payload::Payload;
use crate::queue::JobQueue;
use crate::utils::{BrokerError, Result};

pub const PROTOCOL: &str = "file";

#[derive(Debug, Deserialize)]
struct FileTargetOptions {
    root: PathBuf,
}

#[derive(Debug, Deserialize)]
struct FileMessageOptions {
    path: String,
    #[serde(default)]
    append: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileMessage {
    /// Expanded path, relative to the target root.
    pub path: PathBuf,
    pub append: bool,
    pub payload: Payload,
}

fn parse_target_options(options: &Value) -> Result<FileTargetOptions> {
    let options: FileTargetOptions = parse_options(PROTOCOL, "options", options)?;
    if options.root.as_os_str().is_empty() {
        return Err(BrokerError::config("file options: root must not be empty"));
    }
    Ok(options)
}

fn parse_message_options(options: &Value) -> Result<FileMessageOptions> {
    let options: FileMessageOptions = parse_options(PROTOCOL, "message options", options)?;
    if options.path.is_empty() {
        return Err(BrokerError::config("file message options: path must not be empty"));
    }
    Ok(options)
}

fn check_relative(path: &Path) -> Result<()> {
    let contained = path.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        && path.components().any(|c| matches!(c, Component::Normal(_)));
    if contained {
        Ok(())
    } else {
        Err(BrokerError::config(format!(
            "file path {} must stay inside the target root",
            path.display()
        )))
    }
}

pub struct FileClient {
    root: PathBuf,
    queue: JobQueue<PublishJob, bool>,
}

impl FileClient {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let worker_root = root.clone();
        let queue = publish_queue(&format!("file-{}", root.display()), move |message| {
            write(&worker_root, message)
        });
        queue.start()?;
        Ok(Self { root, queue })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn write(root: &Path, message: &ProtocolMessage) -> Result<()> {
    let ProtocolMessage::File(message) = message else {
        return Err(message.mismatch(PROTOCOL));
    };
    check_relative(&message.path)?;
    let path = root.join(&message.path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut body = message.payload.content_bytes()?;
    let mut file = if message.append {
        body.push(b'\n');
        OpenOptions::new().create(true).append(true).open(&path)?
    } else {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?
    };
    file.write_all(&body)?;
    file.flush()?;
    debug!("Wrote {} byte(s) to {}", body.len(), path.display());
    Ok(())
}

impl ProtocolClient for FileClient {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn publish(&self, message: &ProtocolMessage) -> Result<()> {
        write(&self.root, message)
    }

    fn publish_async(&self, message: ProtocolMessage, handler: Arc<dyn PublishHandler>) {
        enqueue_publish(&self.queue, PROTOCOL, message, handler);
    }
}

#[derive(Debug, Default)]
pub struct FileFactory;

impl FileFactory {
    pub fn new() -> Self {
        Self
    }
}

impl ProtocolFactory for FileFactory {
    fn protocol(&self) -> &'static str {
        PROTOCOL
    }

    fn validate_options(&self, options: &Value) -> Result<()> {
        parse_target_options(options).map(|_| ())
    }

    fn validate_message_options(&self, options: &Value) -> Result<()> {
        let options = parse_message_options(options)?;
        if options.path.contains("${") {
            return Ok(());
        }
        check_relative(Path::new(&options.path))
    }

    fn create_client(
        &self,
        options: &Value,
        _credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Arc<dyn ProtocolClient>> {
        let options = parse_target_options(options)?;
        Ok(Arc::new(FileClient::new(options.root)?))
    }

    fn create_message(&self, payload: &Payload, options: &Value) -> Result<ProtocolMessage> {
        let options = parse_message_options(options)?;
        let path = PathBuf::from(payload.expand(&options.path));
        check_relative(&path)?;
        Ok(ProtocolMessage::File(FileMessage {
            path,
            append: options.append,
            payload: payload.clone(),
        }))
    }
}
