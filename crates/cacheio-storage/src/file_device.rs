//! Directory-backed device
//!
//! Each file of the device is a host file `<root>/<file_id>.dat`; persisted
//! properties live next to it in `<file_id>.props.json`.

use crate::device::{Completion, DeviceTransport, FileOperation, IoRequest};
use crate::raw_io::RawFile;
use cacheio_common::{DeviceId, Error, FileId, FileProperties, IoFlags, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Device storing its files in a host directory
pub struct FileDevice {
    id: DeviceId,
    root: PathBuf,
    open_files: Mutex<HashMap<FileId, Arc<RawFile>>>,
}

impl FileDevice {
    /// Create a device rooted at `root`, creating the directory if needed
    pub fn new(id: DeviceId, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root).map_err(|e| {
            Error::device(format!("failed to create device root {}: {e}", root.display()))
        })?;

        Ok(Self {
            id,
            root,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    fn data_path(&self, file_id: FileId) -> PathBuf {
        self.root.join(format!("{file_id}.dat"))
    }

    fn properties_path(&self, file_id: FileId) -> PathBuf {
        self.root.join(format!("{file_id}.props.json"))
    }

    fn file(&self, file_id: FileId) -> Result<Arc<RawFile>> {
        let mut open_files = self.open_files.lock();
        if let Some(file) = open_files.get(&file_id) {
            return Ok(file.clone());
        }

        let file = Arc::new(RawFile::open(self.data_path(file_id))?);
        open_files.insert(file_id, file.clone());
        Ok(file)
    }

    /// Load the persisted properties of `file_id`, if any
    pub fn load_properties(&self, file_id: FileId) -> Result<Option<FileProperties>> {
        let path = self.properties_path(file_id);
        match std::fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                Error::device(format!("corrupt properties in {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::device(format!(
                "failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    fn store_properties(&self, props: &FileProperties, flags: IoFlags) -> Result<()> {
        let path = self.properties_path(props.file_id);
        let json = serde_json::to_vec_pretty(props)
            .map_err(|e| Error::internal(format!("failed to encode properties: {e}")))?;
        std::fs::write(&path, json)
            .map_err(|e| Error::device(format!("failed to write {}: {e}", path.display())))?;

        if flags.contains(IoFlags::METADATA_SYNCHRONIZED) {
            RawFile::open(&path)?.sync()?;
        }

        Ok(())
    }
}

impl DeviceTransport for FileDevice {
    fn device_id(&self) -> DeviceId {
        self.id
    }

    fn read(&self, request: &IoRequest<'_>, buffer: &mut [u8]) -> Completion {
        let size = request.properties.size;
        if request.offset >= size {
            return Completion::failed(0, Error::EndOfFile);
        }

        let available = usize::try_from(size - request.offset).unwrap_or(usize::MAX);
        let count = buffer.len().min(available);
        let file = match self.file(request.properties.file_id) {
            Ok(file) => file,
            Err(e) => return Completion::failed(0, e),
        };

        match file.read_at(request.offset, &mut buffer[..count]) {
            Ok(read) => {
                buffer[read..count].fill(0);
                Completion::ok(count)
            }
            Err(e) => Completion::failed(0, e),
        }
    }

    fn write(&self, request: &IoRequest<'_>, buffer: &[u8]) -> Completion {
        let file = match self.file(request.properties.file_id) {
            Ok(file) => file,
            Err(e) => return Completion::failed(0, e),
        };

        if let Err(e) = file.write_at(request.offset, buffer) {
            return Completion::failed(0, e);
        }

        if request.flags.contains(IoFlags::DATA_SYNCHRONIZED) {
            if let Err(e) = file.sync_data() {
                return Completion::failed(buffer.len(), e);
            }
        }

        Completion::ok(buffer.len())
    }

    fn file_operation(
        &self,
        properties: &FileProperties,
        operation: FileOperation<'_>,
        flags: IoFlags,
    ) -> Result<()> {
        debug!(file_id = %properties.file_id, op = operation.name(), "file operation");
        match operation {
            FileOperation::Close => {
                self.open_files.lock().remove(&properties.file_id);
                Ok(())
            }
            FileOperation::Delete => {
                self.open_files.lock().remove(&properties.file_id);
                for path in [
                    self.data_path(properties.file_id),
                    self.properties_path(properties.file_id),
                ] {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(Error::device(format!(
                                "failed to remove {}: {e}",
                                path.display()
                            )));
                        }
                    }
                }
                Ok(())
            }
            FileOperation::Truncate { new_size } => {
                self.file(properties.file_id)?.set_len(new_size)
            }
            FileOperation::WriteProperties(props) => self.store_properties(props, flags),
        }
    }
}
