//! Unix-socket exporter.
//!
//! Each exported object gets its own listening socket inside a per-exporter
//! directory: `{temp_dir}/tandem-{pid}-{tag}/obj-{n}.sock`. The object id in
//! every invocation is checked against the socket's object, so a stale stub
//! that happens to hit a reused path is rejected.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{ExportError, RemoteObject, RemoteObjectExporter, Stub};
use crate::bridge::codec::JsonCodec;
use crate::bridge::protocol::{Invocation, ObjectId, Reply};

struct ExportEntry {
    path: PathBuf,
    cancel: CancellationToken,
}

pub struct SocketExporter {
    dir: PathBuf,
    next_socket: AtomicU64,
    exports: StdMutex<HashMap<ObjectId, ExportEntry>>,
    owns_dir: bool,
}

impl SocketExporter {
    /// Exporter with a fresh private directory under the system temp dir.
    pub fn new() -> io::Result<Self> {
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let dir = std::env::temp_dir().join(format!("tandem-{}-{}", std::process::id(), &tag[..8]));
        std::fs::create_dir_all(&dir)?;
        tracing::debug!(dir = %dir.display(), "Created export directory");
        Ok(Self {
            dir,
            next_socket: AtomicU64::new(0),
            exports: StdMutex::new(HashMap::new()),
            owns_dir: true,
        })
    }

    /// Exporter placing sockets in an existing directory it does not own.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            next_socket: AtomicU64::new(0),
            exports: StdMutex::new(HashMap::new()),
            owns_dir: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exported_count(&self) -> usize {
        self.exports.lock().map(|m| m.len()).unwrap_or(0)
    }

    fn bind(&self) -> io::Result<(PathBuf, UnixListener)> {
        use std::os::unix::net::UnixListener as StdUnixListener;

        let n = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("obj-{}.sock", n));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let std_listener = StdUnixListener::bind(&path)?;
        std_listener.set_nonblocking(true)?;
        let listener = UnixListener::from_std(std_listener)?;
        Ok((path, listener))
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        let entries: Vec<(ObjectId, ExportEntry)> = match self.exports.lock() {
            Ok(mut map) => map.drain().collect(),
            Err(_) => Vec::new(),
        };
        for (object, entry) in entries {
            tracing::debug!(%object, "Retracting export during cleanup");
            entry.cancel.cancel();
        }
        if self.owns_dir && self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "Cleaning up export directory");
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl RemoteObjectExporter for SocketExporter {
    fn export(&self, object: Arc<dyn RemoteObject>) -> Result<Stub, ExportError> {
        let object_id = ObjectId::new();
        let (path, listener) = self.bind()?;
        let cancel = CancellationToken::new();

        let stub = Stub {
            interface: object.interface().to_string(),
            endpoint: path.clone(),
            object: object_id,
        };

        tokio::spawn(accept_loop(listener, object_id, object, cancel.clone()));

        let mut exports = self
            .exports
            .lock()
            .map_err(|_| io::Error::other("export table poisoned"))?;
        exports.insert(object_id, ExportEntry { path, cancel });

        tracing::debug!(interface = %stub.interface, object = %object_id, endpoint = %stub.endpoint.display(), "Exported object");
        Ok(stub)
    }

    fn unexport(&self, stub: &Stub) -> Result<(), ExportError> {
        let entry = self
            .exports
            .lock()
            .map_err(|_| io::Error::other("export table poisoned"))?
            .remove(&stub.object)
            .ok_or(ExportError::NotExported(stub.object))?;

        entry.cancel.cancel();
        match std::fs::remove_file(&entry.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ExportError::Io(e)),
        }

        tracing::debug!(interface = %stub.interface, object = %stub.object, "Unexported object");
        Ok(())
    }
}

impl Drop for SocketExporter {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup export directory");
        }
    }
}

async fn accept_loop(
    listener: UnixListener,
    object_id: ObjectId,
    object: Arc<dyn RemoteObject>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                tracing::trace!(object = %object_id, "Accepted remote connection");
                tokio::spawn(serve_connection(
                    stream,
                    object_id,
                    Arc::clone(&object),
                    cancel.clone(),
                ));
            }
            Err(e) => {
                tracing::warn!(object = %object_id, error = %e, "Accept failed");
            }
        }
    }
    tracing::trace!(object = %object_id, "Accept loop exiting");
}

async fn serve_connection(
    stream: UnixStream,
    object_id: ObjectId,
    object: Arc<dyn RemoteObject>,
    cancel: CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, JsonCodec::<Invocation>::new());
    let mut writer = FramedWrite::new(write_half, JsonCodec::<Reply>::new());

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = reader.next() => msg,
        };
        let invocation = match msg {
            Some(Ok(invocation)) => invocation,
            Some(Err(e)) => {
                tracing::warn!(object = %object_id, error = %e, "Remote connection read error");
                break;
            }
            None => break,
        };

        let reply = if invocation.object != object_id {
            Reply::error(format!("no such object: {}", invocation.object))
        } else {
            match object.dispatch(invocation.call).await {
                Ok(value) => Reply::ok(value),
                Err(message) => Reply::error(message),
            }
        };

        if let Err(e) = writer.send(reply).await {
            tracing::warn!(object = %object_id, error = %e, "Failed to send reply");
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemoteError;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl RemoteObject for Counter {
        fn interface(&self) -> &'static str {
            "test.counter"
        }

        async fn dispatch(&self, call: serde_json::Value) -> Result<serde_json::Value, String> {
            match call.as_str() {
                Some("bump") => {
                    let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(serde_json::json!(n))
                }
                _ => Err(format!("unsupported call: {}", call)),
            }
        }
    }

    fn counter() -> Arc<Counter> {
        Arc::new(Counter {
            calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn exported_object_is_invocable() {
        let exporter = SocketExporter::new().unwrap();
        let object = counter();
        let stub = exporter.export(object.clone()).unwrap();

        assert_eq!(stub.interface, "test.counter");
        assert!(stub.endpoint.starts_with(exporter.dir()));

        let first: usize = stub.invoke(&"bump").await.unwrap();
        let second: usize = stub.invoke(&"bump").await.unwrap();
        assert_eq!((first, second), (1, 2));
        assert_eq!(object.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dispatch_error_reaches_caller() {
        let exporter = SocketExporter::new().unwrap();
        let stub = exporter.export(counter()).unwrap();

        let err = stub.invoke::<_, usize>(&"explode").await.unwrap_err();
        match err {
            RemoteError::Remote(message) => assert!(message.contains("unsupported call")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn wrong_object_id_is_rejected() {
        let exporter = SocketExporter::new().unwrap();
        let mut stub = exporter.export(counter()).unwrap();
        stub.object = ObjectId::new();

        let err = stub.invoke::<_, usize>(&"bump").await.unwrap_err();
        assert!(matches!(err, RemoteError::Remote(ref m) if m.starts_with("no such object")));
    }

    #[tokio::test]
    async fn unexport_retracts_object() {
        let exporter = SocketExporter::new().unwrap();
        let stub = exporter.export(counter()).unwrap();
        assert_eq!(exporter.exported_count(), 1);

        exporter.unexport(&stub).unwrap();
        assert_eq!(exporter.exported_count(), 0);
        assert!(!stub.endpoint.exists());

        let err = stub.invoke::<_, usize>(&"bump").await.unwrap_err();
        assert!(matches!(err, RemoteError::Connect(_)));
        assert!(err.is_peer_gone());
    }

    #[tokio::test]
    async fn unexport_twice_fails() {
        let exporter = SocketExporter::new().unwrap();
        let stub = exporter.export(counter()).unwrap();

        exporter.unexport(&stub).unwrap();
        let err = exporter.unexport(&stub).unwrap_err();
        assert!(matches!(err, ExportError::NotExported(id) if id == stub.object));
    }

    #[tokio::test]
    async fn drop_removes_directory() {
        let exporter = SocketExporter::new().unwrap();
        let dir = exporter.dir().to_path_buf();
        let _stub = exporter.export(counter()).unwrap();
        assert!(dir.exists());

        drop(exporter);
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn in_dir_leaves_directory_in_place() {
        let scratch = tempfile::tempdir().unwrap();
        let exporter = SocketExporter::in_dir(scratch.path());
        let stub = exporter.export(counter()).unwrap();
        assert!(stub.endpoint.starts_with(scratch.path()));

        drop(exporter);
        assert!(scratch.path().exists());
    }
}
