//! Bootstrap channel: how a process that does not exist yet learns how to call
//! back into the process that is about to start it.
//!
//! The master exports an object, serializes the stub into a fresh temporary
//! file, and passes the file's path on the child's command line. Going through
//! the filesystem sidesteps argument length and encoding limits and keeps the
//! handshake independent of the transport behind the stub.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempPath;

use crate::remote::{ExportError, RemoteObject, RemoteObjectExporter, Stub};

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to export object: {0}")]
    Export(#[from] ExportError),
    #[error("failed to serialize stub: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write stub file: {0}")]
    Write(#[source] io::Error),
    #[error("failed to read stub file {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("stub file {path} is malformed: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// An exported object whose stub has been persisted.
#[derive(Debug)]
pub struct PreparedExport {
    pub stub: Stub,
    pub stub_bytes: Vec<u8>,
    pub path: TempPath,
}

pub struct BootstrapChannel {
    exporter: Arc<dyn RemoteObjectExporter>,
    dir: PathBuf,
}

impl BootstrapChannel {
    pub fn new(exporter: Arc<dyn RemoteObjectExporter>, dir: impl Into<PathBuf>) -> Self {
        Self {
            exporter,
            dir: dir.into(),
        }
    }

    /// Export `object` and write its stub to a new temporary file.
    ///
    /// If the stub cannot be persisted the export is retracted again, so a
    /// failed prepare leaves nothing behind.
    pub fn prepare(&self, object: Arc<dyn RemoteObject>) -> Result<PreparedExport, BootstrapError> {
        let interface = object.interface();
        let stub = self.exporter.export(object)?;
        tracing::debug!(%interface, object = %stub.object, "Created stub");

        match self.persist(&stub) {
            Ok((stub_bytes, path)) => {
                tracing::debug!(%interface, path = %path.display(), "Wrote stub file");
                Ok(PreparedExport {
                    stub,
                    stub_bytes,
                    path,
                })
            }
            Err(e) => {
                if let Err(unexport_err) = self.exporter.unexport(&stub) {
                    tracing::warn!(%interface, error = %unexport_err, "Failed to retract export after stub write failure");
                }
                Err(e)
            }
        }
    }

    fn persist(&self, stub: &Stub) -> Result<(Vec<u8>, TempPath), BootstrapError> {
        let bytes = serde_json::to_vec(stub).map_err(BootstrapError::Serialize)?;

        let mut file = tempfile::Builder::new()
            .prefix("tandem-stub-")
            .suffix(".json")
            .tempfile_in(&self.dir)
            .map_err(BootstrapError::Write)?;
        file.write_all(&bytes).map_err(BootstrapError::Write)?;
        file.as_file().sync_all().map_err(BootstrapError::Write)?;

        Ok((bytes, file.into_temp_path()))
    }

    /// Best-effort delete of a stub file. Failure is logged, never fatal: a
    /// leftover temp file is litter, not a correctness problem.
    pub fn cleanup(path: TempPath) {
        let shown = path.to_path_buf();
        match path.close() {
            Ok(()) => tracing::debug!(path = %shown.display(), "Removed stub file"),
            Err(e) => tracing::warn!(path = %shown.display(), error = %e, "Failed to remove stub file"),
        }
    }
}

/// Subordinate side: load a stub written by `BootstrapChannel::prepare`.
pub fn read_stub(path: &Path) -> Result<Stub, BootstrapError> {
    let bytes = std::fs::read(path).map_err(|source| BootstrapError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| BootstrapError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// The two stub files of one launch. Only exist while a launch is starting up;
/// `cleanup` consumes them so they are deleted exactly once.
#[derive(Debug)]
pub struct BootstrapArtifacts {
    master: TempPath,
    code_service: TempPath,
    master_stub_bytes: Vec<u8>,
}

impl BootstrapArtifacts {
    pub fn new(master: PreparedExport, code_service: PreparedExport) -> Self {
        Self {
            master: master.path,
            code_service: code_service.path,
            master_stub_bytes: master.stub_bytes,
        }
    }

    pub fn master_path(&self) -> &Path {
        &self.master
    }

    pub fn code_service_path(&self) -> &Path {
        &self.code_service
    }

    pub fn master_stub_bytes(&self) -> &[u8] {
        &self.master_stub_bytes
    }

    pub fn cleanup(self) {
        BootstrapChannel::cleanup(self.master);
        BootstrapChannel::cleanup(self.code_service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::SocketExporter;

    struct Nothing;

    #[async_trait::async_trait]
    impl RemoteObject for Nothing {
        fn interface(&self) -> &'static str {
            "test.nothing"
        }

        async fn dispatch(&self, _call: serde_json::Value) -> Result<serde_json::Value, String> {
            Ok(serde_json::Value::Null)
        }
    }

    fn channel(dir: &Path) -> (Arc<SocketExporter>, BootstrapChannel) {
        let exporter = Arc::new(SocketExporter::new().unwrap());
        let channel = BootstrapChannel::new(exporter.clone(), dir);
        (exporter, channel)
    }

    #[tokio::test]
    async fn prepare_writes_readable_stub() {
        let scratch = tempfile::tempdir().unwrap();
        let (_exporter, channel) = channel(scratch.path());

        let prepared = channel.prepare(Arc::new(Nothing)).unwrap();
        assert!(prepared.path.starts_with(scratch.path()));
        assert_eq!(std::fs::read(&prepared.path).unwrap(), prepared.stub_bytes);

        let stub = read_stub(&prepared.path).unwrap();
        assert_eq!(stub, prepared.stub);
        let reply: serde_json::Value = stub.invoke(&serde_json::json!({})).await.unwrap();
        assert!(reply.is_null());
    }

    #[tokio::test]
    async fn cleanup_removes_file() {
        let scratch = tempfile::tempdir().unwrap();
        let (_exporter, channel) = channel(scratch.path());

        let prepared = channel.prepare(Arc::new(Nothing)).unwrap();
        let path = prepared.path.to_path_buf();
        assert!(path.exists());

        BootstrapChannel::cleanup(prepared.path);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cleanup_of_vanished_file_is_not_fatal() {
        let scratch = tempfile::tempdir().unwrap();
        let (_exporter, channel) = channel(scratch.path());

        let prepared = channel.prepare(Arc::new(Nothing)).unwrap();
        std::fs::remove_file(&prepared.path).unwrap();

        BootstrapChannel::cleanup(prepared.path);
        assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_persist_retracts_export() {
        let scratch = tempfile::tempdir().unwrap();
        let missing = scratch.path().join("does-not-exist");
        let (exporter, channel) = channel(&missing);

        let err = channel.prepare(Arc::new(Nothing)).unwrap_err();
        assert!(matches!(err, BootstrapError::Write(_)));
        assert_eq!(exporter.exported_count(), 0);
    }

    #[tokio::test]
    async fn artifacts_cleanup_removes_both_files() {
        let scratch = tempfile::tempdir().unwrap();
        let (_exporter, channel) = channel(scratch.path());

        let artifacts = BootstrapArtifacts::new(
            channel.prepare(Arc::new(Nothing)).unwrap(),
            channel.prepare(Arc::new(Nothing)).unwrap(),
        );
        let master = artifacts.master_path().to_path_buf();
        let code = artifacts.code_service_path().to_path_buf();
        assert_ne!(master, code);
        assert!(master.exists() && code.exists());
        assert!(!artifacts.master_stub_bytes().is_empty());

        artifacts.cleanup();
        assert!(!master.exists());
        assert!(!code.exists());
    }

    #[test]
    fn read_stub_reports_missing_and_malformed_files() {
        let scratch = tempfile::tempdir().unwrap();
        let missing = scratch.path().join("nope.json");
        assert!(matches!(
            read_stub(&missing),
            Err(BootstrapError::Read { .. })
        ));

        let garbage = scratch.path().join("garbage.json");
        std::fs::write(&garbage, b"not a stub").unwrap();
        assert!(matches!(
            read_stub(&garbage),
            Err(BootstrapError::Parse { .. })
        ));
    }
}
