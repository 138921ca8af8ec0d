//! Remote code service: lets the subordinate fetch code and resources it
//! cannot resolve locally, out of the classpath the master launched it with.

use std::io;
use std::path::{Component, Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::bridge::protocol::{CODE_SERVICE_INTERFACE, CodeCall, CodeResource};
use crate::remote::{RemoteError, RemoteObject, Stub, decode_call, encode_value};

#[derive(Debug, thiserror::Error)]
pub enum CodeServiceError {
    #[error("invalid resource name '{0}': must be relative and stay inside the classpath")]
    InvalidName(String),
    #[error("resource '{0}' not found on classpath")]
    NotFound(String),
    #[error("failed to read resource '{name}': {source}")]
    Read { name: String, source: io::Error },
}

/// Serves resources by classpath-relative name. Entries are searched in
/// order; the first entry containing the name wins.
#[derive(Debug, Clone)]
pub struct CodeService {
    classpath: Vec<PathBuf>,
}

impl CodeService {
    pub fn new(classpath: Vec<PathBuf>) -> Self {
        Self { classpath }
    }

    pub fn load(&self, name: &str) -> Result<CodeResource, CodeServiceError> {
        let relative = validate_name(name)?;

        for entry in &self.classpath {
            let candidate = entry.join(relative);
            if !candidate.is_file() {
                continue;
            }
            let bytes = std::fs::read(&candidate).map_err(|source| CodeServiceError::Read {
                name: name.to_string(),
                source,
            })?;
            tracing::debug!(%name, origin = %entry.display(), size = bytes.len(), "Serving resource");
            return Ok(CodeResource {
                name: name.to_string(),
                origin: entry.clone(),
                data: STANDARD.encode(&bytes),
            });
        }

        tracing::debug!(%name, "Resource not found on classpath");
        Err(CodeServiceError::NotFound(name.to_string()))
    }
}

fn validate_name(name: &str) -> Result<&Path, CodeServiceError> {
    let path = Path::new(name);
    let mut saw_normal = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => saw_normal = true,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(CodeServiceError::InvalidName(name.to_string()));
            }
        }
    }
    if !saw_normal {
        return Err(CodeServiceError::InvalidName(name.to_string()));
    }
    Ok(path)
}

#[async_trait::async_trait]
impl RemoteObject for CodeService {
    fn interface(&self) -> &'static str {
        CODE_SERVICE_INTERFACE
    }

    async fn dispatch(&self, call: serde_json::Value) -> Result<serde_json::Value, String> {
        match decode_call::<CodeCall>(call)? {
            CodeCall::LoadResource { name } => {
                let resource = self.load(&name).map_err(|e| e.to_string())?;
                encode_value(&resource)
            }
        }
    }
}

/// Subordinate-side client for the code service.
#[derive(Debug, Clone)]
pub struct CodeServiceProxy {
    stub: Stub,
}

impl CodeServiceProxy {
    pub fn new(stub: Stub) -> Self {
        Self { stub }
    }

    /// Fetch a resource and return its decoded bytes.
    pub async fn load(&self, name: &str) -> Result<Vec<u8>, RemoteError> {
        let resource: CodeResource = self
            .stub
            .invoke(&CodeCall::LoadResource {
                name: name.to_string(),
            })
            .await?;
        STANDARD
            .decode(resource.data.as_bytes())
            .map_err(|e| RemoteError::Remote(format!("resource '{}' is not valid base64: {}", name, e)))
    }
}
