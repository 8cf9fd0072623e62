use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::interface::platform::{Backend, BackendMetadata};

pub fn list_backends() -> Vec<&'static BackendMetadata> {
    let mut backends: Vec<&'static BackendMetadata> = inventory::iter::<BackendMetadata>.into_iter().collect();
    backends.sort_by_key(|backend| backend.id);
    backends
}

pub fn get_backend_metadata(id: &str) -> Option<&'static BackendMetadata> {
    inventory::iter::<BackendMetadata>
        .into_iter()
        .find(|backend| backend.id == id)
}

pub fn create_backend(id: &str, config: &CaptureConfig) -> Result<Backend> {
    let meta = get_backend_metadata(id)
        .ok_or_else(|| CaptureError::Config(format!("Unknown capture backend '{id}'")))?;
    log::info!(backend = meta.id; "Creating capture backend");
    (meta.factory)(config).map_err(CaptureError::from)
}
