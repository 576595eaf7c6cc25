//! Backend registry: resolves a [`vmforge_core::config::BackendSelector`]
//! to a concrete [`HypervisorBackend`], registered by name at process
//! init.

pub mod delegated;
pub mod direct;

pub use vmforge_core::backend::{BackendPaths, BackendVmHandle, HypervisorBackend, LaunchRequest};

use vmforge_core::error::{Error, Result};

/// Looks up a backend by the name half of a `BackendSelector`. The
/// selector's optional argument (after the first colon) is threaded
/// through to the backend's constructor, e.g. the delegated daemon's
/// control socket path.
pub fn select_backend(name: &str, argument: Option<&str>) -> Result<Box<dyn HypervisorBackend>> {
    match name {
        "direct" => Ok(Box::new(direct::DirectBackend::new(
            argument.map(std::path::PathBuf::from),
        ))),
        "delegated" => {
            let socket_path = argument.ok_or_else(|| {
                Error::InvalidConfig(
                    "delegated backend requires a control socket path argument".to_string(),
                )
            })?;
            Ok(Box::new(delegated::DelegatedBackend::new(
                std::path::PathBuf::from(socket_path),
            )))
        }
        other => Err(Error::UnknownBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_name_is_rejected() {
        let err = select_backend("not-a-backend", None).unwrap_err();
        assert!(matches!(err, Error::UnknownBackend(_)));
    }

    #[test]
    fn delegated_backend_requires_argument() {
        let err = select_backend("delegated", None).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn direct_backend_resolves_without_argument() {
        assert!(select_backend("direct", None).is_ok());
    }
}
