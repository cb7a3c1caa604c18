//! Process-wide networker registry.
//!
//! The visor registers one networker per network kind at startup; apps
//! resolve them by kind. Tests that build multiple visors in one process
//! must call [`clear_networkers`] between runs.

use crate::error::{AppError, Result};
use crate::networker::Networker;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

fn registry() -> &'static Mutex<HashMap<String, Arc<dyn Networker>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Arc<dyn Networker>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Register `networker` under `kind`.
///
/// # Errors
///
/// `NetworkerRegistered` if the kind is taken.
pub fn add_networker(kind: &str, networker: Arc<dyn Networker>) -> Result<()> {
    let mut map = registry()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if map.contains_key(kind) {
        return Err(AppError::NetworkerRegistered(kind.to_string()));
    }
    map.insert(kind.to_string(), networker);
    Ok(())
}

/// Resolve the networker registered under `kind`.
///
/// # Errors
///
/// `NoNetworker` if nothing is registered.
pub fn networker(kind: &str) -> Result<Arc<dyn Networker>> {
    registry()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(kind)
        .cloned()
        .ok_or_else(|| AppError::NoNetworker(kind.to_string()))
}

/// Drop every registered networker.
pub fn clear_networkers() {
    registry()
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networker::{AppConn, AppListener};
    use async_trait::async_trait;
    use skein_routing::Addr;

    struct NoopNetworker;

    #[async_trait]
    impl Networker for NoopNetworker {
        async fn dial(&self, addr: Addr) -> Result<AppConn> {
            Err(AppError::NoNetworker(addr.to_string()))
        }

        async fn listen(&self, addr: Addr) -> Result<AppListener> {
            Err(AppError::NoNetworker(addr.to_string()))
        }
    }

    #[test]
    fn test_registry_lifecycle() {
        clear_networkers();

        add_networker("skein", Arc::new(NoopNetworker)).unwrap();
        assert!(networker("skein").is_ok());
        assert!(matches!(
            add_networker("skein", Arc::new(NoopNetworker)).unwrap_err(),
            AppError::NetworkerRegistered(_)
        ));
        assert!(matches!(
            networker("other").unwrap_err(),
            AppError::NoNetworker(_)
        ));

        clear_networkers();
        assert!(networker("skein").is_err());
    }
}
