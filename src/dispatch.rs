//! Coordinator dispatch
//!
//! Every mutating filesystem operation runs through one wrapper: do it
//! locally if we coordinate the file, otherwise ask the coordinator, and
//! if the coordinator is unreachable (and we hold CAP_COORDINATE) take
//! the file over via the MS and run locally after all.

use tracing::{debug, info};

use crate::error::Result;
use crate::gateway::Gateway;
use crate::ms::CAP_COORDINATE;

/// Run `local` if this gateway coordinates the file at `path`, else send
/// the operation to the coordinator via `remote`.
///
/// A `RemoteUnavailable` from `remote` triggers an MS-mediated takeover
/// when this gateway is allowed to coordinate; any other error propagates.
/// Each loop iteration either returns or strictly changes the coordinator,
/// so the loop terminates with the usual two-party race caveats.
pub fn try_or_coordinate<T, L, R>(
    gateway: &Gateway,
    path: &str,
    mut coordinator: u64,
    mut local: L,
    mut remote: R,
) -> Result<T>
where
    L: FnMut() -> Result<T>,
    R: FnMut(u64) -> Result<T>,
{
    loop {
        if coordinator == gateway.id() {
            return local();
        }

        match remote(coordinator) {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_remote_unavailable() => return Err(e),
            Err(e) => {
                let caps = gateway.ms().gateway_caps(gateway.id());
                if caps & CAP_COORDINATE == 0 {
                    debug!(
                        "Coordinator {} unreachable for {} and we cannot coordinate",
                        coordinator, path
                    );
                    return Err(e);
                }

                let new_coordinator = gateway.chcoord(path)?;
                info!(
                    "Coordinator of {} moved: {} -> {}",
                    path, coordinator, new_coordinator
                );
                coordinator = new_coordinator;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::gateway::tests::test_env;
    use crate::ms::{MdEntry, MsClient, MD_ENTRY_FILE};

    fn remote_file(coordinator: u64) -> MdEntry {
        MdEntry {
            entry_type: MD_ENTRY_FILE,
            name: "x".to_string(),
            coordinator,
            ..Default::default()
        }
    }

    #[test]
    fn test_local_runs_directly() {
        let env = test_env(10);
        let result: Result<u32> = try_or_coordinate(
            &env.gateway,
            "/x",
            env.gateway.id(),
            || Ok(42),
            |_| panic!("remote should not run"),
        );
        assert_eq!(result.unwrap(), 42);
        env.gateway.shutdown();
    }

    #[test]
    fn test_remote_error_propagates() {
        let env = test_env(10);
        let result: Result<u32> = try_or_coordinate(
            &env.gateway,
            "/x",
            20,
            || panic!("local should not run"),
            |_| Err(Error::PermissionDenied("no".to_string())),
        );
        assert!(matches!(result, Err(Error::PermissionDenied(_))));
        env.gateway.shutdown();
    }

    #[test]
    fn test_takeover_on_unavailable() {
        let env = test_env(10);
        env.ms.grant_caps(10, CAP_COORDINATE);
        env.ms.create("/x", remote_file(20)).unwrap();

        let mut remote_calls = 0;
        let result: Result<u32> = try_or_coordinate(
            &env.gateway,
            "/x",
            20,
            || Ok(7),
            |_| {
                remote_calls += 1;
                Err(Error::RemoteUnavailable("gone".to_string()))
            },
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(remote_calls, 1);
        assert_eq!(env.ms.lookup("/x").unwrap().coordinator, 10);
        env.gateway.shutdown();
    }

    #[test]
    fn test_no_caps_no_takeover() {
        let env = test_env(10);
        env.ms.create("/x", remote_file(20)).unwrap();

        let result: Result<u32> = try_or_coordinate(
            &env.gateway,
            "/x",
            20,
            || panic!("local should not run"),
            |_| Err(Error::RemoteUnavailable("gone".to_string())),
        );
        assert!(result.unwrap_err().is_remote_unavailable());
        env.gateway.shutdown();
    }
}
